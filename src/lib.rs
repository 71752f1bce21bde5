//! WaveFlow neural vocoder in pure Rust.
//!
//! A candle-based implementation of WaveFlow, a flow-based generative model
//! for raw audio conditioned on mel spectrograms. The forward pass maps a
//! waveform to a Gaussian latent with an exact log-determinant; the inverse
//! turns noise back into audio, autoregressively within each group of
//! samples and in parallel across groups.
//!
//! ## Architecture
//!
//! ```text
//! mel → Conditioner (transposed-conv upsampling) ─┐
//!                                                 ↓
//! audio → fold [B, 1, n_group, T/n_group] → n_flows × (affine coupling → permute) → z
//! ```
//!
//! ## Modules
//!
//! - [`audio`]: WAV I/O, PCM16 conversion, log-mel spectrogram
//! - [`model`]: conditioner, coupling flows, permutations, synthesis session
//! - [`loss`]: exact negative log-likelihood
//! - [`train`]: single training / validation step
//! - [`checkpoint`]: iteration-keyed parameter files
//! - [`pipeline`]: end-to-end vocoder

pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod loss;
pub mod model;
pub mod pipeline;
pub mod train;

mod error;

pub use error::{Error, Result};
