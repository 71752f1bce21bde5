//! Model components for WaveFlow.
//!
//! ## Components
//!
//! - [`conv`]: weight-normalised convolutions with per-axis dilation
//! - [`conditioner`]: mel upsampler (frames → samples)
//! - [`flow`]: affine coupling network and the affine transform pair
//! - [`permutation`]: group-row reordering between flows
//! - [`waveflow`]: the full flow stack (forward, inverse, sampling)
//! - [`session`]: cached row-by-row inversion

pub mod conditioner;
pub mod conv;
pub mod flow;
pub mod permutation;
pub mod session;
pub mod waveflow;

pub use waveflow::{FlowOutput, WaveFlow};
