//! Audio front and back end.
//!
//! WAV I/O (16-bit PCM out) and the log-mel spectrogram that conditions
//! the vocoder.

mod mel;
mod wav;

pub use mel::{MelConfig, MelSpectrogram};
pub use wav::{peak_normalize, read_wav, to_mono, to_pcm16, write_wav};
