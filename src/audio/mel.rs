//! Log-mel spectrogram used to condition the vocoder.
//!
//! Defaults follow the LJSpeech recipe the reference model was trained on:
//! - Sample rate: 22050 Hz
//! - FFT size / window: 1024, Hann
//! - Hop length: 256 (equal to the conditioner's upsampling product)
//! - Mel bins: 80, range 0–8000 Hz, Slaney scale and area norm
//! - Padding: centred, reflect `n_fft / 2` on both sides
//! - Log compression: `ln(max(mel, 1e-5))` on the magnitude spectrum
//!
//! Centring gives `T / hop + 1` frames, so the upsampled mel always covers
//! the waveform it was computed from.

use candle_core::{Device, Tensor};
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

use crate::config::WaveFlowConfig;
use crate::{Error, Result};

/// Configuration for the mel spectrogram.
#[derive(Debug, Clone)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            n_fft: 1024,
            win_length: 1024,
            hop_length: 256,
            n_mels: 80,
            f_min: 0.0,
            f_max: 8000.0,
        }
    }
}

impl MelConfig {
    /// Defaults with rate, hop and band count taken from the model.
    pub fn for_model(config: &WaveFlowConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            hop_length: config.hop_length(),
            n_mels: config.mel_bands,
            ..Default::default()
        }
    }
}

/// Mel spectrogram processor.
///
/// Pre-computes the Hann window, FFT plan, and mel filterbank on construction.
pub struct MelSpectrogram {
    config: MelConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: std::sync::Arc<dyn rustfft::Fft<f64>>,
}

impl std::fmt::Debug for MelSpectrogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelSpectrogram")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Result<Self> {
        if config.win_length > config.n_fft || config.hop_length == 0 || config.n_mels == 0 {
            return Err(Error::Audio(format!("invalid mel config: {config:?}")));
        }
        if config.f_max > config.sample_rate as f64 / 2.0 || config.f_min >= config.f_max {
            return Err(Error::Audio(format!(
                "mel range {}..{} Hz does not fit sample rate {}",
                config.f_min, config.f_max, config.sample_rate
            )));
        }
        // Shorter windows are centred inside the FFT frame.
        let mut window = vec![0.0; config.n_fft];
        let offset = (config.n_fft - config.win_length) / 2;
        window[offset..offset + config.win_length].copy_from_slice(&hann_window(config.win_length));
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        let fft = FftPlanner::<f64>::new().plan_fft_forward(config.n_fft);

        Ok(Self {
            config,
            window,
            filterbank,
            fft,
        })
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Frames produced for `samples` input samples.
    pub fn num_frames(&self, samples: usize) -> usize {
        samples / self.config.hop_length + 1
    }

    /// Log-mel spectrogram `[n_mels][frames]` of mono audio.
    pub fn process(&self, samples: &[f32]) -> Result<Vec<Vec<f32>>> {
        if samples.len() < 2 {
            return Err(Error::Audio(format!(
                "need at least 2 samples for a spectrogram, got {}",
                samples.len()
            )));
        }
        let samples_f64: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let pad = self.config.n_fft / 2;
        let padded = reflect_pad(&samples_f64, pad, pad);

        let magnitudes = self.stft(&padded);
        let num_frames = magnitudes.len();
        let mut mel_spec = vec![vec![0.0f32; num_frames]; self.config.n_mels];
        for (frame_idx, frame_magnitudes) in magnitudes.iter().enumerate() {
            for (mel_idx, filter) in self.filterbank.iter().enumerate() {
                let sum: f64 = filter
                    .iter()
                    .zip(frame_magnitudes)
                    .filter(|(w, _)| **w > 0.0)
                    .map(|(w, m)| w * m)
                    .sum();
                mel_spec[mel_idx][frame_idx] = sum.max(1e-5).ln() as f32;
            }
        }
        Ok(mel_spec)
    }

    /// Log-mel spectrogram as a `[1, n_mels, frames]` tensor.
    pub fn to_tensor(&self, samples: &[f32], device: &Device) -> Result<Tensor> {
        let mel = self.process(samples)?;
        let frames = mel[0].len();
        let flat: Vec<f32> = mel.into_iter().flatten().collect();
        Ok(Tensor::from_vec(flat, (1, self.config.n_mels, frames), device)?)
    }

    /// One-sided magnitude spectra per frame, `n_fft / 2 + 1` bins each.
    fn stft(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;
        let num_frames = padded.len().saturating_sub(n_fft) / hop + 1;

        let mut frames = Vec::with_capacity(num_frames);
        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;
            if start + n_fft > padded.len() {
                break;
            }
            let mut buffer: Vec<Complex<f64>> = (0..n_fft)
                .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                .collect();
            self.fft.process(&mut buffer);
            frames.push(buffer[..num_bins].iter().map(|c| c.norm()).collect());
        }
        frames
    }
}

/// Periodic Hann window.
fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect-pad without repeating the edge sample. Pads longer than the
/// signal clamp to its ends.
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(pad_left + len + pad_right);
    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }
    padded.extend_from_slice(signal);
    for i in 0..pad_right {
        padded.push(signal[len.saturating_sub(2 + i)]);
    }
    padded
}

/// Slaney-normalised triangular filters, `n_mels` rows of `n_fft/2 + 1`.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;
    let mel_min = hz_to_mel_slaney(f_min);
    let mel_max = hz_to_mel_slaney(f_max);
    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();
    let bin_freqs: Vec<f64> = (0..num_bins).map(|i| sr * i as f64 / n_fft as f64).collect();

    hz_points
        .windows(3)
        .map(|edges| {
            let (f_left, f_center, f_right) = (edges[0], edges[1], edges[2]);
            let norm = 2.0 / (f_right - f_left);
            bin_freqs
                .iter()
                .map(|&f| {
                    if f < f_left || f > f_right {
                        0.0
                    } else if f <= f_center {
                        norm * (f - f_left) / (f_center - f_left)
                    } else {
                        norm * (f_right - f) / (f_right - f_center)
                    }
                })
                .collect()
        })
        .collect()
}

/// Linear below 1 kHz, logarithmic above.
fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4_f64).ln()
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4_f64).ln() / 27.0).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mel_conversion_roundtrip() {
        for freq in [0.0, 100.0, 440.0, 1000.0, 4000.0, 8000.0] {
            let back = mel_to_hz_slaney(hz_to_mel_slaney(freq));
            assert!((freq - back).abs() < 0.01, "{freq} Hz came back as {back}");
        }
    }

    #[test]
    fn filterbank_shape_and_coverage() {
        let fb = mel_filterbank(1024, 80, 22050, 0.0, 8000.0);
        assert_eq!(fb.len(), 80);
        assert_eq!(fb[0].len(), 513);
        for (i, filter) in fb.iter().enumerate() {
            assert!(filter.iter().all(|&w| w >= 0.0));
            assert!(filter.iter().sum::<f64>() > 0.0, "filter {i} is empty");
        }
    }

    #[test]
    fn reflect_pad_basic() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0, 5.0], 2, 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn centred_frames_cover_the_signal() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        for len in [2, 255, 256, 22050] {
            let spec = mel.process(&vec![0.0; len]).unwrap();
            assert_eq!(spec.len(), 80);
            assert_eq!(spec[0].len(), mel.num_frames(len), "len {len}");
            assert!(spec[0].len() * 256 >= len);
        }
    }

    #[test]
    fn silence_hits_the_floor() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        let spec = mel.process(&vec![0.0; 1024]).unwrap();
        let floor = 1e-5f64.ln() as f32;
        assert!(spec.iter().flatten().all(|&v| (v - floor).abs() < 1e-6));
    }

    #[test]
    fn sine_energy_lands_in_its_band() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        let samples: Vec<f32> = (0..4096)
            .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 22050.0).sin() as f32)
            .collect();
        let spec = mel.process(&samples).unwrap();
        let frame = spec[0].len() / 2;
        let loudest = (0..80)
            .max_by(|&a, &b| spec[a][frame].total_cmp(&spec[b][frame]))
            .unwrap();
        // Below 1 kHz the filters are ~37 Hz apart; band 11 is centred at ~447 Hz.
        assert!((9..=13).contains(&loudest), "loudest band {loudest}");
    }

    #[test]
    fn tensor_layout() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        let t = mel.to_tensor(&vec![0.1; 1000], &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 80, 4]);
    }

    #[test]
    fn rejects_range_above_nyquist() {
        let config = MelConfig {
            f_max: 12000.0,
            ..Default::default()
        };
        assert!(MelSpectrogram::new(config).is_err());
        assert!(MelSpectrogram::new(MelConfig::default()).is_ok());
    }
}
