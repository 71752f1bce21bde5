//! End-to-end vocoder.
//!
//! Bundles the model, its parameters and the matching mel front end:
//! 1. Compute (or load) a log-mel spectrogram
//! 2. Sample a Gaussian latent and invert the flow
//! 3. Hand back float samples, ready for 16-bit PCM
//!
//! Also scores waveforms by their per-sample negative log-likelihood.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::audio::{MelConfig, MelSpectrogram, to_pcm16};
use crate::config::WaveFlowConfig;
use crate::loss::WaveFlowLoss;
use crate::model::WaveFlow;
use crate::{Error, Result};

/// One synthesized waveform.
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    /// Mono samples, nominally in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl GeneratedAudio {
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn pcm16(&self) -> Vec<i16> {
        to_pcm16(&self.samples)
    }
}

/// Config, parameters, model and mel front end on one device.
pub struct Vocoder {
    config: WaveFlowConfig,
    varmap: VarMap,
    model: WaveFlow,
    mel: MelSpectrogram,
    device: Device,
}

impl Vocoder {
    /// Freshly initialised parameters.
    pub fn fresh(config: WaveFlowConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let model = WaveFlow::fresh(&config, &varmap, DType::F32, device)?;
        Self::assemble(config, varmap, model, device)
    }

    /// Parameters from a safetensors file written by [`Self::save`] or
    /// [`crate::checkpoint::save_checkpoint`].
    pub fn load(config: WaveFlowConfig, weights: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let weights = weights.as_ref();
        if !weights.exists() {
            return Err(Error::Checkpoint(format!("{} not found", weights.display())));
        }
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = WaveFlow::new(&config, vb)?;
        varmap.load(weights)?;
        tracing::info!("Loaded WaveFlow weights from {}", weights.display());
        Self::assemble(config, varmap, model, device)
    }

    fn assemble(
        config: WaveFlowConfig,
        varmap: VarMap,
        model: WaveFlow,
        device: &Device,
    ) -> Result<Self> {
        let mel = MelSpectrogram::new(MelConfig::for_model(&config))?;
        Ok(Self {
            config,
            varmap,
            model,
            mel,
            device: device.clone(),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path.as_ref())?;
        tracing::info!("Saved WaveFlow weights to {}", path.as_ref().display());
        Ok(())
    }

    pub fn config(&self) -> &WaveFlowConfig {
        &self.config
    }

    pub fn model(&self) -> &WaveFlow {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// `[1, mel_bands, frames]` log-mel of mono samples at the model rate.
    pub fn mel(&self, samples: &[f32]) -> Result<Tensor> {
        self.mel.to_tensor(samples, &self.device)
    }

    /// Synthesize one waveform per batch item of `mel` (`[M, F]` or `[B, M, F]`).
    pub fn synthesize(
        &self,
        mel: &Tensor,
        sigma: f64,
        seed: Option<u64>,
    ) -> Result<Vec<GeneratedAudio>> {
        let mel = batched_mel(mel)?
            .to_device(&self.device)?
            .to_dtype(DType::F32)?;
        let audio = self.model.synthesize(&mel, sigma, seed)?;
        Ok(audio
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?
            .into_iter()
            .map(|samples| GeneratedAudio {
                samples,
                sample_rate: self.config.sample_rate,
            })
            .collect())
    }

    /// Copy synthesis: compute the mel of `samples` and vocode it back.
    pub fn resynthesize(
        &self,
        samples: &[f32],
        sigma: f64,
        seed: Option<u64>,
    ) -> Result<GeneratedAudio> {
        let mel = self.mel(samples)?;
        self.synthesize(&mel, sigma, seed)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Audio("synthesis returned no audio".into()))
    }

    /// Per-sample negative log-likelihood of `samples` under their own mel.
    pub fn score(&self, samples: &[f32]) -> Result<f32> {
        let mel = self.mel(samples)?;
        let audio = Tensor::from_slice(samples, (1, samples.len()), &self.device)?;
        let output = self.model.forward(&audio, &mel)?;
        WaveFlowLoss::new(self.config.sigma).value(&output)
    }
}

/// Read a mel spectrogram from `.npy` or `.safetensors` (tensor `mel`),
/// returned as `[B, M, F]`.
pub fn load_mel(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let path = path.as_ref();
    let mel = match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => Tensor::read_npy(path)?,
        Some("safetensors") => {
            let mut tensors = candle_core::safetensors::load(path, device)?;
            tensors.remove("mel").ok_or_else(|| {
                Error::Audio(format!("{} has no tensor named \"mel\"", path.display()))
            })?
        }
        _ => {
            return Err(Error::Audio(format!(
                "unsupported mel file {} (expected .npy or .safetensors)",
                path.display()
            )));
        }
    };
    batched_mel(&mel)?
        .to_device(device)?
        .to_dtype(DType::F32)
        .map_err(Error::from)
}

/// `[M, F]` → `[1, M, F]`; `[B, M, F]` unchanged.
fn batched_mel(mel: &Tensor) -> Result<Tensor> {
    match mel.rank() {
        2 => Ok(mel.unsqueeze(0)?),
        3 => Ok(mel.clone()),
        _ => Err(Error::Precondition(format!(
            "mel must be [M, F] or [B, M, F], got {:?}",
            mel.dims()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> WaveFlowConfig {
        WaveFlowConfig {
            n_flows: 2,
            n_group: 8,
            n_layers: 2,
            n_channels: 4,
            mel_bands: 8,
            sample_rate: 16000,
            upsample_factors: vec![4, 4],
            ..Default::default()
        }
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 300.0 * i as f32 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn synthesize_from_2d_mel() {
        let vocoder = Vocoder::fresh(small_config(), &Device::Cpu).unwrap();
        let mel = Tensor::randn(0f32, 1.0, (8, 3), &Device::Cpu).unwrap();
        let audio = vocoder.synthesize(&mel, 1.0, Some(0)).unwrap();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].samples.len(), 48);
        assert_eq!(audio[0].sample_rate, 16000);
        assert!((audio[0].duration_s() - 0.003).abs() < 1e-9);
    }

    #[test]
    fn synthesize_batch_of_mels() {
        let vocoder = Vocoder::fresh(small_config(), &Device::Cpu).unwrap();
        let mel = Tensor::randn(0f32, 1.0, (2, 8, 3), &Device::Cpu).unwrap();
        let audio = vocoder.synthesize(&mel, 1.0, Some(1)).unwrap();
        assert_eq!(audio.len(), 2);
        for item in &audio {
            assert_eq!(item.samples.len(), 48);
            assert_eq!(item.pcm16().len(), 48);
        }
    }

    #[test]
    fn resynthesis_covers_the_input() {
        let vocoder = Vocoder::fresh(small_config(), &Device::Cpu).unwrap();
        let samples = tone(200);
        // 200 / 16 + 1 = 13 frames → 208 samples.
        let audio = vocoder.resynthesize(&samples, 0.5, Some(3)).unwrap();
        assert_eq!(audio.samples.len(), 208);
        assert!(audio.samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn score_is_finite_and_above_floor() {
        let vocoder = Vocoder::fresh(small_config(), &Device::Cpu).unwrap();
        let nll = vocoder.score(&tone(256)).unwrap();
        assert!(nll.is_finite());
        // A fresh model is the identity, so the score is the Gaussian NLL of
        // the samples themselves: constant + mean(x^2) / 2.
        let samples = tone(256);
        let energy = samples.iter().map(|s| s * s).sum::<f32>() / 256.0 / 2.0;
        let expected = WaveFlowLoss::new(1.0).constant() as f32 + energy;
        assert!((nll - expected).abs() < 1e-4, "{nll} vs {expected}");
    }

    #[test]
    fn save_and_load_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let original = Vocoder::fresh(small_config(), &Device::Cpu).unwrap();
        original.save(&path).unwrap();
        let loaded = Vocoder::load(small_config(), &path, &Device::Cpu).unwrap();

        let mel = Tensor::randn(0f32, 1.0, (1, 8, 2), &Device::Cpu).unwrap();
        let a = original.synthesize(&mel, 1.0, Some(5)).unwrap();
        let b = loaded.synthesize(&mel, 1.0, Some(5)).unwrap();
        assert_eq!(a[0].samples, b[0].samples);

        assert!(Vocoder::load(small_config(), dir.path().join("missing"), &Device::Cpu).is_err());
    }

    #[test]
    fn mel_files_load_as_batches() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let mel = Tensor::randn(0f32, 1.0, (8, 5), &device).unwrap();

        let npy = dir.path().join("m.npy");
        mel.write_npy(&npy).unwrap();
        assert_eq!(load_mel(&npy, &device).unwrap().dims(), &[1, 8, 5]);

        let st = dir.path().join("m.safetensors");
        let tensors = std::collections::HashMap::from([("mel".to_string(), mel.clone())]);
        candle_core::safetensors::save(&tensors, &st).unwrap();
        assert_eq!(load_mel(&st, &device).unwrap().dims(), &[1, 8, 5]);

        assert!(load_mel(dir.path().join("m.txt"), &device).is_err());
    }
}
