//! Configuration for the WaveFlow vocoder.
//!
//! Defaults match the reference LJSpeech model (8 flows, 16 groups, 64
//! residual channels, 80-band mels at 22.05 kHz with 256× upsampling).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// What to do with the raw log-scale predicted by a coupling network.
///
/// `exp(log_s)` overflows f32 once `log_s` passes ~88, and the inverse
/// applies `exp(-log_s)`. The policy is applied before the affine transform,
/// so forward, loss and inverse all see the same value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LogScalePolicy {
    /// Use the raw prediction; overflow shows up as inf/NaN.
    Propagate,
    /// Clamp to `[-max_abs, max_abs]`.
    Clamp { max_abs: f64 },
}

impl Default for LogScalePolicy {
    fn default() -> Self {
        LogScalePolicy::Clamp { max_abs: 20.0 }
    }
}

/// Model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveFlowConfig {
    /// Number of coupling flow steps.
    #[serde(default = "default_n_flows")]
    pub n_flows: usize,

    /// Consecutive samples packed per column; must be even.
    #[serde(default = "default_n_group")]
    pub n_group: usize,

    /// Dilated residual layers per coupling network.
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,

    /// Residual channels per coupling network.
    #[serde(default = "default_n_channels")]
    pub n_channels: usize,

    /// Kernel size along the group (height) axis.
    #[serde(default = "default_kernel_size")]
    pub kernel_h: usize,

    /// Kernel size along the time (width) axis; must be odd.
    #[serde(default = "default_kernel_size")]
    pub kernel_w: usize,

    /// Mel bands of the conditioning spectrogram.
    #[serde(default = "default_mel_bands")]
    pub mel_bands: usize,

    /// Standard deviation of the Gaussian prior.
    #[serde(default = "default_sigma")]
    pub sigma: f64,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Time-axis strides of the conditioner; their product is the hop length.
    #[serde(default = "default_upsample_factors")]
    pub upsample_factors: Vec<usize>,

    #[serde(default)]
    pub log_scale: LogScalePolicy,

    /// Explicit group permutation per flow step. `None` selects the
    /// reference schedule.
    #[serde(default)]
    pub permutations: Option<Vec<Vec<usize>>>,
}

impl Default for WaveFlowConfig {
    fn default() -> Self {
        Self {
            n_flows: default_n_flows(),
            n_group: default_n_group(),
            n_layers: default_n_layers(),
            n_channels: default_n_channels(),
            kernel_h: default_kernel_size(),
            kernel_w: default_kernel_size(),
            mel_bands: default_mel_bands(),
            sigma: default_sigma(),
            sample_rate: default_sample_rate(),
            upsample_factors: default_upsample_factors(),
            log_scale: LogScalePolicy::default(),
            permutations: None,
        }
    }
}

impl WaveFlowConfig {
    /// Read a JSON config; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Samples per mel frame (product of the upsample factors).
    pub fn hop_length(&self) -> usize {
        self.upsample_factors.iter().product()
    }

    /// Height dilations for the coupling layers, truncated to `n_layers`.
    pub fn dilations_h(&self) -> Result<Vec<usize>> {
        let schedule = dilation_schedule(self.n_group)?;
        if self.n_layers > schedule.len() {
            return Err(Error::Config(format!(
                "n_layers = {} exceeds the {} dilations defined for n_group = {}",
                self.n_layers,
                schedule.len(),
                self.n_group
            )));
        }
        Ok(schedule[..self.n_layers].to_vec())
    }

    /// Check every construction-time invariant.
    pub fn validate(&self) -> Result<()> {
        if self.n_group < 2 || self.n_group % 2 != 0 {
            return Err(Error::Config(format!(
                "n_group must be even and >= 2, got {}",
                self.n_group
            )));
        }
        if self.n_flows == 0 {
            return Err(Error::Config("n_flows must be >= 1".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::Config("n_layers must be >= 1".into()));
        }
        self.dilations_h()?;
        if self.n_channels == 0 || self.mel_bands == 0 {
            return Err(Error::Config(
                "n_channels and mel_bands must be >= 1".into(),
            ));
        }
        if self.kernel_h == 0 {
            return Err(Error::Config("kernel_h must be >= 1".into()));
        }
        if self.kernel_w % 2 == 0 {
            return Err(Error::Config(format!(
                "kernel_w must be odd to keep the time length, got {}",
                self.kernel_w
            )));
        }
        if self.sigma.is_nan() || self.sigma <= 0.0 {
            return Err(Error::Config(format!("sigma must be > 0, got {}", self.sigma)));
        }
        if self.upsample_factors.is_empty() || self.upsample_factors.contains(&0) {
            return Err(Error::Config(format!(
                "upsample_factors must be non-empty and positive, got {:?}",
                self.upsample_factors
            )));
        }
        if let LogScalePolicy::Clamp { max_abs } = self.log_scale
            && (max_abs.is_nan() || max_abs <= 0.0)
        {
            return Err(Error::Config(format!(
                "log-scale clamp must be > 0, got {max_abs}"
            )));
        }
        crate::model::permutation::PermutationSchedule::from_config(
            self.permutations.as_deref(),
            self.n_flows,
            self.n_group,
        )?;
        Ok(())
    }
}

/// Height dilations per layer, keyed by `n_group`.
///
/// The receptive field along the group axis, `(kernel_h - 1) * sum + 1`,
/// covers the group for `kernel_h = 3`.
pub fn dilation_schedule(n_group: usize) -> Result<&'static [usize]> {
    match n_group {
        8 | 16 => Ok(&[1, 1, 1, 1, 1, 1, 1, 1]),
        32 => Ok(&[1, 2, 4, 1, 2, 4, 1, 2]),
        64 => Ok(&[1, 2, 4, 8, 16, 1, 2, 4]),
        128 => Ok(&[1, 2, 4, 8, 16, 32, 64, 1]),
        _ => Err(Error::Config(format!(
            "no dilation schedule for n_group = {n_group} (supported: 8, 16, 32, 64, 128)"
        ))),
    }
}

/// Optimizer settings for [`crate::train::Trainer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_beta1")]
    pub beta1: f64,

    #[serde(default = "default_beta2")]
    pub beta2: f64,

    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Decoupled weight decay; 0 gives plain Adam.
    #[serde(default)]
    pub weight_decay: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

fn default_n_flows() -> usize {
    8
}

fn default_n_group() -> usize {
    16
}

fn default_n_layers() -> usize {
    8
}

fn default_n_channels() -> usize {
    64
}

fn default_kernel_size() -> usize {
    3
}

fn default_mel_bands() -> usize {
    80
}

fn default_sigma() -> f64 {
    1.0
}

fn default_sample_rate() -> u32 {
    22050
}

fn default_upsample_factors() -> Vec<usize> {
    vec![16, 16]
}

fn default_learning_rate() -> f64 {
    2e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = WaveFlowConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.n_flows, 8);
        assert_eq!(cfg.n_group, 16);
        assert_eq!(cfg.hop_length(), 256);
        assert_eq!(cfg.dilations_h().unwrap(), vec![1; 8]);
    }

    #[test]
    fn odd_n_group_rejected() {
        let cfg = WaveFlowConfig {
            n_group: 15,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_n_group_rejected() {
        let cfg = WaveFlowConfig {
            n_group: 24,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        assert!(dilation_schedule(24).is_err());
    }

    #[test]
    fn too_many_layers_rejected() {
        let cfg = WaveFlowConfig {
            n_layers: 9,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn even_kernel_w_rejected() {
        let cfg = WaveFlowConfig {
            kernel_w: 4,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dilation_receptive_field_covers_group() {
        for n_group in [8, 16, 32, 64, 128] {
            let dilations = dilation_schedule(n_group).unwrap();
            let field = 2 * dilations.iter().sum::<usize>() + 1;
            assert!(field >= n_group, "n_group={n_group}: field {field}");
        }
    }

    #[test]
    fn permutation_count_must_match_flows() {
        let cfg = WaveFlowConfig {
            n_flows: 2,
            n_group: 8,
            permutations: Some(vec![(0..8).rev().collect()]),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_defaults_fill_missing_fields() {
        let cfg: WaveFlowConfig =
            serde_json::from_str(r#"{"n_group": 8, "log_scale": {"kind": "propagate"}}"#)
                .unwrap();
        assert_eq!(cfg.n_group, 8);
        assert_eq!(cfg.n_flows, 8);
        assert_eq!(cfg.log_scale, LogScalePolicy::Propagate);
        cfg.validate().unwrap();
    }

    #[test]
    fn train_config_defaults() {
        let cfg = TrainConfig::default();
        assert!((cfg.learning_rate - 2e-4).abs() < 1e-12);
        assert_eq!(cfg.weight_decay, 0.0);
    }
}
