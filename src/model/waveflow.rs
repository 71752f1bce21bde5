//! WaveFlow: conditioner plus a stack of coupling flows and permutations.
//!
//! ## Layout
//!
//! A waveform `[B, T]` is folded into `[B, 1, n_group, T / n_group]`: column
//! `w` holds samples `w*G .. (w+1)*G`, so the height axis is the position
//! inside a group. The upsampled mel `[B, M, T]` is folded the same way.
//!
//! ## Forward (density estimation)
//!
//! ```text
//! for each flow i:
//!     log_s, b = flow_i(audio[:, :, :-1], mel[:, :, 1:])
//!     audio    = cat(audio[:, :, :1], audio[:, :, 1:] * exp(log_s) + b)
//!     audio, mel = perm_i(audio), perm_i(mel)
//! z = audio.squeeze(1)
//! ```
//!
//! Every row is computed in one parallel pass. Inversion has to recover
//! rows one at a time, see [`SynthesisSession`].

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use super::conditioner::Conditioner;
use super::conv::init_weight_norm_gains;
use super::flow::{AffineCouplingFlow, affine_forward, affine_inverse};
use super::permutation::PermutationSchedule;
use super::session::SynthesisSession;
use crate::config::WaveFlowConfig;
use crate::{Error, Result};

/// Result of the forward pass.
#[derive(Debug, Clone)]
pub struct FlowOutput {
    /// Latent, `[B, n_group, T / n_group]`.
    pub z: Tensor,
    /// One `[B, 1, n_group - 1, T / n_group]` log-scale per flow, in flow order.
    pub log_s: Vec<Tensor>,
}

/// The full invertible model.
#[derive(Debug, Clone)]
pub struct WaveFlow {
    config: WaveFlowConfig,
    conditioner: Conditioner,
    flows: Vec<AffineCouplingFlow>,
    permutations: PermutationSchedule,
}

impl WaveFlow {
    /// Build the model, reading or creating parameters through `vb`.
    ///
    /// Parameter names: `conditioner.upsample.{i}.*`,
    /// `flows.{i}.{start,in_layers.{l},cond_layers.{l},res_skip_layers.{l},end}.*`.
    pub fn new(config: &WaveFlowConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let conditioner = Conditioner::new(&config.upsample_factors, vb.pp("conditioner"))?;
        let flows = (0..config.n_flows)
            .map(|i| AffineCouplingFlow::new(config, vb.pp(format!("flows.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let permutations = PermutationSchedule::from_config(
            config.permutations.as_deref(),
            config.n_flows,
            config.n_group,
        )?;
        if !permutations.covers_all_orderings() {
            tracing::warn!(
                "permutation schedule leaves some row pairs unordered; roots per flow: {:?}",
                permutations.root_rows()
            );
        }
        tracing::info!(
            "WaveFlow: {} flows x {} layers, n_group={}, channels={}, hop={}",
            config.n_flows,
            config.n_layers,
            config.n_group,
            config.n_channels,
            config.hop_length()
        );
        Ok(Self {
            config: config.clone(),
            conditioner,
            flows,
            permutations,
        })
    }

    /// Build with freshly initialised parameters stored in `varmap`.
    pub fn fresh(
        config: &WaveFlowConfig,
        varmap: &VarMap,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, dtype, device);
        let model = Self::new(config, vb)?;
        let gains = init_weight_norm_gains(varmap)?;
        tracing::debug!("initialised {gains} weight-norm gains");
        Ok(model)
    }

    pub fn config(&self) -> &WaveFlowConfig {
        &self.config
    }

    pub fn flows(&self) -> &[AffineCouplingFlow] {
        &self.flows
    }

    pub fn permutations(&self) -> &PermutationSchedule {
        &self.permutations
    }

    /// Density estimation: `audio [B, T]`, `mel [B, mel_bands, F]`.
    ///
    /// `T` is truncated to a multiple of `n_group`; the upsampled mel must
    /// be at least `T` samples long.
    pub fn forward(&self, audio: &Tensor, mel: &Tensor) -> Result<FlowOutput> {
        let (batch, samples) = audio.dims2()?;
        let g = self.config.n_group;
        let width = samples / g;
        if width == 0 {
            return Err(Error::Precondition(format!(
                "audio has {samples} samples, fewer than n_group = {g}"
            )));
        }
        self.check_mel(mel, batch)?;
        let mut cond = self.upsampled_groups(mel, width)?;
        let mut audio = group_audio(&audio.narrow(1, 0, width * g)?, g)?;

        let mut log_s_list = Vec::with_capacity(self.flows.len());
        for (i, flow) in self.flows.iter().enumerate() {
            let inputs = audio.narrow(2, 0, g - 1)?;
            let conds = cond.narrow(2, 1, g - 1)?;
            let (log_s, bias) = flow.forward(&inputs, &conds)?;
            let moved = affine_forward(&audio.narrow(2, 1, g - 1)?, &log_s, &bias)?;
            audio = Tensor::cat(&[audio.narrow(2, 0, 1)?, moved], 2)?;
            audio = self.permutations.apply(i, &audio)?;
            cond = self.permutations.apply(i, &cond)?;
            log_s_list.push(log_s);
        }

        Ok(FlowOutput {
            z: audio.squeeze(1)?,
            log_s: log_s_list,
        })
    }

    /// Cached inversion of `z [B, n_group, W]` under `mel [B, mel_bands, F]`.
    /// Returns audio `[B, n_group * W]`.
    pub fn reverse(&self, z: &Tensor, mel: &Tensor) -> Result<Tensor> {
        self.session()?.reverse(z, mel)
    }

    /// Inversion that recomputes every flow over the whole recovered prefix
    /// for each row. Quadratic in `n_group`; kept as the reference that the
    /// cached session is checked against.
    pub fn reverse_uncached(&self, z: &Tensor, mel: &Tensor) -> Result<Tensor> {
        let (batch, g, width) = self.check_latent(z)?;
        self.check_mel(mel, batch)?;

        // Conditioning seen by each flow in the forward direction.
        let mut conds = Vec::with_capacity(self.flows.len());
        let mut cond = self.upsampled_groups(mel, width)?;
        for i in 0..self.flows.len() {
            let next = self.permutations.apply(i, &cond)?;
            conds.push(cond);
            cond = next;
        }

        let mut audio = z.unsqueeze(1)?;
        for (i, flow) in self.flows.iter().enumerate().rev() {
            audio = self.permutations.invert(i, &audio)?;
            let weights = flow.resolve()?;
            let mut rows = vec![audio.narrow(2, 0, 1)?];
            for r in 1..g {
                let prefix = Tensor::cat(&rows, 2)?;
                let (log_s, bias) = weights.forward(&prefix, &conds[i].narrow(2, 1, r)?)?;
                let row = affine_inverse(
                    &audio.narrow(2, r, 1)?,
                    &log_s.narrow(2, r - 1, 1)?,
                    &bias.narrow(2, r - 1, 1)?,
                )?;
                rows.push(row);
            }
            audio = Tensor::cat(&rows, 2)?;
        }
        ungroup_audio(&audio)
    }

    /// Sample `z ~ N(0, sigma^2)` and invert it. `mel [B, mel_bands, F]`
    /// gives `F * hop` samples (rounded down to a multiple of `n_group`).
    ///
    /// With `seed` the noise is reproducible across runs and devices.
    pub fn synthesize(&self, mel: &Tensor, sigma: f64, seed: Option<u64>) -> Result<Tensor> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(Error::Precondition(format!(
                "sigma must be positive and finite, got {sigma}"
            )));
        }
        let start = Instant::now();
        let (batch, _, frames) = mel.dims3()?;
        let width = frames * self.config.hop_length() / self.config.n_group;
        if width == 0 {
            return Err(Error::Precondition(format!(
                "{frames} mel frames upsample to fewer than n_group = {} samples",
                self.config.n_group
            )));
        }
        let z = sample_latent(
            (batch, self.config.n_group, width),
            sigma,
            seed,
            mel.dtype(),
            mel.device(),
        )?;
        let audio = self.reverse(&z, mel)?;
        let elapsed = start.elapsed().as_secs_f64();
        let seconds = audio.dim(1)? as f64 / self.config.sample_rate as f64;
        tracing::info!(
            "Synthesized {batch}x{seconds:.2}s in {elapsed:.2}s ({:.1}x realtime)",
            seconds * batch as f64 / elapsed.max(1e-9)
        );
        Ok(audio)
    }

    /// Inference session with weights resolved once.
    pub fn session(&self) -> Result<SynthesisSession<'_>> {
        SynthesisSession::new(self)
    }

    /// Upsample `mel` and fold its first `width * n_group` samples into
    /// `[B, M, n_group, width]`.
    pub(crate) fn upsampled_groups(&self, mel: &Tensor, width: usize) -> Result<Tensor> {
        let g = self.config.n_group;
        let upsampled = self.conditioner.forward(mel)?;
        let available = upsampled.dim(2)?;
        if available < width * g {
            return Err(Error::Precondition(format!(
                "upsampled mel has {available} samples, audio needs {}",
                width * g
            )));
        }
        group_mel(&upsampled.narrow(2, 0, width * g)?, g)
    }

    pub(crate) fn check_mel(&self, mel: &Tensor, batch: usize) -> Result<()> {
        let (mel_batch, bands, _) = mel.dims3()?;
        if mel_batch != batch || bands != self.config.mel_bands {
            return Err(Error::Precondition(format!(
                "mel is {:?}, expected [{batch}, {}, frames]",
                mel.dims(),
                self.config.mel_bands
            )));
        }
        Ok(())
    }

    /// Returns `(batch, n_group, width)`.
    pub(crate) fn check_latent(&self, z: &Tensor) -> Result<(usize, usize, usize)> {
        let (batch, g, width) = z.dims3()?;
        if g != self.config.n_group || width == 0 {
            return Err(Error::Precondition(format!(
                "latent is {:?}, expected [batch, {}, width > 0]",
                z.dims(),
                self.config.n_group
            )));
        }
        Ok((batch, g, width))
    }
}

/// `[B, T]` → `[B, 1, G, T / G]`; `T` must be a multiple of `G`.
pub fn group_audio(audio: &Tensor, n_group: usize) -> Result<Tensor> {
    let (b, t) = audio.dims2()?;
    Ok(audio
        .reshape((b, t / n_group, n_group))?
        .transpose(1, 2)?
        .unsqueeze(1)?
        .contiguous()?)
}

/// `[B, M, T]` → `[B, M, G, T / G]`; `T` must be a multiple of `G`.
pub fn group_mel(mel: &Tensor, n_group: usize) -> Result<Tensor> {
    let (b, m, t) = mel.dims3()?;
    Ok(mel
        .reshape((b, m, t / n_group, n_group))?
        .transpose(2, 3)?
        .contiguous()?)
}

/// `[B, 1, G, W]` → `[B, W * G]`, the inverse of [`group_audio`].
pub fn ungroup_audio(audio: &Tensor) -> Result<Tensor> {
    let (b, _, g, w) = audio.dims4()?;
    Ok(audio.squeeze(1)?.transpose(1, 2)?.reshape((b, w * g))?)
}

/// Gaussian latent of the given shape with standard deviation `sigma`.
pub fn sample_latent(
    shape: (usize, usize, usize),
    sigma: f64,
    seed: Option<u64>,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let z = match seed {
        Some(seed) => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let count = shape.0 * shape.1 * shape.2;
            let noise: Vec<f32> = (0..count)
                .map(|_| {
                    let x: f32 = StandardNormal.sample(&mut rng);
                    x * sigma as f32
                })
                .collect();
            Tensor::from_vec(noise, shape, device)?
        }
        None => Tensor::randn(0f32, sigma as f32, shape, device)?,
    };
    Ok(z.to_dtype(dtype)?)
}
