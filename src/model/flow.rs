//! Affine coupling flow: one invertible step of the WaveFlow stack.
//!
//! ## Architecture
//!
//! ```text
//! audio [B, 1, H, W] ─→ start: WN-Conv 1x1 (1 → C)
//!   ─→ n_layers × {
//!        pad (top (kh-1)*dh, width (kw-1)*dw/2 each side)
//!        in_layer: WN-Conv (kh, kw), dilation (dh, 2^i)    C → 2C
//!        cond_layer: WN-Conv 1x1 on mel                   M → 2C
//!        tanh(a[:C]) * sigmoid(a[C:])
//!        res_skip: WN-Conv 1x1   C → 2C (last layer: C → C)
//!        residual (all but last) + skip accumulation
//!      }
//!   ─→ end: Conv 1x1 (C → 2), zero-initialised ─→ (log_s, bias)
//! ```
//!
//! Height (the group axis) is causal: output row `r` sees input rows
//! `<= r` only. Width (time) is non-causal.

use std::collections::VecDeque;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::conv::{Conv2dTaps, ParamInit, PointwiseConv2d, WeightNormConv2d};
use crate::config::{LogScalePolicy, WaveFlowConfig};
use crate::{Error, Result};

/// `y = x * exp(log_s) + bias`.
pub fn affine_forward(xs: &Tensor, log_s: &Tensor, bias: &Tensor) -> Result<Tensor> {
    Ok((xs * log_s.exp()?)?.add(bias)?)
}

/// `x = (y - bias) * exp(-log_s)`, the exact inverse of [`affine_forward`].
pub fn affine_inverse(ys: &Tensor, log_s: &Tensor, bias: &Tensor) -> Result<Tensor> {
    Ok(ys.sub(bias)?.mul(&log_s.neg()?.exp()?)?)
}

/// Apply the configured numeric policy to a raw log-scale.
pub fn apply_log_scale_policy(log_s: &Tensor, policy: LogScalePolicy) -> Result<Tensor> {
    match policy {
        LogScalePolicy::Propagate => Ok(log_s.clone()),
        LogScalePolicy::Clamp { max_abs } => Ok(log_s.clamp(-max_abs, max_abs)?),
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ResidualLayer {
    in_layer: WeightNormConv2d,
    cond_layer: WeightNormConv2d,
    res_skip: WeightNormConv2d,
}

/// One coupling flow's parameters.
#[derive(Debug, Clone)]
pub struct AffineCouplingFlow {
    start: WeightNormConv2d,
    layers: Vec<ResidualLayer>,
    end: PointwiseConv2d,
    n_channels: usize,
    kernel: (usize, usize),
    log_scale: LogScalePolicy,
}

impl AffineCouplingFlow {
    pub fn new(config: &WaveFlowConfig, vb: VarBuilder) -> Result<Self> {
        let channels = config.n_channels;
        let kernel = (config.kernel_h, config.kernel_w);
        let dilations_h = config.dilations_h()?;

        let start = WeightNormConv2d::pointwise(
            1,
            channels,
            ParamInit::uniform_scaled(1, (1, 1)),
            vb.pp("start"),
        )?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for (i, &dilation_h) in dilations_h.iter().enumerate() {
            let dilation_w = 1 << i;
            let in_layer = WeightNormConv2d::new(
                channels,
                2 * channels,
                kernel,
                (dilation_h, dilation_w),
                ParamInit::uniform_scaled(channels, kernel),
                vb.pp(format!("in_layers.{i}")),
            )?;
            let cond_layer = WeightNormConv2d::pointwise(
                config.mel_bands,
                2 * channels,
                ParamInit::uniform_scaled(config.mel_bands, (1, 1)),
                vb.pp(format!("cond_layers.{i}")),
            )?;
            let res_skip_channels = if i + 1 < config.n_layers {
                2 * channels
            } else {
                channels
            };
            let res_skip = WeightNormConv2d::pointwise(
                channels,
                res_skip_channels,
                ParamInit::uniform_scaled(channels, (1, 1)),
                vb.pp(format!("res_skip_layers.{i}")),
            )?;
            layers.push(ResidualLayer {
                in_layer,
                cond_layer,
                res_skip,
            });
        }

        // Zero-initialised end layer: a fresh flow is the identity.
        let end = PointwiseConv2d::new(channels, 2, ParamInit::Zero, vb.pp("end"))?;

        Ok(Self {
            start,
            layers,
            end,
            n_channels: channels,
            kernel,
            log_scale: config.log_scale,
        })
    }

    /// Resolve weight-normalised parameters into directly usable weights.
    ///
    /// The result stays attached to the autodiff graph.
    pub fn resolve(&self) -> Result<FlowWeights> {
        let layers = self
            .layers
            .iter()
            .map(|layer| -> Result<LayerWeights> {
                Ok(LayerWeights {
                    in_layer: layer.in_layer.resolve()?,
                    cond_layer: layer.cond_layer.resolve()?,
                    res_skip: layer.res_skip.resolve()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FlowWeights {
            start: self.start.resolve()?,
            layers,
            end: self.end.resolve()?,
            n_channels: self.n_channels,
            kernel: self.kernel,
            log_scale: self.log_scale,
        })
    }

    /// Predict `(log_s, bias)`, each `[B, 1, H, W]`, from causal audio
    /// `[B, 1, H, W]` and aligned conditioning `[B, mel_bands, H, W]`.
    pub fn forward(&self, audio: &Tensor, mel: &Tensor) -> Result<(Tensor, Tensor)> {
        self.resolve()?.forward(audio, mel)
    }
}

// ---------------------------------------------------------------------------
// Resolved weights
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LayerWeights {
    in_layer: Conv2dTaps,
    cond_layer: Conv2dTaps,
    res_skip: Conv2dTaps,
}

/// Resolved weights of one coupling flow.
#[derive(Debug, Clone)]
pub struct FlowWeights {
    start: Conv2dTaps,
    layers: Vec<LayerWeights>,
    end: Conv2dTaps,
    n_channels: usize,
    kernel: (usize, usize),
    log_scale: LogScalePolicy,
}

impl FlowWeights {
    /// Copy cut off from the autodiff graph, for inference.
    pub fn detach(&self) -> Self {
        Self {
            start: self.start.detach(),
            layers: self
                .layers
                .iter()
                .map(|layer| LayerWeights {
                    in_layer: layer.in_layer.detach(),
                    cond_layer: layer.cond_layer.detach(),
                    res_skip: layer.res_skip.detach(),
                })
                .collect(),
            end: self.end.detach(),
            ..self.clone()
        }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Full parallel pass over every row.
    pub fn forward(&self, audio: &Tensor, mel: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, _, h, w) = audio.dims4()?;
        let (_, _, mel_h, mel_w) = mel.dims4()?;
        if (h, w) != (mel_h, mel_w) {
            return Err(Error::Precondition(format!(
                "audio rows {h}x{w} do not match conditioning {mel_h}x{mel_w}"
            )));
        }
        let cond = self.condition(mel)?;

        let (kh, kw) = self.kernel;
        let mut xs = self.start.forward(audio)?;
        let mut output: Option<Tensor> = None;
        for (layer, cond) in self.layers.iter().zip(&cond) {
            let (dh, dw) = layer.in_layer.dilation();
            let pad_w = (kw - 1) * dw / 2;
            let padded = xs
                .pad_with_zeros(2, (kh - 1) * dh, 0)?
                .pad_with_zeros(3, pad_w, pad_w)?;
            let hidden = layer.in_layer.forward(&padded)?;
            let (residual, skip) = self.gated_residual(layer, &hidden, cond)?;
            if let Some(residual) = residual {
                xs = (xs + residual)?;
            }
            output = Some(match output {
                Some(acc) => (acc + skip)?,
                None => skip,
            });
        }
        self.project(output)
    }

    /// Conditioning projection for every layer: `[B, 2C, H, W]` each.
    ///
    /// Independent of the audio, so inference computes it once per flow.
    pub fn condition(&self, mel: &Tensor) -> Result<Vec<Tensor>> {
        self.layers
            .iter()
            .map(|layer| layer.cond_layer.forward(mel))
            .collect()
    }

    /// Single-row pass for autoregressive inversion.
    ///
    /// `audio_row` is row `r` of the causal input (`[B, 1, 1, W]`),
    /// `cond_rows` the per-layer conditioning rows at `r` (`[B, 2C, 1, W]`).
    /// Rows must be pushed in order starting from 0 after
    /// [`RowCache::reset`]. Returns `(log_s, bias)` for row `r`.
    pub fn forward_row(
        &self,
        cache: &mut RowCache,
        audio_row: &Tensor,
        cond_rows: &[Tensor],
    ) -> Result<(Tensor, Tensor)> {
        if cache.windows.len() != self.layers.len() || cond_rows.len() != self.layers.len() {
            return Err(Error::Precondition(format!(
                "row pass over {} layers got {} caches and {} conditioning rows",
                self.layers.len(),
                cache.windows.len(),
                cond_rows.len()
            )));
        }
        let (kh, kw) = self.kernel;
        let mut xs = self.start.forward(audio_row)?;
        let mut output: Option<Tensor> = None;
        for ((layer, cond), window) in self
            .layers
            .iter()
            .zip(cond_rows)
            .zip(cache.windows.iter_mut())
        {
            let (dh, dw) = layer.in_layer.dilation();
            window.push_back(xs.clone());
            while window.len() > (kh - 1) * dh + 1 {
                window.pop_front();
            }
            // Tap i reads the row (kh - 1 - i) * dh back from the newest.
            let taps = (0..kh)
                .map(|i| -> Result<Tensor> {
                    let back = (kh - 1 - i) * dh;
                    match window.len().checked_sub(back + 1) {
                        Some(idx) => Ok(window[idx].clone()),
                        None => Ok(xs.zeros_like()?),
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            let pad_w = (kw - 1) * dw / 2;
            let stacked = Tensor::cat(&taps, 2)?.pad_with_zeros(3, pad_w, pad_w)?;
            let hidden = layer.in_layer.forward_dilated(&stacked, (1, dw))?;
            let (residual, skip) = self.gated_residual(layer, &hidden, cond)?;
            if let Some(residual) = residual {
                xs = (xs + residual)?;
            }
            output = Some(match output {
                Some(acc) => (acc + skip)?,
                None => skip,
            });
        }
        self.project(output)
    }

    /// Gate `hidden + cond`; returns `(residual, skip)`, residual `None` on
    /// the last layer.
    fn gated_residual(
        &self,
        layer: &LayerWeights,
        hidden: &Tensor,
        cond: &Tensor,
    ) -> Result<(Option<Tensor>, Tensor)> {
        let c = self.n_channels;
        let acts = (hidden + cond)?;
        let gated =
            (acts.narrow(1, 0, c)?.tanh()? * candle_nn::ops::sigmoid(&acts.narrow(1, c, c)?)?)?;
        let res_skip = layer.res_skip.forward(&gated)?;
        if res_skip.dim(1)? == 2 * c {
            Ok((Some(res_skip.narrow(1, 0, c)?), res_skip.narrow(1, c, c)?))
        } else {
            Ok((None, res_skip))
        }
    }

    fn project(&self, output: Option<Tensor>) -> Result<(Tensor, Tensor)> {
        let output =
            output.ok_or_else(|| Error::Config("coupling flow has no residual layers".into()))?;
        let out = self.end.forward(&output)?;
        let log_s = apply_log_scale_policy(&out.narrow(1, 0, 1)?, self.log_scale)?;
        let bias = out.narrow(1, 1, 1)?;
        Ok((log_s, bias))
    }
}

/// Rolling per-layer input windows for [`FlowWeights::forward_row`].
///
/// Layer `l` keeps its last `(kernel_h - 1) * dilation_h + 1` input rows,
/// which is everything its causal kernel can reach.
#[derive(Debug, Clone, Default)]
pub struct RowCache {
    windows: Vec<VecDeque<Tensor>>,
}

impl RowCache {
    pub fn new(n_layers: usize) -> Self {
        Self {
            windows: vec![VecDeque::new(); n_layers],
        }
    }

    /// Forget all rows; the next pushed row is row 0.
    pub fn reset(&mut self) {
        for window in &mut self.windows {
            window.clear();
        }
    }

    /// Rows currently buffered per layer.
    pub fn buffered(&self) -> Vec<usize> {
        self.windows.iter().map(VecDeque::len).collect()
    }
}
