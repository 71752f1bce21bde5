//! Row-incremental inversion.
//!
//! Inverting a coupling flow recovers row `r` from rows `< r`, so the naive
//! inverse reruns the whole network on a growing prefix. The causal
//! height kernel only reaches `(kernel_h - 1) * dilation_h` rows back, so a
//! session keeps that many input rows per layer and computes each new row
//! with a single-row pass. Conditioning projections do not depend on the
//! audio and are computed once per flow.

use std::time::Instant;

use candle_core::Tensor;

use super::flow::{FlowWeights, RowCache, affine_inverse};
use super::permutation::PermutationSchedule;
use super::waveflow::{WaveFlow, ungroup_audio};
use crate::Result;

/// Inference state for one model: detached weights plus per-flow row caches.
pub struct SynthesisSession<'a> {
    model: &'a WaveFlow,
    flows: Vec<FlowWeights>,
    caches: Vec<RowCache>,
}

impl<'a> SynthesisSession<'a> {
    pub fn new(model: &'a WaveFlow) -> Result<Self> {
        let flows = model
            .flows()
            .iter()
            .map(|flow| -> Result<FlowWeights> { Ok(flow.resolve()?.detach()) })
            .collect::<Result<Vec<FlowWeights>>>()?;
        let caches = flows
            .iter()
            .map(|weights| RowCache::new(weights.n_layers()))
            .collect();
        Ok(Self {
            model,
            flows,
            caches,
        })
    }

    /// Drop all buffered rows.
    pub fn reset(&mut self) {
        for cache in &mut self.caches {
            cache.reset();
        }
    }

    /// Invert `z [B, n_group, W]` under `mel [B, mel_bands, F]` into audio
    /// `[B, n_group * W]`.
    pub fn reverse(&mut self, z: &Tensor, mel: &Tensor) -> Result<Tensor> {
        let start = Instant::now();
        let model = self.model;
        let (batch, g, width) = model.check_latent(z)?;
        model.check_mel(mel, batch)?;
        self.reset();

        let permutations: &PermutationSchedule = model.permutations();
        let mut cond = model.upsampled_groups(&mel.detach(), width)?.detach();
        let mut conds = Vec::with_capacity(self.flows.len());
        for i in 0..self.flows.len() {
            let next = permutations.apply(i, &cond)?;
            conds.push(cond);
            cond = next;
        }

        let mut audio = z.detach().unsqueeze(1)?;
        for i in (0..self.flows.len()).rev() {
            audio = permutations.invert(i, &audio)?;
            let weights = &self.flows[i];
            let cond_rows = weights.condition(&conds[i].narrow(2, 1, g - 1)?)?;
            let cache = &mut self.caches[i];

            let mut rows = Vec::with_capacity(g);
            rows.push(audio.narrow(2, 0, 1)?);
            for r in 1..g {
                let layer_rows = cond_rows
                    .iter()
                    .map(|c| c.narrow(2, r - 1, 1))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                let (log_s, bias) = weights.forward_row(cache, &rows[r - 1], &layer_rows)?;
                rows.push(affine_inverse(&audio.narrow(2, r, 1)?, &log_s, &bias)?);
            }
            audio = Tensor::cat(&rows, 2)?;
            tracing::debug!("inverted flow {i} ({g} rows x {width} columns)");
        }

        let audio = ungroup_audio(&audio)?;
        tracing::debug!(
            "session reverse: {} samples in {:.3}s",
            audio.dim(1)?,
            start.elapsed().as_secs_f64()
        );
        Ok(audio)
    }
}
