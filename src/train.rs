//! One optimisation step and one validation pass over a [`WaveFlow`].
//!
//! Batching, epochs and multi-device gradient sync live outside the crate;
//! the trainer only consumes `(audio [B, T], mel [B, M, F])` pairs.

use std::time::Instant;

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use crate::config::TrainConfig;
use crate::loss::WaveFlowLoss;
use crate::model::WaveFlow;
use crate::{Error, Result};

/// Summary of one flow's log-scales.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogScaleStats {
    pub mean: f32,
    pub min: f32,
    pub max: f32,
}

impl LogScaleStats {
    fn of(log_s: &Tensor) -> Result<Self> {
        let flat = log_s.flatten_all()?;
        Ok(Self {
            mean: flat.mean_all()?.to_scalar()?,
            min: flat.min(0)?.to_scalar()?,
            max: flat.max(0)?.to_scalar()?,
        })
    }
}

/// Result of [`Trainer::valid_step`].
#[derive(Debug, Clone)]
pub struct ValidReport {
    pub avg_loss: f32,
    pub batches: usize,
    /// Per-flow statistics of the first batch, in flow order.
    pub log_s: Vec<LogScaleStats>,
}

/// Model, parameters, loss and optimizer.
pub struct Trainer {
    model: WaveFlow,
    varmap: VarMap,
    loss: WaveFlowLoss,
    optimizer: AdamW,
    iteration: usize,
}

impl Trainer {
    /// `varmap` must hold the parameters `model` was built from.
    pub fn new(model: WaveFlow, varmap: VarMap, config: &TrainConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        let loss = WaveFlowLoss::new(model.config().sigma);
        Ok(Self {
            model,
            varmap,
            loss,
            optimizer,
            iteration: 0,
        })
    }

    pub fn model(&self) -> &WaveFlow {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Steps taken so far (or restored with [`Self::set_iteration`]).
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: usize) {
        self.iteration = iteration;
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Forward, loss, backward and parameter update. Returns the loss.
    pub fn train_step(&mut self, audio: &Tensor, mel: &Tensor) -> Result<f32> {
        let start = Instant::now();
        let output = self.model.forward(audio, mel)?;
        let loss = self.loss.compute(&output)?;
        let value: f32 = loss.to_scalar()?;
        if !value.is_finite() {
            tracing::warn!("Step {}: non-finite loss {value}", self.iteration);
        }
        self.optimizer.backward_step(&loss)?;
        self.iteration += 1;
        tracing::info!(
            "Step: {:>8} Loss: {:<8.3} Time: {:.3}s",
            self.iteration,
            value,
            start.elapsed().as_secs_f64()
        );
        Ok(value)
    }

    /// Average loss over `batches` without touching the parameters.
    pub fn valid_step(&self, batches: &[(Tensor, Tensor)]) -> Result<ValidReport> {
        if batches.is_empty() {
            return Err(Error::Precondition("validation needs at least one batch".into()));
        }
        let start = Instant::now();
        let mut total = 0f32;
        let mut log_s = Vec::new();
        for (i, (audio, mel)) in batches.iter().enumerate() {
            let output = self.model.forward(audio, mel)?;
            if i == 0 {
                log_s = output
                    .log_s
                    .iter()
                    .map(LogScaleStats::of)
                    .collect::<Result<Vec<_>>>()?;
            }
            total += self.loss.value(&output)?;
        }
        let avg_loss = total / batches.len() as f32;
        tracing::info!(
            "Valid | AvgLoss: {:<8.3} Batches: {} Time: {:.3}s",
            avg_loss,
            batches.len(),
            start.elapsed().as_secs_f64()
        );
        for (j, stats) in log_s.iter().enumerate() {
            tracing::debug!(
                "flow {j} log_s mean={:.4} min={:.4} max={:.4}",
                stats.mean,
                stats.min,
                stats.max
            );
        }
        Ok(ValidReport {
            avg_loss,
            batches: batches.len(),
            log_s,
        })
    }
}
