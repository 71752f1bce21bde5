//! Exact negative log-likelihood of a flow output.
//!
//! ```text
//! loss = (sum(z^2) / (2 sigma^2) - sum_i sum(log_s_i)) / |z| + 0.5 ln(2 pi) + ln(sigma)
//! ```
//!
//! The first term is the Gaussian energy of the latent, the second the
//! log-determinant of the flow's Jacobian. Both are averaged per element of
//! `z`, so the value is in nats per sample and comparable across lengths.

use candle_core::{DType, Tensor};

use crate::Result;
use crate::model::waveflow::FlowOutput;

/// Likelihood loss under an `N(0, sigma^2)` prior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveFlowLoss {
    sigma: f64,
}

impl WaveFlowLoss {
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    /// `0.5 ln(2 pi) + ln(sigma)`, the loss of an all-zero latent under an
    /// identity flow.
    pub fn constant(&self) -> f64 {
        0.5 * (2.0 * std::f64::consts::PI).ln() + self.sigma.ln()
    }

    /// Scalar loss tensor, differentiable w.r.t. the model parameters.
    pub fn compute(&self, output: &FlowOutput) -> Result<Tensor> {
        let z = &output.z;
        let energy = (z.sqr()?.sum_all()? / (2.0 * self.sigma * self.sigma))?;
        let mut log_det = Tensor::zeros((), z.dtype(), z.device())?;
        for log_s in &output.log_s {
            log_det = (log_det + log_s.sum_all()?)?;
        }
        let per_element = ((energy - log_det)? / z.elem_count() as f64)?;
        Ok(per_element.affine(1.0, self.constant())?)
    }

    /// Loss as a host scalar.
    pub fn value(&self, output: &FlowOutput) -> Result<f32> {
        Ok(self.compute(output)?.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }
}
