//! Mel conditioner: upsamples `[B, mel_bands, F]` to `[B, mel_bands, F * hop]`.
//!
//! ```text
//! mel ─→ ConvTranspose2d(1→1, k=(3, 2s), stride=(1, s), pad=(1, s/2)) ─→ LeakyReLU(0.4)
//!     ─→ ... one stage per upsample factor ...
//! ```
//!
//! The mel axis is treated as image height (stride 1, kernel 3) and time as
//! width. The transposed convolution is written out directly: a kernel tap
//! `(kh, kw)` with `kw = q*s + r` sends input frame `t` to output position
//! `(t + q)*s + r - pad`, so each stage is six broadcast products over
//! shifted copies of the input, flattened and cropped.

use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{Activation, VarBuilder};

use super::conv::{ParamInit, WeightNorm};
use crate::{Error, Result};

const LEAKY_SLOPE: f64 = 0.4;
const KERNEL_H: usize = 3;

/// One upsampling stage.
#[derive(Debug, Clone)]
struct UpsampleStage {
    weight: WeightNorm,
    bias: Tensor,
    stride: usize,
}

impl UpsampleStage {
    fn new(stride: usize, vb: VarBuilder) -> Result<Self> {
        let kernel = (KERNEL_H, 2 * stride);
        let init = ParamInit::uniform_scaled(1, kernel);
        let weight = WeightNorm::new((1, 1, kernel.0, kernel.1), init, &vb)?;
        let bias = vb.get_with_hints(1, "bias", init.to_init())?;
        Ok(Self {
            weight,
            bias,
            stride,
        })
    }

    /// `[B, M, T]` → `[B, M, (T-1)*s + 2s - 2*(s/2)]`.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, m, t) = xs.dims3()?;
        let s = self.stride;
        let pad = s / 2;
        let out_len = (t - 1) * s + 2 * s - 2 * pad;
        let kernel = self.weight.weight()?.reshape((KERNEL_H, 2 * s))?;

        // Output row m reads input row m + 1 - kh.
        let rows = xs.pad_with_zeros(1, 1, 1)?;
        let mut acc = Tensor::zeros((b, m, t + 1, s), xs.dtype(), xs.device())?;
        for kh in 0..KERNEL_H {
            let src = rows.narrow(1, 2 - kh, m)?;
            // q = 0 reads frame t'', q = 1 reads frame t'' - 1.
            let shifted = [src.pad_with_zeros(2, 0, 1)?, src.pad_with_zeros(2, 1, 0)?];
            for (q, frames) in shifted.iter().enumerate() {
                let taps = kernel.i((kh, q * s..(q + 1) * s))?.reshape((1, 1, 1, s))?;
                acc = (acc + frames.unsqueeze(3)?.broadcast_mul(&taps)?)?;
            }
        }
        let ys = acc
            .reshape((b, m, (t + 1) * s))?
            .narrow(2, pad, out_len)?
            .broadcast_add(&self.bias)?;
        Ok(ys)
    }
}

/// Cascade of transposed-convolution upsamplers with leaky-ReLU.
#[derive(Debug, Clone)]
pub struct Conditioner {
    stages: Vec<UpsampleStage>,
    activation: Activation,
}

impl Conditioner {
    pub fn new(upsample_factors: &[usize], vb: VarBuilder) -> Result<Self> {
        let stages = upsample_factors
            .iter()
            .enumerate()
            .map(|(i, &s)| UpsampleStage::new(s, vb.pp(format!("upsample.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            stages,
            activation: Activation::LeakyRelu(LEAKY_SLOPE),
        })
    }

    /// Total time-axis upsampling.
    pub fn hop_length(&self) -> usize {
        self.stages.iter().map(|stage| stage.stride).product()
    }

    /// `[B, mel_bands, F]` → `[B, mel_bands, F * hop]` (for even factors).
    pub fn forward(&self, mel: &Tensor) -> Result<Tensor> {
        if mel.dim(2)? == 0 {
            return Err(Error::Precondition("mel has no frames".into()));
        }
        let mut xs = mel.clone();
        for stage in &self.stages {
            xs = self.activation.forward(&stage.forward(&xs)?)?;
        }
        Ok(xs)
    }
}
