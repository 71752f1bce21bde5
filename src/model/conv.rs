//! Convolution primitives shared by the conditioner and the coupling flows.
//!
//! candle's `conv2d` takes one dilation and one symmetric padding for both
//! axes. The coupling layers pad the group axis causally and dilate it
//! independently of time, so convolutions here are evaluated as a sum over
//! kernel taps: each tap is a shifted view of the pre-padded input, the taps
//! are stacked along channels and contracted with the weight in one matmul.
//! Every op involved has a backward pass, so the same code trains and infers.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder, VarMap};

use crate::{Error, Result};

/// Initialisation strategy chosen for a layer when it is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamInit {
    /// `U(-k, k)` with `k = sqrt(1 / fan_in)`, for weight and bias.
    UniformScaled { fan_in: usize },
    /// All zeros. Used for the last projection of every flow so that a fresh
    /// model starts as the identity transform.
    Zero,
}

impl ParamInit {
    pub fn uniform_scaled(in_channels: usize, kernel: (usize, usize)) -> Self {
        ParamInit::UniformScaled {
            fan_in: in_channels * kernel.0 * kernel.1,
        }
    }

    pub fn to_init(self) -> Init {
        match self {
            ParamInit::UniformScaled { fan_in } => {
                let k = (1.0 / fan_in.max(1) as f64).sqrt();
                Init::Uniform { lo: -k, up: k }
            }
            ParamInit::Zero => Init::Const(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved weights
// ---------------------------------------------------------------------------

/// Convolution weights in tap-major layout, ready to apply.
#[derive(Debug, Clone)]
pub struct Conv2dTaps {
    /// `[out, kh * kw * in]`, taps outer, input channels inner.
    weight: Tensor,
    /// `[1, out, 1]`
    bias: Tensor,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    dilation: (usize, usize),
}

impl Conv2dTaps {
    /// Build from a `[out, in, kh, kw]` weight and an `[out]` bias.
    pub fn new(weight: &Tensor, bias: &Tensor, dilation: (usize, usize)) -> Result<Self> {
        let (out_channels, in_channels, kh, kw) = weight.dims4()?;
        let weight = weight
            .permute((0, 2, 3, 1))?
            .reshape((out_channels, kh * kw * in_channels))?;
        let bias = bias.reshape((1, out_channels, 1))?;
        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel: (kh, kw),
            dilation,
        })
    }

    /// Copy cut off from the autodiff graph.
    pub fn detach(&self) -> Self {
        Self {
            weight: self.weight.detach(),
            bias: self.bias.detach(),
            ..self.clone()
        }
    }

    pub fn dilation(&self) -> (usize, usize) {
        self.dilation
    }

    /// Valid convolution of an already padded `[B, in, H, W]` input.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_dilated(xs, self.dilation)
    }

    /// Valid convolution with an explicit `(height, width)` dilation.
    ///
    /// Output: `[B, out, H - (kh-1)*dh, W - (kw-1)*dw]`.
    pub fn forward_dilated(&self, xs: &Tensor, dilation: (usize, usize)) -> Result<Tensor> {
        let (b, c, h_in, w_in) = xs.dims4()?;
        if c != self.in_channels {
            return Err(Error::Precondition(format!(
                "conv expects {} input channels, got {c}",
                self.in_channels
            )));
        }
        let (kh, kw) = self.kernel;
        let (dh, dw) = dilation;
        let span_h = (kh - 1) * dh;
        let span_w = (kw - 1) * dw;
        if h_in <= span_h || w_in <= span_w {
            return Err(Error::Precondition(format!(
                "input {h_in}x{w_in} too small for kernel {kh}x{kw} at dilation {dh}x{dw}"
            )));
        }
        let (h, w) = (h_in - span_h, w_in - span_w);

        let cols = if kh * kw == 1 {
            xs.clone()
        } else {
            let mut taps = Vec::with_capacity(kh * kw);
            for i in 0..kh {
                let rows = xs.narrow(2, i * dh, h)?;
                for j in 0..kw {
                    taps.push(rows.narrow(3, j * dw, w)?);
                }
            }
            Tensor::cat(&taps, 1)?
        };
        let cols = cols.reshape((b, kh * kw * c, h * w))?;

        let ys = self
            .weight
            .broadcast_matmul(&cols)?
            .broadcast_add(&self.bias)?;
        Ok(ys.reshape((b, self.out_channels, h, w))?)
    }
}

// ---------------------------------------------------------------------------
// Parameterised layers
// ---------------------------------------------------------------------------

/// Weight-normalised parameter: `w = g * v / ||v||`, norm taken per output
/// slice (over every axis but the first).
#[derive(Debug, Clone)]
pub struct WeightNorm {
    weight_g: Tensor,
    weight_v: Tensor,
}

impl WeightNorm {
    /// `shape` is the 4-D weight shape; the gain has shape `[shape.0, 1, 1, 1]`.
    pub fn new(
        shape: (usize, usize, usize, usize),
        init: ParamInit,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let weight_v = vb.get_with_hints(shape, "weight_v", init.to_init())?;
        let weight_g = vb.get_with_hints((shape.0, 1, 1, 1), "weight_g", Init::Const(1.0))?;
        Ok(Self { weight_g, weight_v })
    }

    /// Effective weight.
    pub fn weight(&self) -> Result<Tensor> {
        let norm_v = self.weight_v.sqr()?.sum_keepdim((1, 2, 3))?.sqrt()?;
        Ok(self
            .weight_v
            .broadcast_mul(&self.weight_g)?
            .broadcast_div(&norm_v)?)
    }
}

/// Weight-normalised 2-D convolution with per-axis dilation.
#[derive(Debug, Clone)]
pub struct WeightNormConv2d {
    weight: WeightNorm,
    bias: Tensor,
    dilation: (usize, usize),
}

impl WeightNormConv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        dilation: (usize, usize),
        init: ParamInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = WeightNorm::new((out_channels, in_channels, kernel.0, kernel.1), init, &vb)?;
        let bias = vb.get_with_hints(out_channels, "bias", init.to_init())?;
        Ok(Self {
            weight,
            bias,
            dilation,
        })
    }

    /// 1x1 convolution.
    pub fn pointwise(
        in_channels: usize,
        out_channels: usize,
        init: ParamInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::new(in_channels, out_channels, (1, 1), (1, 1), init, vb)
    }

    pub fn resolve(&self) -> Result<Conv2dTaps> {
        Conv2dTaps::new(&self.weight.weight()?, &self.bias, self.dilation)
    }
}

/// Plain 1x1 convolution (no weight norm).
#[derive(Debug, Clone)]
pub struct PointwiseConv2d {
    weight: Tensor,
    bias: Tensor,
}

impl PointwiseConv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        init: ParamInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init = init.to_init();
        let weight = vb.get_with_hints((out_channels, in_channels, 1, 1), "weight", init)?;
        let bias = vb.get_with_hints(out_channels, "bias", init)?;
        Ok(Self { weight, bias })
    }

    pub fn resolve(&self) -> Result<Conv2dTaps> {
        Conv2dTaps::new(&self.weight, &self.bias, (1, 1))
    }
}

/// Set every weight-norm gain `g` in `varmap` to `||v||`, so the effective
/// weight of a freshly initialised layer equals its direction tensor.
///
/// Returns the number of gains updated.
pub fn init_weight_norm_gains(varmap: &VarMap) -> Result<usize> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|e| Error::Config(format!("variable map lock poisoned: {e}")))?;
    let mut updated = 0;
    for (name, gain) in vars.iter() {
        let Some(prefix) = name.strip_suffix("weight_g") else {
            continue;
        };
        let Some(direction) = vars.get(&format!("{prefix}weight_v")) else {
            continue;
        };
        let norm = direction
            .as_tensor()
            .sqr()?
            .sum_keepdim((1, 2, 3))?
            .sqrt()?;
        gain.set(&norm)?;
        updated += 1;
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    /// Direct nested-loop valid convolution, `[1, C, H, W]` input.
    fn naive_conv(
        xs: &[Vec<Vec<f32>>],
        weight: &[Vec<Vec<Vec<f32>>>],
        bias: &[f32],
        dilation: (usize, usize),
    ) -> Vec<Vec<Vec<f32>>> {
        let (kh, kw) = (weight[0][0].len(), weight[0][0][0].len());
        let h = xs[0].len() - (kh - 1) * dilation.0;
        let w = xs[0][0].len() - (kw - 1) * dilation.1;
        let mut out = vec![vec![vec![0f32; w]; h]; weight.len()];
        for (o, plane) in out.iter_mut().enumerate() {
            for (y, row) in plane.iter_mut().enumerate() {
                for (x, value) in row.iter_mut().enumerate() {
                    let mut acc = bias[o];
                    for (c, input) in xs.iter().enumerate() {
                        for i in 0..kh {
                            for j in 0..kw {
                                acc += weight[o][c][i][j]
                                    * input[y + i * dilation.0][x + j * dilation.1];
                            }
                        }
                    }
                    *value = acc;
                }
            }
        }
        out
    }

    #[test]
    fn taps_match_naive_with_distinct_dilations() {
        let device = Device::Cpu;
        let xs = Tensor::randn(0f32, 1.0, (1, 3, 9, 11), &device).unwrap();
        let weight = Tensor::randn(0f32, 1.0, (4, 3, 3, 3), &device).unwrap();
        let bias = Tensor::randn(0f32, 1.0, 4, &device).unwrap();

        let conv = Conv2dTaps::new(&weight, &bias, (3, 2)).unwrap();
        let ys = conv.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[1, 4, 3, 7]);

        let weight_rows: Vec<Vec<Vec<Vec<f32>>>> = (0..4)
            .map(|o| weight.get(o).unwrap().to_vec3().unwrap())
            .collect();
        let expected = naive_conv(
            &xs.squeeze(0).unwrap().to_vec3().unwrap(),
            &weight_rows,
            &bias.to_vec1().unwrap(),
            (3, 2),
        );
        let got = ys.squeeze(0).unwrap().to_vec3::<f32>().unwrap();
        for (a, b) in got.iter().flatten().flatten().zip(expected.iter().flatten().flatten()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn taps_match_candle_conv2d_for_square_dilation() {
        let device = Device::Cpu;
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 10, 10), &device).unwrap();
        let weight = Tensor::randn(0f32, 1.0, (5, 3, 3, 3), &device).unwrap();
        let bias = Tensor::zeros(5, DType::F32, &device).unwrap();

        let conv = Conv2dTaps::new(&weight, &bias, (2, 2)).unwrap();
        let ours = conv.forward(&xs).unwrap();
        let reference = xs.conv2d(&weight, 0, 1, 2, 1).unwrap();
        assert_eq!(ours.dims(), reference.dims());
        let diff: f32 = (ours - reference)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "max diff {diff}");
    }

    #[test]
    fn too_small_input_is_rejected() {
        let device = Device::Cpu;
        let weight = Tensor::ones((1, 1, 3, 3), DType::F32, &device).unwrap();
        let bias = Tensor::zeros(1, DType::F32, &device).unwrap();
        let conv = Conv2dTaps::new(&weight, &bias, (1, 1)).unwrap();
        let xs = Tensor::ones((1, 1, 2, 8), DType::F32, &device).unwrap();
        assert!(matches!(conv.forward(&xs), Err(Error::Precondition(_))));
    }

    #[test]
    fn weight_norm_gain_init_restores_direction() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let conv = WeightNormConv2d::new(
            4,
            6,
            (3, 3),
            (1, 1),
            ParamInit::uniform_scaled(4, (3, 3)),
            vb.pp("conv"),
        )
        .unwrap();
        assert_eq!(init_weight_norm_gains(&varmap).unwrap(), 1);

        let direction = varmap
            .data()
            .lock()
            .unwrap()
            .get("conv.weight_v")
            .unwrap()
            .as_tensor()
            .clone();
        let diff: f32 = (conv.weight.weight().unwrap() - direction)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn uniform_init_within_bounds() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let conv =
            PointwiseConv2d::new(16, 8, ParamInit::uniform_scaled(16, (1, 1)), vb.pp("c")).unwrap();
        let max: f32 = conv.weight.abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(max <= 0.25 + 1e-6, "max {max}");
    }

    #[test]
    fn zero_init_gives_zero_output() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let conv = PointwiseConv2d::new(4, 2, ParamInit::Zero, vb.pp("end")).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 4, 3, 5), &device).unwrap();
        let ys = conv.resolve().unwrap().forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[1, 2, 3, 5]);
        let sum: f32 = ys.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }
}
