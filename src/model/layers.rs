//! Building blocks of the segmentation network.
//!
//! Parameter names follow the checkpoint layout: a convolution followed by a
//! normalization inside a sequential container is bound as `<name>.0` and
//! `<name>.1`, residual blocks use `conv1`/`sn1`/`conv2`/`sn2`/`shortcut`.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{
    conv2d, conv_transpose2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Init,
    VarBuilder,
};

/// Epsilon added to the mixed variance before normalization.
pub const NORM_EPS: f64 = 1e-5;

// =============================================================================
// Switchable Normalization
// =============================================================================

/// Switchable normalization in inference mode.
///
/// Mixes per-sample instance statistics, per-sample layer statistics and the
/// stored running statistics with learned softmax weights. Nothing depends
/// on other samples of the batch.
#[derive(Debug, Clone)]
pub struct SwitchNorm2d {
    weight: Tensor,
    bias: Tensor,
    mean_mix: [f64; 3],
    var_mix: [f64; 3],
    /// Running mean already scaled by its mixing weight, shape (1, C, 1)
    running_mean: Tensor,
    /// Running variance already scaled by its mixing weight, shape (1, C, 1)
    running_var: Tensor,
}

impl SwitchNorm2d {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((1, channels, 1, 1), "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints((1, channels, 1, 1), "bias", Init::Const(0.0))?;
        let mean_weight = vb.get_with_hints(3, "mean_weight", Init::Const(1.0))?;
        let var_weight = vb.get_with_hints(3, "var_weight", Init::Const(1.0))?;
        let running_mean = vb.get_with_hints((1, channels, 1), "running_mean", Init::Const(0.0))?;
        let running_var = vb.get_with_hints((1, channels, 1), "running_var", Init::Const(1.0))?;

        let mean_mix = softmax3(&mean_weight)?;
        let var_mix = softmax3(&var_weight)?;

        Ok(Self {
            weight,
            bias,
            running_mean: running_mean.affine(mean_mix[2], 0.0)?,
            running_var: running_var.affine(var_mix[2], 0.0)?,
            mean_mix,
            var_mix,
        })
    }
}

impl Module for SwitchNorm2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (n, c, h, w) = xs.dims4()?;
        let x = xs.reshape((n, c, h * w))?;

        let mean_in = x.mean_keepdim(2)?;
        let var_in = x.var_keepdim(2)?;
        let mean_ln = mean_in.mean_keepdim(1)?;
        let var_ln = var_in
            .add(&mean_in.sqr()?)?
            .mean_keepdim(1)?
            .sub(&mean_ln.sqr()?)?;

        let mean = mean_in
            .affine(self.mean_mix[0], 0.0)?
            .broadcast_add(&mean_ln.affine(self.mean_mix[1], 0.0)?)?
            .broadcast_add(&self.running_mean)?;
        let var = var_in
            .affine(self.var_mix[0], 0.0)?
            .broadcast_add(&var_ln.affine(self.var_mix[1], 0.0)?)?
            .broadcast_add(&self.running_var)?;

        let std = var.affine(1.0, NORM_EPS)?.sqrt()?;
        x.broadcast_sub(&mean)?
            .broadcast_div(&std)?
            .reshape((n, c, h, w))?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Softmax of a three-element parameter, evaluated once at load time.
fn softmax3(t: &Tensor) -> Result<[f64; 3]> {
    let v = t.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    if v.len() != 3 {
        candle_core::bail!("expected 3 mixing weights, got {}", v.len());
    }
    let max = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = v.iter().map(|x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    Ok([exps[0] / sum, exps[1] / sum, exps[2] / sum])
}

// =============================================================================
// Convolution Units
// =============================================================================

/// Convolution, switchable normalization, ReLU.
#[derive(Debug, Clone)]
pub struct ConvNormRelu {
    conv: Conv2d,
    norm: SwitchNorm2d,
}

impl ConvNormRelu {
    /// `conv_vb` and `norm_vb` are sibling slots of the same container.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        conv_vb: VarBuilder,
        norm_vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(in_channels, out_channels, kernel, cfg, conv_vb)?,
            norm: SwitchNorm2d::new(out_channels, norm_vb)?,
        })
    }
}

impl Module for ConvNormRelu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.norm.forward(&self.conv.forward(xs)?)?.relu()
    }
}

/// Strided transpose convolution (kernel = stride), normalization, ReLU.
///
/// Upsamples by exactly `scale` in each spatial dimension.
#[derive(Debug, Clone)]
pub struct UpsampleNormRelu {
    deconv: ConvTranspose2d,
    norm: SwitchNorm2d,
}

impl UpsampleNormRelu {
    /// Bound as `<vb>.0` (transpose convolution) and `<vb>.1` (normalization).
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        scale: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            deconv: transpose(in_channels, out_channels, scale, vb.pp("0"))?,
            norm: SwitchNorm2d::new(out_channels, vb.pp("1"))?,
        })
    }
}

impl Module for UpsampleNormRelu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.norm.forward(&self.deconv.forward(xs)?)?.relu()
    }
}

fn transpose(
    in_channels: usize,
    out_channels: usize,
    scale: usize,
    vb: VarBuilder,
) -> Result<ConvTranspose2d> {
    let cfg = ConvTranspose2dConfig {
        stride: scale,
        ..Default::default()
    };
    conv_transpose2d(in_channels, out_channels, scale, cfg, vb)
}

// =============================================================================
// Residual Block
// =============================================================================

/// Two 3x3 convolutions with switchable normalization and an identity or
/// projected shortcut.
#[derive(Debug, Clone)]
pub struct ResBlock {
    conv1: Conv2d,
    sn1: SwitchNorm2d,
    conv2: Conv2d,
    sn2: SwitchNorm2d,
    shortcut: Option<(Conv2d, SwitchNorm2d)>,
}

impl ResBlock {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let shortcut = if in_channels != out_channels {
            let sc = vb.pp("shortcut");
            Some((
                conv2d(in_channels, out_channels, 1, Default::default(), sc.pp("0"))?,
                SwitchNorm2d::new(out_channels, sc.pp("1"))?,
            ))
        } else {
            None
        };

        Ok(Self {
            conv1: conv2d(in_channels, out_channels, 3, padded, vb.pp("conv1"))?,
            sn1: SwitchNorm2d::new(out_channels, vb.pp("sn1"))?,
            conv2: conv2d(out_channels, out_channels, 3, padded, vb.pp("conv2"))?,
            sn2: SwitchNorm2d::new(out_channels, vb.pp("sn2"))?,
            shortcut,
        })
    }
}

impl Module for ResBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = match &self.shortcut {
            Some((conv, norm)) => norm.forward(&conv.forward(xs)?)?,
            None => xs.clone(),
        };
        let out = self.sn1.forward(&self.conv1.forward(xs)?)?.relu()?;
        let out = self.sn2.forward(&self.conv2.forward(&out)?)?;
        out.add(&residual)?.relu()
    }
}

// =============================================================================
// Attention Gate
// =============================================================================

/// Parallel spatial and channel attention conditioned on a gating tensor.
///
/// The gating tensor `g` and the companion `x` are projected to a shared
/// width, summed and rectified. A one-channel spatial map and a per-channel
/// descriptor are derived from the result; their sum, broadcast to the shape
/// of `x`, reweights `x` element-wise.
#[derive(Debug, Clone)]
pub struct AttentionGate {
    w_g: (Conv2d, SwitchNorm2d),
    w_x: (Conv2d, SwitchNorm2d),
    spatial: (Conv2d, SwitchNorm2d),
    channel: Conv2d,
}

impl AttentionGate {
    /// `gate_channels` is the width of `g`, `skip_channels` the width of
    /// `x`, `inter_channels` the shared projection width.
    pub fn new(
        gate_channels: usize,
        skip_channels: usize,
        inter_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let pointwise = Conv2dConfig::default();
        let w_g = vb.pp("W_g");
        let w_x = vb.pp("W_x");
        let psi_s = vb.pp("psi_s");

        Ok(Self {
            w_g: (
                conv2d(gate_channels, inter_channels, 1, pointwise, w_g.pp("0"))?,
                SwitchNorm2d::new(inter_channels, w_g.pp("1"))?,
            ),
            w_x: (
                conv2d(skip_channels, inter_channels, 1, pointwise, w_x.pp("0"))?,
                SwitchNorm2d::new(inter_channels, w_x.pp("1"))?,
            ),
            spatial: (
                conv2d(inter_channels, 1, 1, pointwise, psi_s.pp("0"))?,
                SwitchNorm2d::new(1, psi_s.pp("1"))?,
            ),
            channel: conv2d(inter_channels, skip_channels, 1, pointwise, vb.pp("psi_c.0"))?,
        })
    }

    pub fn forward(&self, g: &Tensor, x: &Tensor) -> Result<Tensor> {
        let g1 = self.w_g.1.forward(&self.w_g.0.forward(g)?)?;
        let x1 = self.w_x.1.forward(&self.w_x.0.forward(x)?)?;
        let joint = g1.add(&x1)?.relu()?;

        let spatial = candle_nn::ops::sigmoid(&self.spatial.1.forward(&self.spatial.0.forward(&joint)?)?)?;
        let pooled = joint.mean_keepdim(3)?.mean_keepdim(2)?;
        let channel = candle_nn::ops::sigmoid(&self.channel.forward(&pooled)?)?;

        let gate = spatial.broadcast_add(&channel)?;
        x.broadcast_mul(&gate)
    }
}

// =============================================================================
// Output Heads
// =============================================================================

/// Deep-supervision head: transpose convolution straight to full resolution,
/// then a per-class sigmoid.
#[derive(Debug, Clone)]
pub struct AuxHead {
    deconv: ConvTranspose2d,
}

impl AuxHead {
    pub fn new(
        in_channels: usize,
        num_classes: usize,
        scale: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            deconv: transpose(in_channels, num_classes, scale, vb)?,
        })
    }
}

impl Module for AuxHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::sigmoid(&self.deconv.forward(xs)?)
    }
}

/// Final two-layer pointwise head with a per-class sigmoid.
#[derive(Debug, Clone)]
pub struct PredictionHead {
    hidden: ConvNormRelu,
    out: Conv2d,
}

/// Width of the hidden layer of the prediction head.
pub const PREDICTION_HIDDEN: usize = 12;

impl PredictionHead {
    /// Bound as `<vb>.0`, `<vb>.1` (hidden layer) and `<vb>.3` (classifier).
    pub fn new(in_channels: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            hidden: ConvNormRelu::new(
                in_channels,
                PREDICTION_HIDDEN,
                1,
                0,
                vb.pp("0"),
                vb.pp("1"),
            )?,
            out: conv2d(PREDICTION_HIDDEN, num_classes, 1, Default::default(), vb.pp("3"))?,
        })
    }
}

impl Module for PredictionHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::sigmoid(&self.out.forward(&self.hidden.forward(xs)?)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn varmap_builder(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    fn ramp(shape: (usize, usize, usize, usize)) -> Tensor {
        let count = shape.0 * shape.1 * shape.2 * shape.3;
        let data: Vec<f32> = (0..count).map(|i| ((i * 37) % 101) as f32 / 10.0).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_switch_norm_default_mix_normalizes() {
        let varmap = VarMap::new();
        let norm = SwitchNorm2d::new(4, varmap_builder(&varmap)).unwrap();
        let out = norm.forward(&ramp((1, 4, 8, 8))).unwrap();

        assert_eq!(out.dims(), &[1, 4, 8, 8]);
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_switch_norm_mixing_weights() {
        let t = Tensor::new(&[0.0f32, 0.0, 0.0], &Device::Cpu).unwrap();
        let mix = softmax3(&t).unwrap();
        for w in mix {
            assert!((w - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_switch_norm_is_batch_independent() {
        let varmap = VarMap::new();
        let norm = SwitchNorm2d::new(3, varmap_builder(&varmap)).unwrap();

        let a = ramp((1, 3, 6, 6));
        let b = a.affine(3.0, 1.0).unwrap();
        let batch = Tensor::cat(&[&a, &b], 0).unwrap();

        let alone: Vec<f32> = norm.forward(&a).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let batched: Vec<f32> = norm
            .forward(&batch)
            .unwrap()
            .narrow(0, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        for (x, y) in alone.iter().zip(batched.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_res_block_shapes() {
        let varmap = VarMap::new();
        let vb = varmap_builder(&varmap);

        let projected = ResBlock::new(4, 8, vb.pp("a")).unwrap();
        assert!(projected.shortcut.is_some());
        let out = projected.forward(&ramp((1, 4, 10, 10))).unwrap();
        assert_eq!(out.dims(), &[1, 8, 10, 10]);

        let identity = ResBlock::new(8, 8, vb.pp("b")).unwrap();
        assert!(identity.shortcut.is_none());
        let out = identity.forward(&out).unwrap();
        assert_eq!(out.dims(), &[1, 8, 10, 10]);
    }

    #[test]
    fn test_upsample_scales_exactly() {
        let varmap = VarMap::new();
        let up = UpsampleNormRelu::new(8, 4, 4, varmap_builder(&varmap)).unwrap();
        let out = up.forward(&ramp((1, 8, 5, 5))).unwrap();
        assert_eq!(out.dims(), &[1, 4, 20, 20]);
    }

    #[test]
    fn test_attention_gate_keeps_companion_shape() {
        let varmap = VarMap::new();
        let gate = AttentionGate::new(16, 6, 16, varmap_builder(&varmap)).unwrap();

        let g = ramp((1, 16, 8, 8));
        let x = ramp((1, 6, 8, 8));
        let out = gate.forward(&g, &x).unwrap();
        assert_eq!(out.dims(), &[1, 6, 8, 8]);
    }

    #[test]
    fn test_heads_are_sigmoid_bounded() {
        let varmap = VarMap::new();
        let vb = varmap_builder(&varmap);

        let aux = AuxHead::new(8, 5, 4, vb.pp("aux")).unwrap();
        let out = aux.forward(&ramp((1, 8, 4, 4))).unwrap();
        assert_eq!(out.dims(), &[1, 5, 16, 16]);

        let pred = PredictionHead::new(8, 5, vb.pp("pred")).unwrap();
        let out = pred.forward(&ramp((1, 8, 4, 4))).unwrap();
        assert_eq!(out.dims(), &[1, 5, 4, 4]);

        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
