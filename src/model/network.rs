//! Attention-gated encoder-decoder segmentation network.
//!
//! The encoder produces five feature maps at full, half, quarter, eighth and
//! sixteenth resolution. Each decoder stage upsamples the previous stage's
//! output twice (interpolated convolution and transpose convolution), gates
//! the four shallowest encoder features after aligning them to the stage
//! resolution, and fuses everything with two residual blocks.
//!
//! Stages are described by indexed descriptors instead of one field per
//! stage; parameter names are generated from the indices so that checkpoints
//! trained with the reference layout bind without renaming.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::error::ModelError;

use super::layers::{AttentionGate, AuxHead, ConvNormRelu, PredictionHead, ResBlock, UpsampleNormRelu};

/// Channel widths at each resolution level, shallow to deep.
pub const FILTERS: [usize; 5] = [32, 64, 128, 256, 512];

/// Residual blocks in each downsampling stage.
pub const ENCODER_BLOCKS: [usize; 4] = [2, 2, 3, 4];

/// Number of encoder feature maps offered to each decoder stage.
pub const COMPANION_SOURCES: usize = 4;

/// Total downsampling factor of the encoder.
pub const DOWNSAMPLE_FACTOR: usize = 16;

/// Smallest supported input side. The deepest decoder stage applies an
/// unpadded 3x3 convolution, which needs at least 3 pixels.
pub const MIN_IMAGE_SIZE: usize = 3 * DOWNSAMPLE_FACTOR;

/// Background plus four lesion classes.
pub const NUM_CLASSES: usize = 5;

// =============================================================================
// Configuration
// =============================================================================

/// Shape parameters of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub image_size: usize,
    pub input_channels: usize,
    pub num_classes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            image_size: 640,
            input_channels: 3,
            num_classes: NUM_CLASSES,
        }
    }
}

impl NetworkConfig {
    /// Same defaults with a different input side.
    pub fn with_image_size(image_size: usize) -> Self {
        Self {
            image_size,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.image_size % DOWNSAMPLE_FACTOR != 0 {
            return Err(format!(
                "image_size must be a multiple of {}, got {}",
                DOWNSAMPLE_FACTOR, self.image_size
            ));
        }
        if self.image_size < MIN_IMAGE_SIZE {
            return Err(format!(
                "image_size must be at least {}, got {}",
                MIN_IMAGE_SIZE, self.image_size
            ));
        }
        if self.input_channels == 0 {
            return Err("input_channels must be greater than 0".to_string());
        }
        if self.num_classes < 2 {
            return Err(format!(
                "num_classes must be at least 2, got {}",
                self.num_classes
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Stage Descriptors
// =============================================================================

/// One downsampling stage: 2x2 max-pool, then residual blocks.
#[derive(Debug, Clone)]
struct EncoderStage {
    blocks: Vec<ResBlock>,
}

impl EncoderStage {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.blocks
            .iter()
            .try_fold(xs.max_pool2d(2)?, |x, block| block.forward(&x))
    }
}

/// How an encoder feature is brought to a decoder stage's resolution.
#[derive(Debug, Clone)]
enum Alignment {
    /// Same level
    Native,
    /// Shallower level: max-pool by the given factor
    Pool(usize),
    /// Deeper level: learned upsampling
    Upsample(UpsampleNormRelu),
}

/// An encoder feature gated into a decoder stage.
#[derive(Debug, Clone)]
struct Companion {
    source: usize,
    alignment: Alignment,
    gate: AttentionGate,
}

impl Companion {
    fn forward(&self, gate_signal: &Tensor, features: &[Tensor]) -> Result<Tensor> {
        let feature = &features[self.source];
        let aligned = match &self.alignment {
            Alignment::Native => feature.clone(),
            Alignment::Pool(factor) => feature.max_pool2d(*factor)?,
            Alignment::Upsample(up) => up.forward(feature)?,
        };
        self.gate.forward(gate_signal, &aligned)
    }
}

/// One upsampling stage producing features at `size >> level`.
#[derive(Debug, Clone)]
struct DecoderStage {
    level: usize,
    interp: ConvNormRelu,
    deconv: UpsampleNormRelu,
    companions: Vec<Companion>,
    fuse: Vec<ResBlock>,
    /// The deepest stage concatenates the gating signal instead of the
    /// interpolated branch; trained checkpoints depend on this.
    head_from_gate: bool,
    aux: Option<AuxHead>,
}

impl DecoderStage {
    fn forward(&self, prev: &Tensor, features: &[Tensor], image_size: usize) -> Result<Tensor> {
        let side = image_size >> self.level;

        let interp = self.interp.forward(prev)?.upsample_nearest2d(side, side)?;
        let deconv = self.deconv.forward(prev)?;
        let gate_signal = interp.add(&deconv)?;

        let head = if self.head_from_gate {
            Tensor::cat(&[&gate_signal, &deconv], 1)?
        } else {
            Tensor::cat(&[&interp, &deconv], 1)?
        };

        let mut parts = Vec::with_capacity(1 + self.companions.len());
        parts.push(head);
        for companion in &self.companions {
            parts.push(companion.forward(&gate_signal, features)?);
        }

        self.fuse
            .iter()
            .try_fold(Tensor::cat(&parts, 1)?, |x, block| block.forward(&x))
    }
}

// =============================================================================
// LesionNet
// =============================================================================

/// Network outputs, all channel-last `(batch, height, width, classes)` at the
/// input resolution with values in [0, 1].
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    /// Prediction head output; this is the only tensor used downstream
    pub primary: Tensor,
    /// Deep-supervision outputs, deepest stage first
    pub auxiliary: Vec<Tensor>,
}

/// The segmentation network.
#[derive(Debug, Clone)]
pub struct LesionNet {
    config: NetworkConfig,
    stem: Vec<ConvNormRelu>,
    encoder: Vec<EncoderStage>,
    decoder: Vec<DecoderStage>,
    head: PredictionHead,
}

impl LesionNet {
    /// Build the network and bind every parameter from `vb`.
    pub fn new(config: NetworkConfig, vb: VarBuilder) -> std::result::Result<Self, ModelError> {
        config.validate().map_err(ModelError::InvalidConfig)?;

        let stem = vec![
            ConvNormRelu::new(
                config.input_channels,
                FILTERS[0],
                3,
                1,
                vb.pp("preBlock.0"),
                vb.pp("preBlock.1"),
            )?,
            ConvNormRelu::new(
                FILTERS[0],
                FILTERS[0],
                3,
                1,
                vb.pp("preBlock.3"),
                vb.pp("preBlock.4"),
            )?,
        ];

        let encoder = ENCODER_BLOCKS
            .iter()
            .enumerate()
            .map(|(stage, &count)| build_encoder_stage(stage, count, &vb))
            .collect::<Result<Vec<_>>>()?;

        let decoder = (0..COMPANION_SOURCES)
            .rev()
            .map(|level| build_decoder_stage(level, config.num_classes, &vb))
            .collect::<Result<Vec<_>>>()?;

        let head = PredictionHead::new(FILTERS[0], config.num_classes, vb.pp("pred"))?;

        Ok(Self {
            config,
            stem,
            encoder,
            decoder,
            head,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Run a forward pass on an NCHW input.
    pub fn forward(&self, input: &Tensor) -> Result<NetworkOutput> {
        let (_, channels, height, width) = input.dims4()?;
        let size = self.config.image_size;
        if channels != self.config.input_channels || height != size || width != size {
            candle_core::bail!(
                "expected input (N, {}, {}, {}), got (N, {}, {}, {})",
                self.config.input_channels,
                size,
                size,
                channels,
                height,
                width
            );
        }

        let mut features = Vec::with_capacity(self.encoder.len() + 1);
        features.push(
            self.stem
                .iter()
                .try_fold(input.clone(), |x, layer| layer.forward(&x))?,
        );
        for stage in &self.encoder {
            let next = stage.forward(&features[features.len() - 1])?;
            features.push(next);
        }

        let mut current = features[features.len() - 1].clone();
        let mut auxiliary = Vec::with_capacity(self.decoder.len());
        for stage in &self.decoder {
            current = stage.forward(&current, &features, size)?;
            if let Some(aux) = &stage.aux {
                auxiliary.push(channel_last(&aux.forward(&current)?)?);
            }
        }

        let primary = channel_last(&self.head.forward(&current)?)?;
        Ok(NetworkOutput { primary, auxiliary })
    }
}

fn channel_last(xs: &Tensor) -> Result<Tensor> {
    xs.permute((0, 2, 3, 1))?.contiguous()
}

fn build_encoder_stage(stage: usize, count: usize, vb: &VarBuilder) -> Result<EncoderStage> {
    let vb = vb.pp(format!("forw{}", stage + 1));
    let out = FILTERS[stage + 1];
    let blocks = (0..count)
        .map(|i| {
            let input = if i == 0 { FILTERS[stage] } else { out };
            ResBlock::new(input, out, vb.pp(i))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(EncoderStage { blocks })
}

fn build_decoder_stage(level: usize, num_classes: usize, vb: &VarBuilder) -> Result<DecoderStage> {
    let width = FILTERS[level];
    let deep = FILTERS[level + 1];

    let interp = ConvNormRelu::new(
        deep,
        width,
        3,
        0,
        vb.pp(format!("up{}.0", level + 1)),
        vb.pp(format!("up{}.1", level + 1)),
    )?;
    let deconv = UpsampleNormRelu::new(deep, width, 2, vb.pp(format!("deconv{}", level + 1)))?;

    let mut companions = Vec::with_capacity(COMPANION_SOURCES);
    let mut fuse_in = 2 * width;
    for source in 0..COMPANION_SOURCES {
        let (alignment, channels) = if source == level {
            (Alignment::Native, FILTERS[source])
        } else if source < level {
            (Alignment::Pool(1 << (level - source)), FILTERS[source])
        } else {
            let up = UpsampleNormRelu::new(
                FILTERS[source],
                FILTERS[source - 1],
                1 << (source - level),
                vb.pp(format!("up_out{}_gate{}", source, level)),
            )?;
            (Alignment::Upsample(up), FILTERS[source - 1])
        };
        let gate = AttentionGate::new(
            width,
            channels,
            width,
            vb.pp(format!("att{}_{}", level, source + 1)),
        )?;
        fuse_in += channels;
        companions.push(Companion {
            source,
            alignment,
            gate,
        });
    }

    let back = vb.pp(format!("back{}", COMPANION_SOURCES - level));
    let fuse = vec![
        ResBlock::new(fuse_in, width, back.pp(0))?,
        ResBlock::new(width, width, back.pp(1))?,
    ];

    let aux = if level > 0 {
        Some(AuxHead::new(
            width,
            num_classes,
            1 << level,
            vb.pp(format!("out_conv{}.0", COMPANION_SOURCES - level)),
        )?)
    } else {
        None
    };

    Ok(DecoderStage {
        level,
        interp,
        deconv,
        companions,
        fuse,
        head_from_gate: level == COMPANION_SOURCES - 1,
        aux,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    const TEST_SIZE: usize = 64;

    fn build(varmap: &VarMap) -> LesionNet {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        LesionNet::new(NetworkConfig::with_image_size(TEST_SIZE), vb).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(NetworkConfig::default().validate().is_ok());
        assert!(NetworkConfig::with_image_size(48).validate().is_ok());
        assert!(NetworkConfig::with_image_size(32).validate().is_err());
        assert!(NetworkConfig::with_image_size(100).validate().is_err());

        let config = NetworkConfig {
            num_classes: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let result = LesionNet::new(NetworkConfig::with_image_size(60), vb);
        assert!(matches!(result, Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn test_output_shapes() {
        let varmap = VarMap::new();
        let net = build(&varmap);

        let input = Tensor::ones((1, 3, TEST_SIZE, TEST_SIZE), DType::F32, &Device::Cpu).unwrap();
        let output = net.forward(&input).unwrap();

        assert_eq!(output.primary.dims(), &[1, TEST_SIZE, TEST_SIZE, NUM_CLASSES]);
        assert_eq!(output.auxiliary.len(), 3);
        for aux in &output.auxiliary {
            assert_eq!(aux.dims(), &[1, TEST_SIZE, TEST_SIZE, NUM_CLASSES]);
        }

        let values: Vec<f32> = output.primary.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_primary_output_comes_from_pred_head() {
        let varmap = VarMap::new();
        let net = build(&varmap);
        {
            let data = varmap.data().lock().unwrap();
            let weight = data.get("pred.3.weight").unwrap();
            weight.set(&weight.as_tensor().zeros_like().unwrap()).unwrap();
            let bias = Tensor::new(&[-20f32, 20.0, -20.0, -20.0, -20.0], &Device::Cpu).unwrap();
            data.get("pred.3.bias").unwrap().set(&bias).unwrap();
        }

        let input = Tensor::ones((1, 3, TEST_SIZE, TEST_SIZE), DType::F32, &Device::Cpu).unwrap();
        let output = net.forward(&input).unwrap();

        let primary: Vec<f32> = output.primary.flatten_all().unwrap().to_vec1().unwrap();
        for pixel in primary.chunks_exact(NUM_CLASSES) {
            assert!(pixel[1] > 0.99);
            assert!(pixel[0] < 0.01);
        }

        let last_aux: Vec<f32> = output.auxiliary[output.auxiliary.len() - 1]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_ne!(primary, last_aux);
    }

    #[test]
    fn test_wrong_input_shape_fails() {
        let varmap = VarMap::new();
        let net = build(&varmap);

        let input = Tensor::ones((1, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(net.forward(&input).is_err());

        let input = Tensor::ones((1, 4, TEST_SIZE, TEST_SIZE), DType::F32, &Device::Cpu).unwrap();
        assert!(net.forward(&input).is_err());
    }

    #[test]
    fn test_parameter_names_follow_checkpoint_layout() {
        let varmap = VarMap::new();
        let _net = build(&varmap);

        let data = varmap.data().lock().unwrap();
        for name in [
            "preBlock.0.weight",
            "preBlock.4.running_var",
            "forw1.0.shortcut.0.weight",
            "forw4.3.sn2.mean_weight",
            "up4.0.weight",
            "deconv1.1.bias",
            "up_out3_gate0.0.weight",
            "att3_4.W_g.0.weight",
            "att0_1.psi_c.0.weight",
            "back1.0.shortcut.1.weight",
            "out_conv3.0.weight",
            "pred.3.bias",
        ] {
            assert!(data.contains_key(name), "missing parameter {name}");
        }
        assert!(!data.contains_key("forw1.1.shortcut.0.weight"));
        assert!(!data.contains_key("out_conv4.0.weight"));
    }

    #[test]
    fn test_fusion_widths() {
        let varmap = VarMap::new();
        let _net = build(&varmap);

        let data = varmap.data().lock().unwrap();
        for (stage, expected) in [(1, 992), (2, 608), (3, 416), (4, 320)] {
            let weight = data
                .get(&format!("back{stage}.0.conv1.weight"))
                .unwrap()
                .as_tensor()
                .clone();
            assert_eq!(weight.dims()[1], expected, "back{stage}");
        }
    }
}
