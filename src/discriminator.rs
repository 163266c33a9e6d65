//! Conditional GAN discriminator builder.
//!
//! Validates the configuration, folds the residual blocks over the image,
//! applies a final activation and global pooling, and attaches one of four
//! heads. All parameters are registered under the caller's `nn::Path`; the
//! returned module owns no state beyond the layer handles.

use tch::{nn, Tensor};

use crate::config::{DiscriminatorConfig, HeadType, Resample};
use crate::error::ConfigError;
use crate::layers::conditional::ConditionalLinear;
use crate::layers::spectral::SpectralOptions;
use crate::layers::{global_avg_pool2d, global_sum_pool2d, DenseLayer, EmbeddingLayer, Primitives};
use crate::resblock::{ResBlock, ResBlockOptions};

/// Discriminator head outputs: a scalar score per sample, plus class logits
/// for the auxiliary-classifier variant.
#[derive(Debug)]
pub struct DiscriminatorOutput {
    /// Adversarial score, shape `[batch, 1]`.
    pub score: Tensor,
    /// Class logits, shape `[batch, classes]`; `AC_GAN` head only.
    pub class_logits: Option<Tensor>,
}

impl DiscriminatorOutput {
    /// Flattens the outputs in head order (score first).
    pub fn into_vec(self) -> Vec<Tensor> {
        let mut outputs = vec![self.score];
        if let Some(logits) = self.class_logits {
            outputs.push(logits);
        }
        outputs
    }
}

#[derive(Debug)]
enum Head {
    AcGan { adv: DenseLayer, classifier: nn::Linear },
    Projective { adv: DenseLayer, embedding: EmbeddingLayer },
    Unconditional { adv: DenseLayer },
    Conditional { adv: DenseLayer, conditional: ConditionalLinear },
}

impl Head {
    fn num_outputs(&self) -> usize {
        match self {
            Head::AcGan { .. } => 2,
            _ => 1,
        }
    }
}

/// Residual conditional GAN discriminator.
#[derive(Debug)]
pub struct Discriminator {
    blocks: Vec<ResBlock>,
    sum_pool: bool,
    head: Head,
}

impl Discriminator {
    /// Build the discriminator described by `config`, registering all
    /// parameters under `path`. Fails before creating any parameter if the
    /// configuration is invalid.
    pub fn new(path: &nn::Path, config: &DiscriminatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let prim = Primitives {
            spectral: config.spectral,
            depthwise: config.depthwise,
            classes: config.number_of_classes,
            normalization: config.normalization,
            opts: SpectralOptions {
                iterations: config.spectral_iterations,
                fully_diff: config.fully_diff_spectral,
                conv_singular: config.conv_singular,
                renormalize_conditional: config.renormalize_conditional,
            },
        };

        let mut blocks = Vec::with_capacity(config.block_sizes.len());
        let mut in_dim = config.image_shape.0;
        let mut hw = (config.image_shape.1, config.image_shape.2);
        for (i, (&size, &resample)) in
            config.block_sizes.iter().zip(config.resamples.iter()).enumerate()
        {
            let projection_needed = in_dim != size || resample != Resample::Same;
            let opts = ResBlockOptions {
                resample,
                is_first: i == 0,
                conditional_bottleneck: config.conditional_bottleneck,
                unconditional_bottleneck: config.unconditional_bottleneck,
                conditional_shortcut: config.conditional_shortcut,
                unconditional_shortcut: config.unconditional_shortcut && projection_needed,
            };
            blocks.push(ResBlock::new(
                &(path / format!("block_{i}")),
                &prim,
                in_dim,
                size,
                3,
                hw,
                &opts,
            ));
            in_dim = size;
            hw = match resample {
                Resample::Down => (hw.0 / 2, hw.1 / 2),
                Resample::Up => (hw.0 * 2, hw.1 * 2),
                Resample::Same => hw,
            };
        }

        let features = in_dim;
        let head = match config.head {
            HeadType::AcGan => Head::AcGan {
                adv: prim.dense(&(path / "adv"), features, 1),
                // the auxiliary classifier stays un-normalized even in
                // spectral configurations
                classifier: nn::linear(
                    path / "classifier",
                    features,
                    config.number_of_classes,
                    Default::default(),
                ),
            },
            HeadType::Projective => Head::Projective {
                adv: prim.dense(&(path / "adv"), features, 1),
                embedding: prim.embedding(&(path / "embedding"), features),
            },
            HeadType::Unconditional => Head::Unconditional {
                adv: prim.dense(&(path / "adv"), features, 1),
            },
            HeadType::Conditional => Head::Conditional {
                adv: prim.dense(&(path / "adv"), features, 1),
                conditional: prim.cond_dense(&(path / "cond_adv"), features, 1),
            },
        };

        Ok(Self { blocks, sum_pool: config.sum_pool, head })
    }

    /// Number of output tensors produced per forward pass.
    pub fn num_outputs(&self) -> usize {
        self.head.num_outputs()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Score a batch of images. `labels` is an int64 `[batch]` tensor; it is
    /// ignored by heads and blocks without class conditioning.
    pub fn forward_t(&self, images: &Tensor, labels: &Tensor, train: bool) -> DiscriminatorOutput {
        let cls = labels.view([-1]);
        let mut ys = images.shallow_clone();
        for block in &self.blocks {
            ys = block.forward_t(&ys, &cls, train);
        }
        ys = ys.relu();
        let pooled = if self.sum_pool { global_sum_pool2d(&ys) } else { global_avg_pool2d(&ys) };

        match &self.head {
            Head::AcGan { adv, classifier } => DiscriminatorOutput {
                score: adv.forward_t(&pooled, train),
                class_logits: Some(pooled.apply(classifier)),
            },
            Head::Projective { adv, embedding } => {
                let emb = embedding.forward_t(&cls, train);
                let phi = pooled.unsqueeze(1).bmm(&emb.unsqueeze(2)).reshape([-1, 1]);
                DiscriminatorOutput {
                    score: phi + adv.forward_t(&pooled, train),
                    class_logits: None,
                }
            }
            Head::Unconditional { adv } => DiscriminatorOutput {
                score: adv.forward_t(&pooled, train),
                class_logits: None,
            },
            Head::Conditional { adv, conditional } => DiscriminatorOutput {
                score: conditional.forward_t(&pooled, &cls, train) + adv.forward_t(&pooled, train),
                class_logits: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Normalization;
    use tch::{nn::VarStore, Device, Kind, Tensor};

    fn small_config(head: HeadType) -> DiscriminatorConfig {
        DiscriminatorConfig {
            image_shape: (3, 16, 16),
            block_sizes: vec![32, 32],
            resamples: vec![Resample::Down, Resample::Same],
            number_of_classes: 10,
            head,
            ..Default::default()
        }
    }

    fn batch() -> (Tensor, Tensor) {
        let images = Tensor::randn([4, 3, 16, 16], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[0i64, 3, 5, 9]);
        (images, labels)
    }

    #[test]
    fn test_ac_gan_head_emits_two_outputs() {
        let vs = VarStore::new(Device::Cpu);
        let disc = Discriminator::new(&vs.root(), &small_config(HeadType::AcGan)).unwrap();
        assert_eq!(disc.num_outputs(), 2);
        let (images, labels) = batch();
        let out = disc.forward_t(&images, &labels, true);
        assert_eq!(out.score.size(), vec![4, 1]);
        assert_eq!(out.class_logits.as_ref().unwrap().size(), vec![4, 10]);
        assert_eq!(out.into_vec().len(), 2);
    }

    #[test]
    fn test_single_output_heads() {
        for head in [HeadType::Projective, HeadType::Unconditional, HeadType::Conditional] {
            let vs = VarStore::new(Device::Cpu);
            let disc = Discriminator::new(&vs.root(), &small_config(head)).unwrap();
            assert_eq!(disc.num_outputs(), 1);
            let (images, labels) = batch();
            let out = disc.forward_t(&images, &labels, true);
            assert_eq!(out.score.size(), vec![4, 1]);
            assert!(out.class_logits.is_none());
        }
    }

    #[test]
    fn test_invalid_config_creates_no_parameters() {
        let vs = VarStore::new(Device::Cpu);
        let config = DiscriminatorConfig {
            block_sizes: vec![32, 32, 32],
            resamples: vec![Resample::Down, Resample::Same],
            ..Default::default()
        };
        let err = Discriminator::new(&vs.root(), &config).unwrap_err();
        assert_eq!(err, ConfigError::BlockResampleMismatch { blocks: 3, resamples: 2 });
        assert!(vs.variables().is_empty());
    }

    #[test]
    fn test_both_shortcuts_disabled_rejected() {
        let vs = VarStore::new(Device::Cpu);
        let config = DiscriminatorConfig {
            conditional_shortcut: false,
            unconditional_shortcut: false,
            ..small_config(HeadType::AcGan)
        };
        let err = Discriminator::new(&vs.root(), &config).unwrap_err();
        assert_eq!(err, ConfigError::ShortcutsDisabled);
        assert!(vs.variables().is_empty());
    }

    #[test]
    fn test_build_is_deterministic() {
        let config = DiscriminatorConfig {
            spectral: true,
            normalization: Normalization::ConditionalBatch,
            conditional_bottleneck: true,
            ..small_config(HeadType::Projective)
        };
        let vs_a = VarStore::new(Device::Cpu);
        let vs_b = VarStore::new(Device::Cpu);
        let _a = Discriminator::new(&vs_a.root(), &config).unwrap();
        let _b = Discriminator::new(&vs_b.root(), &config).unwrap();
        let mut names_a: Vec<String> = vs_a.variables().keys().cloned().collect();
        let mut names_b: Vec<String> = vs_b.variables().keys().cloned().collect();
        names_a.sort();
        names_b.sort();
        assert_eq!(names_a, names_b);
        assert!(!names_a.is_empty());
    }

    #[test]
    fn test_spectral_projective_forward() {
        let vs = VarStore::new(Device::Cpu);
        let config = DiscriminatorConfig {
            spectral: true,
            sum_pool: true,
            ..small_config(HeadType::Projective)
        };
        let disc = Discriminator::new(&vs.root(), &config).unwrap();
        let (images, labels) = batch();
        let out = disc.forward_t(&images, &labels, true);
        assert_eq!(out.score.size(), vec![4, 1]);
    }

    #[test]
    fn test_fully_conditional_forward() {
        let vs = VarStore::new(Device::Cpu);
        let config = DiscriminatorConfig {
            spectral: true,
            conv_singular: false,
            normalization: Normalization::ConditionalBatch,
            conditional_bottleneck: true,
            unconditional_bottleneck: true,
            conditional_shortcut: true,
            depthwise: true,
            renormalize_conditional: true,
            spectral_iterations: 2,
            ..small_config(HeadType::Conditional)
        };
        let disc = Discriminator::new(&vs.root(), &config).unwrap();
        let (images, labels) = batch();
        let out = disc.forward_t(&images, &labels, true);
        assert_eq!(out.score.size(), vec![4, 1]);
    }
}
