//! Conditional GAN generator builder.
//!
//! Mirror image of the discriminator: a dense projection of the latent
//! vector to a small feature map, UP-sampling residual blocks, then a final
//! norm / ReLU / conv / tanh to image space.

use tch::{nn, Tensor};

use crate::config::{GeneratorConfig, Resample};
use crate::error::ConfigError;
use crate::layers::spectral::SpectralOptions;
use crate::layers::{ConvLayer, DenseLayer, FeatureNorm, Primitives};
use crate::resblock::{ResBlock, ResBlockOptions};

/// Residual conditional GAN generator.
#[derive(Debug)]
pub struct Generator {
    base_channels: i64,
    base_size: (i64, i64),
    dense: DenseLayer,
    blocks: Vec<ResBlock>,
    final_norm: FeatureNorm,
    final_conv: ConvLayer,
}

impl Generator {
    /// Build the generator described by `config`, registering all parameters
    /// under `path`. Fails before creating any parameter if the
    /// configuration is invalid.
    pub fn new(path: &nn::Path, config: &GeneratorConfig) -> Result<Self, ConfigError> {
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

        let base_channels = config.block_sizes.first().copied().unwrap_or(config.latent_dim);
        let base_size = config.base_size;
        let dense = prim.dense(
            &(path / "dense"),
            config.latent_dim,
            base_channels * base_size.0 * base_size.1,
        );

        let mut blocks = Vec::with_capacity(config.block_sizes.len());
        let mut in_dim = base_channels;
        let mut hw = base_size;
        for (i, (&size, &resample)) in
            config.block_sizes.iter().zip(config.resamples.iter()).enumerate()
        {
            let projection_needed = in_dim != size || resample != Resample::Same;
            let opts = ResBlockOptions {
                resample,
                is_first: false,
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

        let final_norm = prim.feature_norm(&(path / "final_norm"), in_dim);
        let final_conv = prim.conv(&(path / "final_conv"), in_dim, config.output_channels, 3, hw);

        Ok(Self { base_channels, base_size, dense, blocks, final_norm, final_conv })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Synthesize a batch of images in `[-1, 1]` from latent vectors of
    /// shape `[batch, latent_dim]` and int64 `[batch]` labels.
    pub fn forward_t(&self, latent: &Tensor, labels: &Tensor, train: bool) -> Tensor {
        let cls = labels.view([-1]);
        let mut ys = self.dense.forward_t(latent, train).reshape([
            -1,
            self.base_channels,
            self.base_size.0,
            self.base_size.1,
        ]);
        for block in &self.blocks {
            ys = block.forward_t(&ys, &cls, train);
        }
        ys = self.final_norm.forward_t(&ys, &cls, train).relu();
        ys = self.final_conv.forward_t(&ys, &cls, train);
        ys.tanh()
    }
}
