//! The conditional residual block shared by both network builders.
//!
//! Main path: (norm -> ReLU ->) conv -> optional 1x1 bottlenecks -> norm ->
//! ReLU -> conv, with UP resampling before the first conv and DOWN after the
//! second. Shortcut path: optional unconditional 1x1 projection and/or
//! class-conditional 1x1 projection, resampled to match; identity when the
//! block neither resamples nor changes width.

use tch::{nn, Tensor};

use crate::config::Resample;
use crate::layers::conditional::ConditionalConv1x1;
use crate::layers::{avg_pool_2x, upsample_2x, ConvLayer, FeatureNorm, Primitives};

/// Per-block switches resolved by the builder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResBlockOptions {
    pub resample: Resample,
    /// First discriminator block: skip the leading norm/activation.
    pub is_first: bool,
    pub conditional_bottleneck: bool,
    pub unconditional_bottleneck: bool,
    pub conditional_shortcut: bool,
    /// Already resolved: enabled and actually needed for this block.
    pub unconditional_shortcut: bool,
}

#[derive(Debug)]
pub struct ResBlock {
    resample: Resample,
    is_first: bool,
    norm1: Option<FeatureNorm>,
    norm2: FeatureNorm,
    conv1: ConvLayer,
    conv2: ConvLayer,
    cond_bottleneck: Option<ConditionalConv1x1>,
    uncond_bottleneck: Option<ConvLayer>,
    cond_shortcut: Option<ConditionalConv1x1>,
    uncond_shortcut: Option<ConvLayer>,
}

impl ResBlock {
    pub(crate) fn new(
        path: &nn::Path,
        prim: &Primitives,
        in_dim: i64,
        out_dim: i64,
        ksize: i64,
        input_hw: (i64, i64),
        opts: &ResBlockOptions,
    ) -> Self {
        // spatial size seen by the main-path convolutions
        let conv_hw = match opts.resample {
            Resample::Up => (input_hw.0 * 2, input_hw.1 * 2),
            _ => input_hw,
        };
        // spatial size seen by the unconditional shortcut projection
        let shortcut_hw = match opts.resample {
            Resample::Down if opts.is_first => (input_hw.0 / 2, input_hw.1 / 2),
            Resample::Up => conv_hw,
            _ => input_hw,
        };

        let norm1 = (!opts.is_first).then(|| prim.feature_norm(&(path / "norm1"), in_dim));
        let norm2 = prim.feature_norm(&(path / "norm2"), out_dim);
        let conv1 = prim.conv(&(path / "conv1"), in_dim, out_dim, ksize, conv_hw);
        let conv2 = prim.conv(&(path / "conv2"), out_dim, out_dim, ksize, conv_hw);
        let cond_bottleneck = opts
            .conditional_bottleneck
            .then(|| prim.cond_conv1x1(&(path / "cond_bottleneck"), out_dim, out_dim));
        let uncond_bottleneck = opts
            .unconditional_bottleneck
            .then(|| prim.conv(&(path / "bottleneck"), out_dim, out_dim, 1, conv_hw));
        let cond_shortcut = opts
            .conditional_shortcut
            .then(|| prim.cond_conv1x1(&(path / "cond_shortcut"), in_dim, out_dim));
        let uncond_shortcut = opts
            .unconditional_shortcut
            .then(|| prim.conv(&(path / "shortcut"), in_dim, out_dim, 1, shortcut_hw));

        Self {
            resample: opts.resample,
            is_first: opts.is_first,
            norm1,
            norm2,
            conv1,
            conv2,
            cond_bottleneck,
            uncond_bottleneck,
            cond_shortcut,
            uncond_shortcut,
        }
    }

    /// Applies a 1x1 projection with the resampling order this block uses.
    fn project<F>(&self, xs: &Tensor, f: F) -> Tensor
    where
        F: Fn(&Tensor) -> Tensor,
    {
        match self.resample {
            Resample::Down => {
                if self.is_first {
                    f(&avg_pool_2x(xs))
                } else {
                    avg_pool_2x(&f(xs))
                }
            }
            Resample::Up => f(&upsample_2x(xs)),
            Resample::Same => f(xs),
        }
    }

    fn shortcut(&self, xs: &Tensor, cls: &Tensor, train: bool) -> Tensor {
        let mut acc: Option<Tensor> = None;
        if let Some(proj) = &self.uncond_shortcut {
            acc = Some(self.project(xs, |t| proj.forward_t(t, cls, train)));
        }
        if let Some(proj) = &self.cond_shortcut {
            let branch = self.project(xs, |t| proj.forward_t(t, cls, train));
            acc = Some(match acc {
                Some(total) => total + branch,
                None => branch,
            });
        }
        match acc {
            Some(total) => total,
            None => match self.resample {
                Resample::Down => avg_pool_2x(xs),
                Resample::Up => upsample_2x(xs),
                Resample::Same => xs.shallow_clone(),
            },
        }
    }

    pub fn forward_t(&self, xs: &Tensor, cls: &Tensor, train: bool) -> Tensor {
        let shortcut = self.shortcut(xs, cls, train);

        let mut ys = xs.shallow_clone();
        if let Some(norm1) = &self.norm1 {
            ys = norm1.forward_t(&ys, cls, train).relu();
        }
        if self.resample == Resample::Up {
            ys = upsample_2x(&ys);
        }
        ys = self.conv1.forward_t(&ys, cls, train);
        if let Some(bottleneck) = &self.cond_bottleneck {
            ys = bottleneck.forward_t(&ys, cls, train);
        }
        if let Some(bottleneck) = &self.uncond_bottleneck {
            ys = bottleneck.forward_t(&ys, cls, train);
        }
        ys = self.norm2.forward_t(&ys, cls, train).relu();
        ys = self.conv2.forward_t(&ys, cls, train);
        if self.resample == Resample::Down {
            ys = avg_pool_2x(&ys);
        }

        shortcut + ys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Normalization;
    use crate::layers::spectral::SpectralOptions;
    use tch::{nn::VarStore, Device, Kind};

    fn primitives() -> Primitives {
        Primitives {
            spectral: false,
            depthwise: false,
            classes: 10,
            normalization: Normalization::None,
            opts: SpectralOptions::default(),
        }
    }

    fn options(resample: Resample) -> ResBlockOptions {
        ResBlockOptions {
            resample,
            is_first: false,
            conditional_bottleneck: false,
            unconditional_bottleneck: false,
            conditional_shortcut: false,
            unconditional_shortcut: true,
        }
    }

    fn forward(block: &ResBlock, xs: &Tensor) -> Tensor {
        let cls = Tensor::from_slice(&[0i64, 1]);
        block.forward_t(xs, &cls, true)
    }

    #[test]
    fn test_down_block_halves_spatial() {
        let vs = VarStore::new(Device::Cpu);
        let block = ResBlock::new(&vs.root(), &primitives(), 3, 16, 3, (16, 16), &options(Resample::Down));
        let xs = Tensor::randn([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        assert_eq!(forward(&block, &xs).size(), vec![2, 16, 8, 8]);
    }

    #[test]
    fn test_up_block_doubles_spatial() {
        let vs = VarStore::new(Device::Cpu);
        let block = ResBlock::new(&vs.root(), &primitives(), 8, 4, 3, (8, 8), &options(Resample::Up));
        let xs = Tensor::randn([2, 8, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(forward(&block, &xs).size(), vec![2, 4, 16, 16]);
    }

    #[test]
    fn test_same_block_keeps_spatial() {
        let vs = VarStore::new(Device::Cpu);
        let block = ResBlock::new(&vs.root(), &primitives(), 8, 8, 3, (8, 8), &{
            let mut opts = options(Resample::Same);
            // width unchanged, so the builder would resolve the projection away
            opts.unconditional_shortcut = false;
            opts.conditional_shortcut = true;
            opts
        });
        let xs = Tensor::randn([2, 8, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(forward(&block, &xs).size(), vec![2, 8, 8, 8]);
    }

    #[test]
    fn test_identity_shortcut_block() {
        let vs = VarStore::new(Device::Cpu);
        let mut opts = options(Resample::Same);
        opts.unconditional_shortcut = false; // resolved away: same width, no resample
        let block = ResBlock::new(&vs.root(), &primitives(), 8, 8, 3, (8, 8), &opts);
        let xs = Tensor::randn([2, 8, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(forward(&block, &xs).size(), vec![2, 8, 8, 8]);
    }

    #[test]
    fn test_first_block_skips_leading_norm() {
        let vs = VarStore::new(Device::Cpu);
        let prim = Primitives { normalization: Normalization::Batch, ..primitives() };
        let mut opts = options(Resample::Down);
        opts.is_first = true;
        let root = vs.root();
        let block = ResBlock::new(&(&root / "block"), &prim, 3, 16, 3, (16, 16), &opts);
        let xs = Tensor::randn([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        assert_eq!(forward(&block, &xs).size(), vec![2, 16, 8, 8]);
        // only norm2 registered parameters
        let names: Vec<String> = vs.variables().keys().cloned().collect();
        assert!(names.iter().any(|n| n.contains("norm2")));
        assert!(!names.iter().any(|n| n.contains("norm1")));
    }

    #[test]
    fn test_bottlenecks_and_conditional_shortcut() {
        let vs = VarStore::new(Device::Cpu);
        let opts = ResBlockOptions {
            resample: Resample::Down,
            is_first: false,
            conditional_bottleneck: true,
            unconditional_bottleneck: true,
            conditional_shortcut: true,
            unconditional_shortcut: true,
        };
        let block = ResBlock::new(&vs.root(), &primitives(), 4, 8, 3, (8, 8), &opts);
        let xs = Tensor::randn([2, 4, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(forward(&block, &xs).size(), vec![2, 8, 4, 4]);
    }
}
