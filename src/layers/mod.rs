//! Layer primitives and the dispatch table that selects between their
//! plain, spectral-normalized and conditional implementations.

pub mod conditional;
pub mod spectral;

use tch::{nn, Kind, Tensor};

use crate::config::Normalization;
use conditional::{ConditionalBatchNorm, ConditionalConv1x1, ConditionalLinear, SeparableConditionalConv};
use spectral::{SnConv2d, SnEmbedding, SnLinear, SpectralOptions};

/// Global average pooling over the spatial dimensions: `[b, c, h, w] -> [b, c]`.
pub fn global_avg_pool2d(xs: &Tensor) -> Tensor {
    xs.mean_dim([2, 3].as_slice(), false, Kind::Float)
}

/// Global sum pooling over the spatial dimensions: `[b, c, h, w] -> [b, c]`.
pub fn global_sum_pool2d(xs: &Tensor) -> Tensor {
    xs.sum_dim_intlist([2, 3].as_slice(), false, Kind::Float)
}

/// 2x spatial downsampling by average pooling.
pub fn avg_pool_2x(xs: &Tensor) -> Tensor {
    xs.avg_pool2d([2, 2], [2, 2], [0, 0], false, true, None::<i64>)
}

/// 2x spatial upsampling by nearest-neighbor interpolation.
pub fn upsample_2x(xs: &Tensor) -> Tensor {
    let size = xs.size();
    xs.upsample_nearest2d([size[2] * 2, size[3] * 2], None, None)
}

/// A spatial convolution in any of its configured implementations.
#[derive(Debug)]
pub enum ConvLayer {
    Plain(nn::Conv2D),
    Spectral(SnConv2d),
    SeparableConditional(SeparableConditionalConv),
}

impl ConvLayer {
    pub fn forward_t(&self, xs: &Tensor, cls: &Tensor, train: bool) -> Tensor {
        match self {
            ConvLayer::Plain(conv) => xs.apply(conv),
            ConvLayer::Spectral(conv) => conv.forward_t(xs, train),
            ConvLayer::SeparableConditional(conv) => conv.forward_t(xs, cls, train),
        }
    }
}

/// A dense layer, plain or spectral-normalized.
#[derive(Debug)]
pub enum DenseLayer {
    Plain(nn::Linear),
    Spectral(SnLinear),
}

impl DenseLayer {
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            DenseLayer::Plain(linear) => xs.apply(linear),
            DenseLayer::Spectral(linear) => linear.forward_t(xs, train),
        }
    }
}

/// A class-embedding table, plain or spectral-normalized.
#[derive(Debug)]
pub enum EmbeddingLayer {
    Plain(nn::Embedding),
    Spectral(SnEmbedding),
}

impl EmbeddingLayer {
    pub fn forward_t(&self, cls: &Tensor, train: bool) -> Tensor {
        match self {
            EmbeddingLayer::Plain(emb) => cls.apply(emb),
            EmbeddingLayer::Spectral(emb) => emb.forward_t(cls, train),
        }
    }
}

/// The normalization wrapper applied inside residual blocks.
#[derive(Debug)]
pub enum FeatureNorm {
    Identity,
    Batch(nn::BatchNorm),
    ConditionalBatch(ConditionalBatchNorm),
}

impl FeatureNorm {
    pub fn forward_t(&self, xs: &Tensor, cls: &Tensor, train: bool) -> Tensor {
        match self {
            FeatureNorm::Identity => xs.shallow_clone(),
            FeatureNorm::Batch(bn) => xs.apply_t(bn, train),
            FeatureNorm::ConditionalBatch(bn) => bn.forward_t(xs, cls, train),
        }
    }
}

/// Selects layer implementations from the configuration flags.
///
/// One instance is built per network and consulted for every primitive, so
/// the plain/spectral/depthwise choice is made in exactly one place.
#[derive(Debug, Clone)]
pub(crate) struct Primitives {
    pub spectral: bool,
    pub depthwise: bool,
    pub classes: i64,
    pub normalization: Normalization,
    pub opts: SpectralOptions,
}

impl Primitives {
    fn spectral_opts(&self) -> Option<&SpectralOptions> {
        self.spectral.then_some(&self.opts)
    }

    /// A k x k convolution preserving spatial size (stride 1, same padding).
    /// `input_hw` feeds the conv-operator singular-value estimator.
    pub fn conv(
        &self,
        path: &nn::Path,
        in_dim: i64,
        out_dim: i64,
        ksize: i64,
        input_hw: (i64, i64),
    ) -> ConvLayer {
        let padding = ksize / 2;
        if self.depthwise && ksize > 1 {
            ConvLayer::SeparableConditional(SeparableConditionalConv::new(
                path,
                self.classes,
                in_dim,
                out_dim,
                ksize,
                input_hw,
                self.spectral_opts(),
            ))
        } else if self.spectral {
            ConvLayer::Spectral(SnConv2d::new(
                path, in_dim, out_dim, ksize, 1, padding, input_hw, &self.opts,
            ))
        } else {
            ConvLayer::Plain(nn::conv2d(
                path,
                in_dim,
                out_dim,
                ksize,
                nn::ConvConfig { stride: 1, padding, ..Default::default() },
            ))
        }
    }

    pub fn dense(&self, path: &nn::Path, in_dim: i64, out_dim: i64) -> DenseLayer {
        if self.spectral {
            DenseLayer::Spectral(SnLinear::new(path, in_dim, out_dim, &self.opts))
        } else {
            DenseLayer::Plain(nn::linear(path, in_dim, out_dim, Default::default()))
        }
    }

    pub fn cond_dense(&self, path: &nn::Path, in_dim: i64, out_dim: i64) -> ConditionalLinear {
        ConditionalLinear::new(path, self.classes, in_dim, out_dim, self.spectral_opts())
    }

    pub fn cond_conv1x1(&self, path: &nn::Path, in_dim: i64, out_dim: i64) -> ConditionalConv1x1 {
        ConditionalConv1x1::new(path, self.classes, in_dim, out_dim, self.spectral_opts())
    }

    pub fn embedding(&self, path: &nn::Path, dim: i64) -> EmbeddingLayer {
        if self.spectral {
            EmbeddingLayer::Spectral(SnEmbedding::new(path, self.classes, dim, &self.opts))
        } else {
            EmbeddingLayer::Plain(nn::embedding(path, self.classes, dim, Default::default()))
        }
    }

    pub fn feature_norm(&self, path: &nn::Path, channels: i64) -> FeatureNorm {
        match self.normalization {
            Normalization::None => FeatureNorm::Identity,
            Normalization::Batch => {
                FeatureNorm::Batch(nn::batch_norm2d(path, channels, Default::default()))
            }
            Normalization::ConditionalBatch => {
                FeatureNorm::ConditionalBatch(ConditionalBatchNorm::new(path, self.classes, channels))
            }
        }
    }
}
