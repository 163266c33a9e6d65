//! Class-conditional layer primitives.
//!
//! Each layer keeps a per-class bank of parameters selected at forward time
//! by an int64 `[batch]` label tensor (`index_select` on dim 0) and applied
//! with batched matmul or grouped convolution. Spectral normalization over
//! the bank supports a shared estimate (classes stacked into one matrix) or
//! per-class estimates via a batched power iteration.

use tch::{nn, Tensor};

use super::spectral::{SnConv2d, SpectralOptions};

const EPS: f64 = 1e-12;

fn batch_l2_normalize(t: &Tensor) -> Tensor {
    // t is [classes, 1, n]; the bmm yields each row's squared norm
    t / (t.bmm(&t.transpose(1, 2)).sqrt() + EPS)
}

/// Spectral normalization of a `[classes, rows, cols]` parameter bank.
#[derive(Debug)]
pub struct CondSpectralNorm {
    u: Tensor,
    iterations: i64,
    fully_diff: bool,
    per_class: bool,
}

impl CondSpectralNorm {
    pub fn new(path: &nn::Path, classes: i64, rows: i64, opts: &SpectralOptions) -> Self {
        let per_class = opts.renormalize_conditional;
        let dims: Vec<i64> = if per_class { vec![classes, 1, rows] } else { vec![1, classes * rows] };
        let u = path.zeros_no_grad("u", &dims);
        tch::no_grad(|| {
            let mut init = u.shallow_clone();
            init.copy_(&Tensor::randn(dims.as_slice(), (tch::Kind::Float, u.device())));
        });
        Self { u, iterations: opts.iterations.max(1), fully_diff: opts.fully_diff, per_class }
    }

    fn iterate_per_class(&self, w: &Tensor) -> (Tensor, Tensor) {
        let mut u = self.u.copy();
        let mut v = batch_l2_normalize(&u.bmm(w));
        u = batch_l2_normalize(&v.bmm(&w.transpose(1, 2)));
        for _ in 1..self.iterations {
            v = batch_l2_normalize(&u.bmm(w));
            u = batch_l2_normalize(&v.bmm(&w.transpose(1, 2)));
        }
        (u, v)
    }

    fn iterate_stacked(&self, w_mat: &Tensor) -> (Tensor, Tensor) {
        let mut u = self.u.copy();
        let mut v = l2_normalize(&u.matmul(w_mat));
        u = l2_normalize(&v.matmul(&w_mat.transpose(0, 1)));
        for _ in 1..self.iterations {
            v = l2_normalize(&u.matmul(w_mat));
            u = l2_normalize(&v.matmul(&w_mat.transpose(0, 1)));
        }
        (u, v)
    }

    fn store_u(&self, u: &Tensor) {
        tch::no_grad(|| {
            let mut stored = self.u.shallow_clone();
            stored.copy_(&u.detach());
        });
    }

    /// Returns the bank divided by its singular-value estimate(s).
    pub fn normalize(&self, w: &Tensor, train: bool) -> Tensor {
        if self.per_class {
            let (u, v) = if self.fully_diff {
                self.iterate_per_class(w)
            } else {
                tch::no_grad(|| self.iterate_per_class(&w.detach()))
            };
            if train {
                self.store_u(&u);
            }
            let sigma = u.bmm(w).bmm(&v.transpose(1, 2)); // [classes, 1, 1]
            w / sigma
        } else {
            let size = w.size();
            let w_mat = w.reshape([size[0] * size[1], size[2]]);
            let (u, v) = if self.fully_diff {
                self.iterate_stacked(&w_mat)
            } else {
                tch::no_grad(|| self.iterate_stacked(&w_mat.detach()))
            };
            if train {
                self.store_u(&u);
            }
            let sigma = u.matmul(&w_mat).matmul(&v.transpose(0, 1)); // [1, 1]
            w / sigma
        }
    }
}

fn l2_normalize(t: &Tensor) -> Tensor {
    t / (t.norm() + EPS)
}

/// Dense layer with one weight matrix per class.
#[derive(Debug)]
pub struct ConditionalLinear {
    ws: Tensor, // [classes, in, out]
    bs: Tensor, // [classes, out]
    norm: Option<CondSpectralNorm>,
}

impl ConditionalLinear {
    pub fn new(
        path: &nn::Path,
        classes: i64,
        in_dim: i64,
        out_dim: i64,
        spectral: Option<&SpectralOptions>,
    ) -> Self {
        Self {
            ws: path.var(
                "weight",
                &[classes, in_dim, out_dim],
                nn::Init::Randn { mean: 0.0, stdev: 0.02 },
            ),
            bs: path.var("bias", &[classes, out_dim], nn::Init::Const(0.0)),
            norm: spectral.map(|opts| CondSpectralNorm::new(path, classes, in_dim, opts)),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, cls: &Tensor, train: bool) -> Tensor {
        let w = match &self.norm {
            Some(norm) => norm.normalize(&self.ws, train),
            None => self.ws.shallow_clone(),
        };
        let cls = cls.view([-1]);
        let w_sel = w.index_select(0, &cls); // [batch, in, out]
        let b_sel = self.bs.index_select(0, &cls); // [batch, out]
        xs.unsqueeze(1).bmm(&w_sel).squeeze_dim(1) + b_sel
    }
}

/// 1x1 convolution with one kernel per class.
#[derive(Debug)]
pub struct ConditionalConv1x1 {
    ws: Tensor, // [classes, out, in]
    bs: Tensor, // [classes, out]
    norm: Option<CondSpectralNorm>,
}

impl ConditionalConv1x1 {
    pub fn new(
        path: &nn::Path,
        classes: i64,
        in_dim: i64,
        out_dim: i64,
        spectral: Option<&SpectralOptions>,
    ) -> Self {
        Self {
            ws: path.var(
                "weight",
                &[classes, out_dim, in_dim],
                nn::Init::Randn { mean: 0.0, stdev: 0.02 },
            ),
            bs: path.var("bias", &[classes, out_dim], nn::Init::Const(0.0)),
            norm: spectral.map(|opts| CondSpectralNorm::new(path, classes, out_dim, opts)),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, cls: &Tensor, train: bool) -> Tensor {
        let w = match &self.norm {
            Some(norm) => norm.normalize(&self.ws, train),
            None => self.ws.shallow_clone(),
        };
        let size = xs.size(); // [batch, in, h, w]
        let cls = cls.view([-1]);
        let w_sel = w.index_select(0, &cls); // [batch, out, in]
        let out_dim = w_sel.size()[1];
        let flat = xs.reshape([size[0], size[1], size[2] * size[3]]);
        let ys = w_sel.bmm(&flat).reshape([size[0], out_dim, size[2], size[3]]);
        let b_sel = self.bs.index_select(0, &cls).unsqueeze(-1).unsqueeze(-1);
        ys + b_sel
    }
}

/// Depthwise convolution with one kernel bank per class.
///
/// The per-sample grouped convolution folds the batch into the channel axis
/// and runs a single `conv2d` with `groups = batch * channels`.
#[derive(Debug)]
pub struct ConditionalDepthwiseConv2d {
    ws: Tensor, // [classes, channels, k, k]
    channels: i64,
    ksize: i64,
    norm: Option<CondSpectralNorm>,
}

impl ConditionalDepthwiseConv2d {
    pub fn new(
        path: &nn::Path,
        classes: i64,
        channels: i64,
        ksize: i64,
        spectral: Option<&SpectralOptions>,
    ) -> Self {
        Self {
            ws: path.var(
                "weight",
                &[classes, channels, ksize, ksize],
                nn::Init::Randn { mean: 0.0, stdev: 0.02 },
            ),
            channels,
            ksize,
            norm: spectral.map(|opts| CondSpectralNorm::new(path, classes, channels, opts)),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, cls: &Tensor, train: bool) -> Tensor {
        let w = match &self.norm {
            Some(norm) => {
                let size = self.ws.size();
                let flat = self.ws.reshape([size[0], size[1], size[2] * size[3]]);
                norm.normalize(&flat, train).reshape(size.as_slice())
            }
            None => self.ws.shallow_clone(),
        };
        let size = xs.size(); // [batch, channels, h, w]
        let (batch, h, w_dim) = (size[0], size[2], size[3]);
        let cls = cls.view([-1]);
        let w_sel = w
            .index_select(0, &cls)
            .reshape([batch * self.channels, 1, self.ksize, self.ksize]);
        let folded = xs.reshape([1, batch * self.channels, h, w_dim]);
        let pad = self.ksize / 2;
        folded
            .conv2d(&w_sel, None::<Tensor>, [1, 1], [pad, pad], [1, 1], batch * self.channels)
            .reshape([batch, self.channels, h, w_dim])
    }
}

#[derive(Debug)]
enum Pointwise {
    Plain(nn::Conv2D),
    Spectral(SnConv2d),
}

/// Depthwise-separable conditional convolution: per-class depthwise k x k
/// followed by a 1x1 pointwise conv (plain or spectral-normalized).
#[derive(Debug)]
pub struct SeparableConditionalConv {
    depthwise: ConditionalDepthwiseConv2d,
    pointwise: Pointwise,
}

impl SeparableConditionalConv {
    pub fn new(
        path: &nn::Path,
        classes: i64,
        in_dim: i64,
        out_dim: i64,
        ksize: i64,
        input_hw: (i64, i64),
        spectral: Option<&SpectralOptions>,
    ) -> Self {
        let depthwise =
            ConditionalDepthwiseConv2d::new(&(path / "depthwise"), classes, in_dim, ksize, spectral);
        let pointwise = match spectral {
            Some(opts) => Pointwise::Spectral(SnConv2d::new(
                &(path / "pointwise"),
                in_dim,
                out_dim,
                1,
                1,
                0,
                input_hw,
                opts,
            )),
            None => Pointwise::Plain(nn::conv2d(
                path / "pointwise",
                in_dim,
                out_dim,
                1,
                Default::default(),
            )),
        };
        Self { depthwise, pointwise }
    }

    pub fn forward_t(&self, xs: &Tensor, cls: &Tensor, train: bool) -> Tensor {
        let ys = self.depthwise.forward_t(xs, cls, train);
        match &self.pointwise {
            Pointwise::Plain(conv) => ys.apply(conv),
            Pointwise::Spectral(conv) => conv.forward_t(&ys, train),
        }
    }
}

/// Batch normalization with shared running statistics and a per-class affine.
#[derive(Debug)]
pub struct ConditionalBatchNorm {
    running_mean: Tensor,
    running_var: Tensor,
    gamma: Tensor, // [classes, channels]
    beta: Tensor,  // [classes, channels]
    momentum: f64,
    eps: f64,
}

impl ConditionalBatchNorm {
    pub fn new(path: &nn::Path, classes: i64, channels: i64) -> Self {
        Self {
            running_mean: path.zeros_no_grad("running_mean", &[channels]),
            running_var: path.ones_no_grad("running_var", &[channels]),
            gamma: path.var("gamma", &[classes, channels], nn::Init::Const(1.0)),
            beta: path.var("beta", &[classes, channels], nn::Init::Const(0.0)),
            momentum: 0.1,
            eps: 1e-5,
        }
    }

    pub fn forward_t(&self, xs: &Tensor, cls: &Tensor, train: bool) -> Tensor {
        let normed = xs.batch_norm(
            None::<&Tensor>,
            None::<&Tensor>,
            Some(&self.running_mean),
            Some(&self.running_var),
            train,
            self.momentum,
            self.eps,
            true,
        );
        let cls = cls.view([-1]);
        let gamma = self.gamma.index_select(0, &cls).unsqueeze(-1).unsqueeze(-1);
        let beta = self.beta.index_select(0, &cls).unsqueeze(-1).unsqueeze(-1);
        normed * gamma + beta
    }
}
