//! Spectral-normalized layer primitives.
//!
//! Each layer keeps its raw weight as a trainable variable and divides it by
//! an estimate of its largest singular value on every forward pass. The
//! estimate comes from power iteration with a persistent, non-trainable `u`
//! vector that is refreshed in place during training passes.
//!
//! Two estimators are available for convolutions: `Matrix` reshapes the
//! kernel to a 2-d matrix, `Operator` runs the iteration through the actual
//! convolution operator against the layer's input spatial size.

use tch::{nn, Kind, Tensor};

const EPS: f64 = 1e-12;

/// Knobs shared by every spectral-normalized layer.
#[derive(Debug, Clone, Copy)]
pub struct SpectralOptions {
    /// Power-iteration steps per forward pass.
    pub iterations: i64,
    /// Keep the iterations on the autodiff tape instead of detaching them.
    pub fully_diff: bool,
    /// Use the convolution-operator estimator for conv layers.
    pub conv_singular: bool,
    /// Per-class estimates in conditional layers.
    pub renormalize_conditional: bool,
}

impl Default for SpectralOptions {
    fn default() -> Self {
        Self {
            iterations: 1,
            fully_diff: false,
            conv_singular: true,
            renormalize_conditional: false,
        }
    }
}

fn l2_normalize(t: &Tensor) -> Tensor {
    t / (t.norm() + EPS)
}

/// Creates a non-trainable vector of the given shape, initialized from a
/// standard normal. Registered in the var store so it moves with the model
/// across devices but is never touched by an optimizer.
fn persistent_randn(path: &nn::Path, name: &str, dims: &[i64]) -> Tensor {
    let u = path.zeros_no_grad(name, dims);
    tch::no_grad(|| {
        let mut init = u.shallow_clone();
        init.copy_(&Tensor::randn(dims, (Kind::Float, u.device())));
    });
    u
}

/// Power-iteration estimator over a `[rows, cols]` weight matrix.
#[derive(Debug)]
pub struct SpectralNorm {
    u: Tensor,
    iterations: i64,
    fully_diff: bool,
}

impl SpectralNorm {
    pub fn new(path: &nn::Path, rows: i64, opts: &SpectralOptions) -> Self {
        Self {
            u: persistent_randn(path, "u", &[1, rows]),
            iterations: opts.iterations.max(1),
            fully_diff: opts.fully_diff,
        }
    }

    fn iterate(&self, w_mat: &Tensor) -> (Tensor, Tensor) {
        // fresh storage: the stored estimate is refreshed in place later and
        // must not alias anything the autodiff tape saved
        let mut u = self.u.copy();
        let mut v = l2_normalize(&u.matmul(w_mat));
        u = l2_normalize(&v.matmul(&w_mat.transpose(0, 1)));
        for _ in 1..self.iterations {
            v = l2_normalize(&u.matmul(w_mat));
            u = l2_normalize(&v.matmul(&w_mat.transpose(0, 1)));
        }
        (u, v)
    }

    /// Largest-singular-value estimate of `w_mat`, shape `[1, 1]`.
    pub fn sigma(&self, w_mat: &Tensor, train: bool) -> Tensor {
        let (u, v) = if self.fully_diff {
            self.iterate(w_mat)
        } else {
            tch::no_grad(|| self.iterate(&w_mat.detach()))
        };
        if train {
            tch::no_grad(|| {
                let mut stored = self.u.shallow_clone();
                stored.copy_(&u.detach());
            });
        }
        u.matmul(w_mat).matmul(&v.transpose(0, 1))
    }
}

/// Power-iteration estimator over the convolution operator itself.
///
/// `u` lives in the output feature-map space; one step maps it back through
/// `conv_transpose2d` and forward through `conv2d`.
#[derive(Debug)]
pub struct ConvSpectralNorm {
    u: Tensor,
    iterations: i64,
    fully_diff: bool,
    stride: i64,
    padding: i64,
}

impl ConvSpectralNorm {
    pub fn new(
        path: &nn::Path,
        out_dim: i64,
        ksize: i64,
        stride: i64,
        padding: i64,
        input_hw: (i64, i64),
        opts: &SpectralOptions,
    ) -> Self {
        let out_h = (input_hw.0 + 2 * padding - ksize) / stride + 1;
        let out_w = (input_hw.1 + 2 * padding - ksize) / stride + 1;
        Self {
            u: persistent_randn(path, "u", &[1, out_dim, out_h, out_w]),
            iterations: opts.iterations.max(1),
            fully_diff: opts.fully_diff,
            stride,
            padding,
        }
    }

    fn down(&self, v: &Tensor, w: &Tensor) -> Tensor {
        v.conv2d(
            w,
            None::<Tensor>,
            [self.stride, self.stride],
            [self.padding, self.padding],
            [1, 1],
            1,
        )
    }

    fn iterate(&self, w: &Tensor) -> (Tensor, Tensor) {
        let stride = [self.stride, self.stride];
        let padding = [self.padding, self.padding];
        let mut u = self.u.copy();
        let mut v =
            l2_normalize(&u.conv_transpose2d(w, None::<Tensor>, stride, padding, [0, 0], 1, [1, 1]));
        u = l2_normalize(&self.down(&v, w));
        for _ in 1..self.iterations {
            v = l2_normalize(&u.conv_transpose2d(w, None::<Tensor>, stride, padding, [0, 0], 1, [1, 1]));
            u = l2_normalize(&self.down(&v, w));
        }
        (u, v)
    }

    /// Scalar estimate of the operator's largest singular value.
    pub fn sigma(&self, w: &Tensor, train: bool) -> Tensor {
        let (u, v) = if self.fully_diff {
            self.iterate(w)
        } else {
            tch::no_grad(|| self.iterate(&w.detach()))
        };
        if train {
            tch::no_grad(|| {
                let mut stored = self.u.shallow_clone();
                stored.copy_(&u.detach());
            });
        }
        (self.down(&v, w) * u).sum(Kind::Float)
    }
}

#[derive(Debug)]
enum KernelNorm {
    Matrix(SpectralNorm),
    Operator(ConvSpectralNorm),
}

/// 2-d convolution with a spectral-normalized kernel.
#[derive(Debug)]
pub struct SnConv2d {
    ws: Tensor,
    bs: Tensor,
    stride: i64,
    padding: i64,
    norm: KernelNorm,
}

impl SnConv2d {
    pub fn new(
        path: &nn::Path,
        in_dim: i64,
        out_dim: i64,
        ksize: i64,
        stride: i64,
        padding: i64,
        input_hw: (i64, i64),
        opts: &SpectralOptions,
    ) -> Self {
        let ws = path.var(
            "weight",
            &[out_dim, in_dim, ksize, ksize],
            nn::Init::Randn { mean: 0.0, stdev: 0.02 },
        );
        let bs = path.var("bias", &[out_dim], nn::Init::Const(0.0));
        let norm = if opts.conv_singular {
            KernelNorm::Operator(ConvSpectralNorm::new(
                path, out_dim, ksize, stride, padding, input_hw, opts,
            ))
        } else {
            KernelNorm::Matrix(SpectralNorm::new(path, out_dim, opts))
        };
        Self { ws, bs, stride, padding, norm }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let sigma = match &self.norm {
            KernelNorm::Matrix(sn) => sn.sigma(&self.ws.flatten(1, 3), train),
            KernelNorm::Operator(sn) => sn.sigma(&self.ws, train),
        };
        let w = &self.ws / sigma;
        xs.conv2d(
            &w,
            Some(&self.bs),
            [self.stride, self.stride],
            [self.padding, self.padding],
            [1, 1],
            1,
        )
    }
}

impl nn::ModuleT for SnConv2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        SnConv2d::forward_t(self, xs, train)
    }
}

/// Dense layer with a spectral-normalized weight matrix.
#[derive(Debug)]
pub struct SnLinear {
    ws: Tensor,
    bs: Tensor,
    norm: SpectralNorm,
}

impl SnLinear {
    pub fn new(path: &nn::Path, in_dim: i64, out_dim: i64, opts: &SpectralOptions) -> Self {
        Self {
            ws: path.var(
                "weight",
                &[out_dim, in_dim],
                nn::Init::Randn { mean: 0.0, stdev: 0.02 },
            ),
            bs: path.var("bias", &[out_dim], nn::Init::Const(0.0)),
            norm: SpectralNorm::new(path, out_dim, opts),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let w = &self.ws / self.norm.sigma(&self.ws, train);
        xs.matmul(&w.transpose(0, 1)) + &self.bs
    }
}

impl nn::ModuleT for SnLinear {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        SnLinear::forward_t(self, xs, train)
    }
}

/// Embedding table with a spectral-normalized weight matrix.
#[derive(Debug)]
pub struct SnEmbedding {
    ws: Tensor,
    norm: SpectralNorm,
}

impl SnEmbedding {
    pub fn new(path: &nn::Path, num_embeddings: i64, dim: i64, opts: &SpectralOptions) -> Self {
        Self {
            ws: path.var(
                "weight",
                &[num_embeddings, dim],
                nn::Init::Randn { mean: 0.0, stdev: 0.02 },
            ),
            norm: SpectralNorm::new(path, num_embeddings, opts),
        }
    }

    /// Looks up rows of the normalized table; `cls` is an int64 `[batch]` tensor.
    pub fn forward_t(&self, cls: &Tensor, train: bool) -> Tensor {
        let w = &self.ws / self.norm.sigma(&self.ws, train);
        w.index_select(0, &cls.view([-1]))
    }
}
