//! # Conditional GAN network builders
//!
//! This crate assembles conditional GAN discriminator and generator networks
//! from residual blocks on top of `tch` (libtorch). It builds parameterized
//! modules for an external training harness; it performs no training, data
//! loading, or inference loop itself.
//!
//! ## Modules
//!
//! - `config`: build options for both networks, JSON-serializable
//! - `layers`: spectral-normalized and class-conditional layer primitives
//! - `resblock`: the conditional residual block shared by both builders
//! - `discriminator`: residual discriminator with four head variants
//! - `generator`: residual generator
//! - `error`: configuration validation errors

pub mod config;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod layers;
pub mod resblock;

pub use config::{DiscriminatorConfig, GeneratorConfig, HeadType, Normalization, Resample};
pub use discriminator::{Discriminator, DiscriminatorOutput};
pub use error::ConfigError;
pub use generator::Generator;
