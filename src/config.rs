//! Network configuration.
//!
//! Plain serde records describing the discriminator and generator to build.
//! A config is validated once, consumed by a single build call, and never
//! mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Spatial resampling applied by a residual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Resample {
    Down,
    Same,
    Up,
}

/// Feature normalization applied inside residual blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// No normalization, features pass through unchanged.
    None,
    /// Batch normalization with a single learned affine.
    Batch,
    /// Batch normalization with a per-class learned affine.
    ConditionalBatch,
}

/// Discriminator head variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadType {
    /// Scalar score plus an auxiliary class-logit output.
    #[serde(rename = "AC_GAN")]
    AcGan,
    /// Scalar score = unconditional dense + projection onto a class embedding.
    #[serde(rename = "PROJECTIVE")]
    Projective,
    /// Scalar score only, labels are ignored.
    #[serde(rename = "NONE")]
    Unconditional,
    /// Scalar score = unconditional dense + class-conditional dense.
    #[serde(rename = "CONDITIONAL")]
    Conditional,
}

/// Discriminator build options.
///
/// Defaults describe a four-block spectral-free AC-GAN discriminator over
/// ten classes, the same baseline the original network used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    /// Input image shape as (channels, height, width).
    pub image_shape: (i64, i64, i64),
    /// Output channels of each residual block.
    pub block_sizes: Vec<i64>,
    /// Resampling mode of each residual block; must match `block_sizes` in length.
    pub resamples: Vec<Resample>,
    /// Number of label classes.
    pub number_of_classes: i64,
    /// Output head variant.
    pub head: HeadType,
    /// Feature normalization inside blocks.
    pub normalization: Normalization,
    /// Spectral-normalize convolutions, dense layers and embeddings.
    pub spectral: bool,
    /// Insert a class-conditional 1x1 bottleneck between block convolutions.
    pub conditional_bottleneck: bool,
    /// Insert an unconditional 1x1 bottleneck between block convolutions.
    pub unconditional_bottleneck: bool,
    /// Give blocks a class-conditional 1x1 shortcut path.
    pub conditional_shortcut: bool,
    /// Give blocks an unconditional shortcut path (projection where needed).
    pub unconditional_shortcut: bool,
    /// Keep spectral power iterations on the autodiff tape.
    pub fully_diff_spectral: bool,
    /// Power-iteration steps per forward pass.
    pub spectral_iterations: i64,
    /// Estimate the singular value of the convolution operator itself
    /// instead of the reshaped kernel matrix.
    pub conv_singular: bool,
    /// Global sum pooling instead of global average pooling.
    pub sum_pool: bool,
    /// Per-class singular-value estimates in conditional spectral layers.
    pub renormalize_conditional: bool,
    /// Use depthwise-separable conditional convolutions for spatial convs.
    pub depthwise: bool,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            image_shape: (3, 32, 32),
            block_sizes: vec![128, 128, 128, 128],
            resamples: vec![Resample::Down, Resample::Down, Resample::Same, Resample::Same],
            number_of_classes: 10,
            head: HeadType::AcGan,
            normalization: Normalization::None,
            spectral: false,
            conditional_bottleneck: false,
            unconditional_bottleneck: false,
            conditional_shortcut: false,
            unconditional_shortcut: true,
            fully_diff_spectral: false,
            spectral_iterations: 1,
            conv_singular: true,
            sum_pool: false,
            renormalize_conditional: false,
            depthwise: false,
        }
    }
}

impl DiscriminatorConfig {
    /// Check the invariants that must hold before any parameter is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_common(
            self.conditional_shortcut,
            self.unconditional_shortcut,
            self.block_sizes.len(),
            self.resamples.len(),
        )
    }

    /// Load a configuration from a JSON file.
    pub fn from_json(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save the configuration to a JSON file.
    pub fn save_json(&self, path: &str) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Generator build options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Dimension of the latent input vector.
    pub latent_dim: i64,
    /// Spatial size (height, width) the latent is projected to.
    pub base_size: (i64, i64),
    /// Channels of the synthesized image.
    pub output_channels: i64,
    /// Output channels of each residual block.
    pub block_sizes: Vec<i64>,
    /// Resampling mode of each residual block; must match `block_sizes` in length.
    pub resamples: Vec<Resample>,
    /// Number of label classes.
    pub number_of_classes: i64,
    /// Feature normalization inside blocks and before the output conv.
    pub normalization: Normalization,
    /// Spectral-normalize convolutions and dense layers.
    pub spectral: bool,
    pub conditional_bottleneck: bool,
    pub unconditional_bottleneck: bool,
    pub conditional_shortcut: bool,
    pub unconditional_shortcut: bool,
    pub fully_diff_spectral: bool,
    pub spectral_iterations: i64,
    pub conv_singular: bool,
    pub renormalize_conditional: bool,
    pub depthwise: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            latent_dim: 128,
            base_size: (4, 4),
            output_channels: 3,
            block_sizes: vec![128, 128, 128],
            resamples: vec![Resample::Up, Resample::Up, Resample::Up],
            number_of_classes: 10,
            normalization: Normalization::ConditionalBatch,
            spectral: false,
            conditional_bottleneck: false,
            unconditional_bottleneck: false,
            conditional_shortcut: false,
            unconditional_shortcut: true,
            fully_diff_spectral: false,
            spectral_iterations: 1,
            conv_singular: true,
            renormalize_conditional: false,
            depthwise: false,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_common(
            self.conditional_shortcut,
            self.unconditional_shortcut,
            self.block_sizes.len(),
            self.resamples.len(),
        )
    }

    pub fn from_json(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json(&self, path: &str) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn validate_common(
    conditional_shortcut: bool,
    unconditional_shortcut: bool,
    blocks: usize,
    resamples: usize,
) -> Result<(), ConfigError> {
    if !conditional_shortcut && !unconditional_shortcut {
        return Err(ConfigError::ShortcutsDisabled);
    }
    if blocks != resamples {
        return Err(ConfigError::BlockResampleMismatch { blocks, resamples });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DiscriminatorConfig::default().validate().is_ok());
        assert!(GeneratorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_shortcuts_disabled_rejected() {
        let config = DiscriminatorConfig {
            conditional_shortcut: false,
            unconditional_shortcut: false,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ShortcutsDisabled));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let config = DiscriminatorConfig {
            block_sizes: vec![64, 64, 64],
            resamples: vec![Resample::Down, Resample::Same],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::BlockResampleMismatch { blocks: 3, resamples: 2 })
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let config = DiscriminatorConfig {
            head: HeadType::Projective,
            spectral: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: DiscriminatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.head, HeadType::Projective);
        assert!(loaded.spectral);
        assert_eq!(loaded.block_sizes, config.block_sizes);
    }

    #[test]
    fn test_resample_serde_names() {
        let json = r#"{"resamples": ["DOWN", "SAME", "UP"], "block_sizes": [1, 2, 3]}"#;
        let config: DiscriminatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.resamples,
            vec![Resample::Down, Resample::Same, Resample::Up]
        );
    }

    #[test]
    fn test_head_serde_names() {
        let json = r#"{"head": "PROJECTIVE"}"#;
        let config: DiscriminatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.head, HeadType::Projective);
    }
}
