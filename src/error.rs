//! Error taxonomy for network construction.
//!
//! Only configuration validation can fail here; every tensor-level error
//! (shape or rank mismatches, device errors) is raised by `tch` itself.

use thiserror::Error;

/// Raised by config validation before any parameter is registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at least one of conditional_shortcut / unconditional_shortcut must be enabled")]
    ShortcutsDisabled,

    #[error("block_sizes has {blocks} entries but resamples has {resamples}")]
    BlockResampleMismatch { blocks: usize, resamples: usize },
}
