//! Spatial error types.

use thiserror::Error;

/// Spatial error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpatialError {
    /// Requested a search ring larger than the precomputed table.
    #[error("search radius {radius} exceeds the maximum of {max}")]
    RadiusOutOfRange { radius: u32, max: u32 },
}

/// Result type for spatial operations.
pub type SpatialResult<T> = Result<T, SpatialError>;
