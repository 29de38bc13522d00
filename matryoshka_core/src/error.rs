//! Error types shared across the sync engines.

use matryoshka_env::EnvError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::trust::TrustError;

/// Geometry and octree errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpaceError {
    /// Coordinate is negative, NaN, or past the world extent
    #[error("position ({x}, {y}, {z}) is outside the world")]
    OutOfWorld { x: f32, y: f32, z: f32 },
    
    /// Region path is longer than the octree depth
    #[error("region path depth {depth} exceeds octree depth {max}")]
    TooDeep { depth: usize, max: usize },
    
    /// Path component outside 0..=7 or not a number
    #[error("invalid region path: {0}")]
    InvalidPath(String),
    
    /// Geometry parameters that cannot describe a world
    #[error("invalid geometry: depth {depth}, world bits {world_bits}")]
    InvalidGeometry { depth: usize, world_bits: u32 },
}

/// Errors decoding anything that arrived over the wire.
///
/// Every parser in the crate validates its whole input before the caller
/// mutates state, so a `WireError` always means "nothing was applied".
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WireError {
    #[error("base64 decode failed: {0}")]
    Base64(String),
    
    #[error("unknown digest frame discriminator 0x{0:02x}")]
    UnknownDiscriminator(u8),
    
    #[error("truncated frame: {0}")]
    Truncated(&'static str),
    
    #[error("non-zero byte in frame padding")]
    BadPadding,
    
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    
    #[error("malformed response line: {0:?}")]
    MalformedLine(String),
    
    #[error("malformed position payload: {0:?}")]
    MalformedPayload(String),
    
    #[error("invalid entity name: {0:?}")]
    InvalidEntityName(String),
    
    #[error("unexpected request name: {0}")]
    UnexpectedName(String),
    
    #[error(transparent)]
    Space(#[from] SpaceError),
}

/// Top-level error for instance operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Space(#[from] SpaceError),
    
    #[error(transparent)]
    Wire(#[from] WireError),
    
    #[error(transparent)]
    Env(#[from] EnvError),
    
    #[error(transparent)]
    Trust(#[from] TrustError),
    
    #[error(transparent)]
    Config(#[from] ConfigError),
    
    /// The instance loops are already running
    #[error("instance already started")]
    AlreadyStarted,
}
