//! Matryoshka Core - peer-to-peer game state synchronization over named data
//!
//! Every peer publishes its own avatar and discovers the others without a
//! server. Two protocols keep peers in step:
//! 1. **Discovery**: digest anti-entropy over an octree of world regions.
//!    Peers broadcast the digest of the names they know in a region and
//!    anyone holding a different set answers with the difference.
//! 2. **Position**: each peer polls every known remote entity for the
//!    next sequence of its position, with bounded history, resets and
//!    timeout based drop.

pub mod callbacks;
pub mod config;
pub mod discovery;
pub mod entity;
pub mod error;
pub mod instance;
pub mod name_set;
pub mod position;
pub mod space;
pub mod state;
pub mod trust;

// Re-export key types for convenience
pub use callbacks::{Callbacks, InfoSink, LocationSink, LogLevel, LogRecord, LogSink, NoopCallbacks};
pub use config::{ConfigError, InstanceConfig};
pub use discovery::{DigestFrame, DiscoveryQuery, DiscoverySync, RegionListing};
pub use entity::{EntityLocation, EntityName, LocalEntity, RemoteEntity};
pub use error::{SpaceError, SyncError, WireError};
pub use instance::PeerInstance;
pub use name_set::{digest_names, NameSet};
pub use position::{PositionHistory, PositionPayload, SequenceClass, SequenceWindow};
pub use space::{Octree, Region, RegionPath, WorldGeometry};
pub use state::PeerState;
pub use trust::{Ed25519Signer, ResponseSigner, TrustError};
