//! Entities known to a peer: its own avatar and the remote players it tracks.

use std::fmt;
use std::str::FromStr;

use matryoshka_env::Name;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::position::PositionHistory;
use crate::space::RegionPath;

/// Globally unique player name: the owner's hub prefix plus a local id.
///
/// Textual form is `owner:id`, e.g. `/ndn/edu/ucla/remap/apps/Matryoshka:alice`.
/// Neither part may be empty or contain `:` or whitespace, and `id` may not
/// contain `/` since it becomes a single name component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityName {
    owner: String,
    id: String,
}

impl EntityName {
    pub fn new(owner: impl Into<String>, id: impl Into<String>) -> Result<Self, WireError> {
        let owner = owner.into();
        let id = id.into();
        let bad = |s: &str| s.is_empty() || s.contains(':') || s.chars().any(char::is_whitespace);
        if bad(&owner) || bad(&id) || id.contains('/') {
            return Err(WireError::InvalidEntityName(format!("{}:{}", owner, id)));
        }
        Ok(Self { owner, id })
    }
    
    pub fn owner(&self) -> &str {
        &self.owner
    }
    
    pub fn id(&self) -> &str {
        &self.id
    }
    
    /// `<owner>/players/<id>`: the prefix under which this player answers.
    pub fn player_prefix(&self) -> Name {
        // Owner was validated free of whitespace, so parsing cannot fail
        Name::parse(&self.owner)
            .unwrap_or_default()
            .child("players")
            .child(&self.id)
    }
    
    /// `<owner>/players/<id>/position`
    pub fn position_prefix(&self) -> Name {
        self.player_prefix().child("position")
    }
    
    /// `<owner>/players/<id>/info/render`
    pub fn render_info_name(&self) -> Name {
        self.player_prefix().child("info").child("render")
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.id)
    }
}

impl FromStr for EntityName {
    type Err = WireError;
    
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, id) = s
            .split_once(':')
            .ok_or_else(|| WireError::InvalidEntityName(s.to_string()))?;
        Self::new(owner, id)
    }
}

/// Where a remote entity is, as far as this peer knows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityLocation {
    /// Discovered, no position accepted yet
    New,
    
    /// Last accepted position
    Known(Vector3<f32>),
    
    /// Declared gone after too many consecutive timeouts
    Dropped,
}

impl EntityLocation {
    pub fn position(&self) -> Option<Vector3<f32>> {
        match self {
            Self::Known(p) => Some(*p),
            _ => None,
        }
    }
}

/// A peer other than self, tracked through the position protocol.
#[derive(Debug, Clone)]
pub struct RemoteEntity {
    pub name: EntityName,
    
    pub location: EntityLocation,
    
    /// Last accepted sequence; `None` makes the next poll a bootstrap request
    pub sequence: Option<u32>,
    
    /// Consecutive polls that got no answer
    pub timeout_count: u32,
    
    /// Accepted positions indexed by sequence
    pub history: PositionHistory,
    
    /// Leaf whose NameSet holds this entity, if any
    pub region: Option<RegionPath>,
    
    /// A poll for this entity is outstanding
    pub in_flight: bool,
    
    /// Render info has been requested once
    pub info_requested: bool,
}

impl RemoteEntity {
    /// Creates a freshly discovered entity sitting in `region`.
    pub fn discovered(name: EntityName, region: RegionPath, window: u32) -> Self {
        Self {
            name,
            location: EntityLocation::New,
            sequence: None,
            timeout_count: 0,
            history: PositionHistory::new(window),
            region: Some(region),
            in_flight: false,
            info_requested: false,
        }
    }
}

/// The instance's own avatar.
#[derive(Debug, Clone)]
pub struct LocalEntity {
    pub name: EntityName,
    
    pub position: Vector3<f32>,
    
    /// Current published sequence, `None` before the first publish
    pub sequence: Option<u32>,
    
    pub history: PositionHistory,
    
    /// Leaf that currently lists this entity
    pub region: RegionPath,
    
    /// Opaque render descriptor served on `info/render`
    pub render_tag: String,
}

impl LocalEntity {
    pub fn new(
        name: EntityName,
        position: Vector3<f32>,
        region: RegionPath,
        window: u32,
        render_tag: impl Into<String>,
    ) -> Self {
        Self {
            name,
            position,
            sequence: None,
            history: PositionHistory::new(window),
            region,
            render_tag: render_tag.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_entity_name_roundtrip() {
        let name: EntityName = "/ndn/edu/ucla/remap/apps/Matryoshka:alice".parse().unwrap();
        assert_eq!(name.owner(), "/ndn/edu/ucla/remap/apps/Matryoshka");
        assert_eq!(name.id(), "alice");
        assert_eq!(name.to_string(), "/ndn/edu/ucla/remap/apps/Matryoshka:alice");
    }
    
    #[test]
    fn test_entity_name_rejects_bad_input() {
        assert!("noseparator".parse::<EntityName>().is_err());
        assert!(":alice".parse::<EntityName>().is_err());
        assert!("/hub:".parse::<EntityName>().is_err());
        assert!("/hub:a:b".parse::<EntityName>().is_err());
        assert!("/hub:a b".parse::<EntityName>().is_err());
        assert!(EntityName::new("/hub", "a/b").is_err());
    }
    
    #[test]
    fn test_player_names() {
        let name = EntityName::new("/game/hub", "bob").unwrap();
        assert_eq!(name.position_prefix().to_string(), "/game/hub/players/bob/position");
        assert_eq!(name.render_info_name().to_string(), "/game/hub/players/bob/info/render");
    }
    
    #[test]
    fn test_location_position() {
        assert_eq!(EntityLocation::New.position(), None);
        assert_eq!(EntityLocation::Dropped.position(), None);
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_eq!(EntityLocation::Known(p).position(), Some(p));
    }
}
