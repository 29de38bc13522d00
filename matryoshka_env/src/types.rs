//! Common types for the Matryoshka environment abstraction.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EnvError;

/// Unique identifier for a Matryoshka node.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a new random NodeId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
    
    /// Creates a deterministic NodeId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Hierarchical name made of non-empty components.
///
/// Textual form is `/a/b/c`; the empty name prints as `/`. Components may
/// not contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Name {
    components: Vec<String>,
}

impl Name {
    /// The empty (root) name.
    pub fn root() -> Self {
        Self::default()
    }
    
    /// Parses a `/`-separated name, skipping empty segments.
    pub fn parse(text: &str) -> Result<Self, EnvError> {
        let components: Vec<String> = text
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        if components.iter().any(|c| c.chars().any(char::is_whitespace)) {
            return Err(EnvError::InvalidName(text.to_string()));
        }
        Ok(Self { components })
    }
    
    /// Returns a new name with `component` appended.
    ///
    /// Slashes inside `component` split it into several components.
    pub fn child(&self, component: impl AsRef<str>) -> Self {
        let mut next = self.clone();
        next.components.extend(
            component
                .as_ref()
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string),
        );
        next
    }
    
    /// Number of components.
    pub fn len(&self) -> usize {
        self.components.len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
    
    pub fn components(&self) -> &[String] {
        &self.components
    }
    
    /// Last component, if any.
    pub fn last(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }
    
    /// The first `n` components (clamped).
    pub fn prefix(&self, n: usize) -> Self {
        Self {
            components: self.components[..n.min(self.components.len())].to_vec(),
        }
    }
    
    /// True if every component of `self` matches the head of `other`.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.components.len() <= other.components.len()
            && self
                .components
                .iter()
                .zip(other.components.iter())
                .all(|(a, b)| a == b)
    }
    
    /// Components of `self` that follow `prefix`, or `None` if `prefix`
    /// does not match.
    pub fn strip_prefix(&self, prefix: &Name) -> Option<&[String]> {
        if prefix.is_prefix_of(self) {
            Some(&self.components[prefix.components.len()..])
        } else {
            None
        }
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Name {
    type Err = EnvError;
    
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A request for data under a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Requested name
    pub name: Name,
    
    /// How long the requester waits for an answer
    pub lifetime: Duration,
    
    /// Ask forwarders to bypass cached answers
    pub must_be_fresh: bool,
    
    /// Distinguishes otherwise identical requests
    pub nonce: Uuid,
}

impl Request {
    /// Creates a fresh-only request with a random nonce.
    pub fn new(name: Name, lifetime: Duration) -> Self {
        Self {
            name,
            lifetime,
            must_be_fresh: true,
            nonce: Uuid::new_v4(),
        }
    }
}

/// A signed answer to a request.
///
/// The signature covers [`SignedResponse::signable_bytes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedResponse {
    /// Response name (the request name, optionally extended)
    pub name: Name,
    
    /// Opaque payload
    pub content: Vec<u8>,
    
    /// How long the answer may be served from caches
    pub freshness_ms: u64,
    
    /// Signer's wall clock at signing time
    pub timestamp_ms: u64,
    
    /// Detached signature bytes
    pub signature: Vec<u8>,
    
    /// Signer's public key bytes
    pub public_key: Vec<u8>,
}

impl SignedResponse {
    /// Bytes covered by the signature: name, content, freshness and timestamp.
    pub fn signable_bytes(&self) -> Vec<u8> {
        Self::signable(&self.name, &self.content, self.freshness_ms, self.timestamp_ms)
    }
    
    /// Same as [`signable_bytes`](Self::signable_bytes) before the response exists.
    pub fn signable(name: &Name, content: &[u8], freshness_ms: u64, timestamp_ms: u64) -> Vec<u8> {
        let name = name.to_string();
        let mut bytes = Vec::with_capacity(name.len() + content.len() + 17);
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(content);
        bytes.extend_from_slice(&freshness_ms.to_le_bytes());
        bytes.extend_from_slice(&timestamp_ms.to_le_bytes());
        bytes
    }
    
    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// Handle returned by prefix registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(pub u64);

impl std::fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reg#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_name_parse_and_display() {
        let name = Name::parse("/ndn/broadcast/apps/Matryoshka/").unwrap();
        assert_eq!(name.len(), 4);
        assert_eq!(name.to_string(), "/ndn/broadcast/apps/Matryoshka");
        assert_eq!(Name::root().to_string(), "/");
        assert_eq!(Name::parse("//").unwrap(), Name::root());
    }
    
    #[test]
    fn test_name_rejects_whitespace() {
        assert!(Name::parse("/a b/c").is_err());
    }
    
    #[test]
    fn test_name_child_splits_slashes() {
        let base = Name::parse("/alice").unwrap();
        let name = base.child("players/bob").child("position");
        assert_eq!(name.to_string(), "/alice/players/bob/position");
        assert_eq!(name.last(), Some("position"));
    }
    
    #[test]
    fn test_name_prefix_matching() {
        let prefix = Name::parse("/a/b").unwrap();
        let full = Name::parse("/a/b/c/d").unwrap();
        let other = Name::parse("/a/x/c").unwrap();
        
        assert!(prefix.is_prefix_of(&full));
        assert!(!prefix.is_prefix_of(&other));
        assert!(Name::root().is_prefix_of(&other));
        assert!(!full.is_prefix_of(&prefix));
        
        let rest = full.strip_prefix(&prefix).unwrap();
        assert_eq!(rest, &["c".to_string(), "d".to_string()]);
        assert_eq!(full.prefix(2), prefix);
        assert_eq!(full.prefix(10), full);
    }
    
    #[test]
    fn test_signable_bytes_cover_every_field() {
        let name = Name::parse("/a").unwrap();
        let base = SignedResponse::signable(&name, b"x", 10, 20);
        assert_ne!(base, SignedResponse::signable(&name, b"y", 10, 20));
        assert_ne!(base, SignedResponse::signable(&name, b"x", 11, 20));
        assert_ne!(base, SignedResponse::signable(&name, b"x", 10, 21));
        assert_ne!(base, SignedResponse::signable(&Name::parse("/b").unwrap(), b"x", 10, 20));
    }
    
    #[test]
    fn test_node_id_from_seed_is_stable() {
        assert_eq!(NodeId::from_seed(7), NodeId::from_seed(7));
        assert_ne!(NodeId::from_seed(7), NodeId::from_seed(8));
    }
}
