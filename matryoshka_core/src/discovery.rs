//! Digest-based discovery (anti-entropy) over tracked regions
//!
//! A peer asks "does region R still hash to D?" by expressing a request
//! whose last name component carries a digest frame. Any peer tracking R
//! with a different digest answers with its membership for R; peers that
//! agree stay silent.
//!
//! # Frame layout
//!
//! ```text
//! Whole:  [0x31][digest LE x4][0x00]
//! Part:   [0x30] { [len >= 1][len child indices][digest LE x4] }* [0x00 ...]
//! ```
//!
//! A Part frame names several regions relative to the request's region
//! (typically siblings under one parent). A zero length byte ends the entry
//! list; the frame is zero padded until its bit length is a multiple of 6
//! so the base64 text carries no `=` padding. The frame travels as base64
//! with `/` replaced by `_`.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use matryoshka_env::{Name, Request};

use crate::entity::EntityName;
use crate::error::WireError;
use crate::space::{Octree, RegionPath};

/// Discriminator for a single-region frame.
pub const WHOLE: u8 = 0x31;

/// Discriminator for a multi-region frame.
pub const PART: u8 = 0x30;

/// Frame padding byte.
pub const PADDING: u8 = 0x00;

// ============================================================================
// DIGEST FRAMES
// ============================================================================

/// Claimed digest(s) carried by a discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestFrame {
    /// Digest of the request region itself
    Whole(u32),
    
    /// Digests of regions below the request region, by relative path
    Part(Vec<(RegionPath, u32)>),
}

impl DigestFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Whole(digest) => {
                let mut bytes = vec![WHOLE];
                bytes.extend_from_slice(&digest.to_le_bytes());
                bytes.push(PADDING);
                bytes
            }
            Self::Part(entries) => {
                let mut bytes = vec![PART];
                for (relative, digest) in entries {
                    // Relative paths are at most an octree depth long
                    bytes.push(relative.depth() as u8);
                    bytes.extend_from_slice(relative.digits());
                    bytes.extend_from_slice(&digest.to_le_bytes());
                }
                while bytes.len() % 3 != 0 {
                    bytes.push(PADDING);
                }
                bytes
            }
        }
    }
    
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (&kind, rest) = bytes.split_first().ok_or(WireError::Truncated("empty frame"))?;
        match kind {
            WHOLE => {
                if rest.len() < 4 {
                    return Err(WireError::Truncated("whole digest"));
                }
                let (digest, padding) = rest.split_at(4);
                if padding.iter().any(|&b| b != PADDING) {
                    return Err(WireError::BadPadding);
                }
                Ok(Self::Whole(read_digest(digest)))
            }
            PART => {
                let mut entries = Vec::new();
                let mut cursor = rest;
                while let Some((&len, tail)) = cursor.split_first() {
                    if len == 0 {
                        if tail.iter().any(|&b| b != PADDING) {
                            return Err(WireError::BadPadding);
                        }
                        break;
                    }
                    let len = len as usize;
                    if tail.len() < len + 4 {
                        return Err(WireError::Truncated("part entry"));
                    }
                    let relative = RegionPath::new(tail[..len].to_vec())?;
                    entries.push((relative, read_digest(&tail[len..len + 4])));
                    cursor = &tail[len + 4..];
                }
                Ok(Self::Part(entries))
            }
            other => Err(WireError::UnknownDiscriminator(other)),
        }
    }
    
    /// Base64 text with `/` made name-safe.
    pub fn to_component(&self) -> String {
        STANDARD.encode(self.encode()).replace('/', "_")
    }
    
    pub fn from_component(component: &str) -> Result<Self, WireError> {
        let bytes = STANDARD
            .decode(component.replace('_', "/"))
            .map_err(|e| WireError::Base64(e.to_string()))?;
        Self::decode(&bytes)
    }
}

fn read_digest(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// ============================================================================
// REQUESTS
// ============================================================================

/// A decoded discovery request: a region and what the requester holds for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryQuery {
    pub region: RegionPath,
    pub frame: DigestFrame,
}

impl DiscoveryQuery {
    /// `<broadcast_prefix>/<digit>/.../<frame>`
    pub fn to_name(&self, broadcast_prefix: &Name) -> Name {
        let mut name = broadcast_prefix.clone();
        for d in self.region.digits() {
            name = name.child(d.to_string());
        }
        name.child(self.frame.to_component())
    }
    
    pub fn from_name(broadcast_prefix: &Name, name: &Name) -> Result<Self, WireError> {
        let rest = name
            .strip_prefix(broadcast_prefix)
            .ok_or_else(|| WireError::UnexpectedName(name.to_string()))?;
        let (frame, digits) = rest
            .split_last()
            .ok_or_else(|| WireError::UnexpectedName(name.to_string()))?;
        let region: RegionPath = digits.join("/").parse()?;
        Ok(Self {
            region,
            frame: DigestFrame::from_component(frame)?,
        })
    }
    
    /// Absolute region paths with the digest claimed for each.
    pub fn claims(&self) -> Vec<(RegionPath, u32)> {
        match &self.frame {
            DigestFrame::Whole(digest) => vec![(self.region.clone(), *digest)],
            DigestFrame::Part(entries) => entries
                .iter()
                .filter_map(|(relative, digest)| {
                    let mut digits = self.region.digits().to_vec();
                    digits.extend_from_slice(relative.digits());
                    RegionPath::new(digits).ok().map(|p| (p, *digest))
                })
                .collect(),
        }
    }
}

// ============================================================================
// RESPONSE BODIES
// ============================================================================

/// One line of a discovery answer: a region and its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionListing {
    pub region: RegionPath,
    pub names: Vec<EntityName>,
}

/// `"<owner:id> "* <path>\n"` per listing.
pub fn encode_body(listings: &[RegionListing]) -> Vec<u8> {
    let mut body = String::new();
    for listing in listings {
        for name in &listing.names {
            body.push_str(&name.to_string());
            body.push(' ');
        }
        body.push_str(&listing.region.to_string());
        body.push('\n');
    }
    body.into_bytes()
}

/// Parses a whole body; any malformed line rejects all of it.
pub fn decode_body(bytes: &[u8]) -> Result<Vec<RegionListing>, WireError> {
    let text = std::str::from_utf8(bytes).map_err(|_| WireError::NotUtf8)?;
    let mut listings = Vec::new();
    for line in text.split('\n').filter(|l| !l.is_empty()) {
        let (names, path) = match line.rsplit_once(' ') {
            Some((names, path)) => (names, path),
            None => ("", line),
        };
        let region: RegionPath = path
            .parse()
            .map_err(|_| WireError::MalformedLine(line.to_string()))?;
        let names = names
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<Vec<EntityName>, _>>()
            .map_err(|_| WireError::MalformedLine(line.to_string()))?;
        listings.push(RegionListing { region, names });
    }
    Ok(listings)
}

// ============================================================================
// PROTOCOL
// ============================================================================

/// Stateless discovery logic over an octree.
#[derive(Debug, Clone)]
pub struct DiscoverySync {
    /// Prefix all discovery requests live under
    pub broadcast_prefix: Name,
    
    /// How long a discovery request waits for an answer
    pub request_lifetime: Duration,
}

impl DiscoverySync {
    pub fn new(broadcast_prefix: Name, request_lifetime: Duration) -> Self {
        Self {
            broadcast_prefix,
            request_lifetime,
        }
    }
    
    /// Whole-frame request for one region. A region this peer has no node
    /// for is claimed with digest 0.
    pub fn build_request(&self, octree: &Octree, region: &RegionPath) -> Request {
        let digest = octree.digest(region).unwrap_or(0);
        let query = DiscoveryQuery {
            region: region.clone(),
            frame: DigestFrame::Whole(digest),
        };
        Request::new(query.to_name(&self.broadcast_prefix), self.request_lifetime)
    }
    
    /// Part-frame request covering `children` of `parent` in one round trip.
    pub fn build_batch_request(&self, octree: &Octree, parent: &RegionPath, children: &[u8]) -> Request {
        let entries = children
            .iter()
            .filter_map(|&index| {
                let child = parent.child(index).ok()?;
                let relative = RegionPath::new(vec![index]).ok()?;
                Some((relative, octree.digest(&child).unwrap_or(0)))
            })
            .collect();
        let query = DiscoveryQuery {
            region: parent.clone(),
            frame: DigestFrame::Part(entries),
        };
        Request::new(query.to_name(&self.broadcast_prefix), self.request_lifetime)
    }
    
    /// Listings for every claimed region that is tracked here and hashes
    /// differently. Empty means "nothing to say".
    pub fn answer(&self, octree: &Octree, query: &DiscoveryQuery) -> Vec<RegionListing> {
        query
            .claims()
            .into_iter()
            .filter(|(region, claimed)| {
                octree.is_tracked(region) && octree.digest(region).unwrap_or(0) != *claimed
            })
            .filter_map(|(region, _)| {
                let names = octree.aggregate_names(&region)?;
                Some(RegionListing {
                    region,
                    names: names.iter().cloned().collect(),
                })
            })
            .collect()
    }
    
    /// Names from `listings` that land in regions tracked here and are not
    /// yet known there. `self_name` is never reported.
    pub fn unknown_names(
        &self,
        octree: &Octree,
        listings: &[RegionListing],
        self_name: &EntityName,
    ) -> Vec<(RegionPath, EntityName)> {
        let mut found = Vec::new();
        for listing in listings {
            if !octree.is_tracked(&listing.region) || !octree.is_leaf_path(&listing.region) {
                continue;
            }
            for name in &listing.names {
                if name != self_name
                    && !octree.contains_name(&listing.region, name)
                    && !found.iter().any(|(_, n)| n == name)
                {
                    found.push((listing.region.clone(), name.clone()));
                }
            }
        }
        found
    }
}
