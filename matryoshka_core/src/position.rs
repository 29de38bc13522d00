//! Sequenced, pull-based position synchronization
//!
//! Every player publishes its position under a sequence number that wraps
//! at the window size. Pollers ask for `last + 1`; the responder compares
//! the requested number with its current one:
//!
//! - **Ahead**: not produced yet, answer after the next publish (or never)
//! - **Behind**: so stale that history cannot serve it, answer with a reset
//! - **Current**: served from the circular history
//!
//! All arithmetic is modulo the window, so every comparison is wrap-aware.

use std::fmt;
use std::str::FromStr;

use matryoshka_env::Name;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::WireError;

// ============================================================================
// SEQUENCE WINDOW
// ============================================================================

/// Relation of a requested sequence to the responder's current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceClass {
    /// Requested sequence has not been produced yet
    Ahead,
    
    /// Requester lags too far behind to be served from history
    Behind,
    
    /// Servable from history
    Current,
}

/// Wrap-aware comparison parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceWindow {
    /// Sequence numbers live in `0..size`
    pub size: u32,
    
    /// Largest forward distance still treated as "not produced yet"
    pub ahead: u32,
    
    /// Largest backward distance still served from history
    pub behind: u32,
}

impl SequenceWindow {
    pub fn new(size: u32, ahead: u32, behind: u32) -> Self {
        Self { size, ahead, behind }
    }
    
    /// `(to - from) mod size`
    pub fn forward_distance(&self, from: u32, to: u32) -> u32 {
        let (from, to) = (from % self.size, to % self.size);
        (to + self.size - from) % self.size
    }
    
    pub fn next(&self, seq: u32) -> u32 {
        (seq + 1) % self.size
    }
    
    pub fn prev(&self, seq: u32) -> u32 {
        (seq % self.size + self.size - 1) % self.size
    }
    
    /// Exactly one class for every pair.
    pub fn classify(&self, local: u32, received: u32) -> SequenceClass {
        let forward = self.forward_distance(local, received);
        let backward = self.forward_distance(received, local);
        if forward >= 1 && forward <= self.ahead {
            SequenceClass::Ahead
        } else if backward > self.behind {
            SequenceClass::Behind
        } else {
            SequenceClass::Current
        }
    }
    
    pub fn is_ahead(&self, local: u32, received: u32) -> bool {
        self.classify(local, received) == SequenceClass::Ahead
    }
    
    pub fn is_behind(&self, local: u32, received: u32) -> bool {
        self.classify(local, received) == SequenceClass::Behind
    }
    
    /// Whether a response at `received` should replace what the poller holds.
    ///
    /// Always true before the first accept and when the poller sits on the
    /// last value of the window; otherwise `received` must lie in the forward
    /// half of the window.
    pub fn is_newer(&self, local: Option<u32>, received: u32) -> bool {
        match local {
            None => true,
            Some(local) if local == self.size - 1 => true,
            Some(local) => {
                let forward = self.forward_distance(local, received);
                forward >= 1 && forward <= self.size / 2
            }
        }
    }
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self {
            size: 1024,
            ahead: 3,
            behind: 20,
        }
    }
}

// ============================================================================
// HISTORY
// ============================================================================

/// Circular buffer of positions keyed by sequence.
///
/// A slot remembers which sequence wrote it, so a lookup never returns a
/// position from a previous lap of the window.
#[derive(Debug, Clone)]
pub struct PositionHistory {
    slots: Vec<Option<(u32, Vector3<f32>)>>,
}

impl PositionHistory {
    pub fn new(window: u32) -> Self {
        Self {
            slots: vec![None; window.max(1) as usize],
        }
    }
    
    pub fn record(&mut self, seq: u32, position: Vector3<f32>) {
        let len = self.slots.len();
        self.slots[seq as usize % len] = Some((seq, position));
    }
    
    pub fn get(&self, seq: u32) -> Option<Vector3<f32>> {
        match self.slots[seq as usize % self.slots.len()] {
            Some((stored, position)) if stored == seq => Some(position),
            _ => None,
        }
    }
    
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Body of a position response.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionPayload {
    /// `x,y,z`
    Position(Vector3<f32>),
    
    /// `reset:<seq>:<reason>`: poll again starting from `sequence`
    Reset { sequence: u32, reason: String },
}

impl fmt::Display for PositionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position(p) => write!(f, "{},{},{}", p.x, p.y, p.z),
            Self::Reset { sequence, reason } => write!(f, "reset:{}:{}", sequence, reason),
        }
    }
}

impl FromStr for PositionPayload {
    type Err = WireError;
    
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || WireError::MalformedPayload(s.to_string());
        if let Some(rest) = s.strip_prefix("reset:") {
            let (sequence, reason) = rest.split_once(':').unwrap_or((rest, ""));
            return Ok(Self::Reset {
                sequence: sequence.parse().map_err(|_| malformed())?,
                reason: reason.to_string(),
            });
        }
        let coords = s
            .split(',')
            .map(|c| c.trim().parse::<f32>())
            .collect::<Result<Vec<f32>, _>>()
            .map_err(|_| malformed())?;
        match coords.as_slice() {
            [x, y, z] => Ok(Self::Position(Vector3::new(*x, *y, *z))),
            _ => Err(malformed()),
        }
    }
}

impl PositionPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
    
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        std::str::from_utf8(bytes)
            .map_err(|_| WireError::NotUtf8)?
            .parse()
    }
}

// ============================================================================
// REQUEST NAMES
// ============================================================================

/// What a request under `<owner>/players/<id>` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerQuery {
    /// `position` (bootstrap) or `position/<seq>`
    Position(Option<u32>),
    
    /// `info/render`
    RenderInfo,
}

impl PlayerQuery {
    /// Decodes the components following the player prefix.
    pub fn from_name(player_prefix: &Name, name: &Name) -> Result<Self, WireError> {
        let unexpected = || WireError::UnexpectedName(name.to_string());
        let rest = name.strip_prefix(player_prefix).ok_or_else(unexpected)?;
        match rest {
            [kind] if kind == "position" => Ok(Self::Position(None)),
            [kind, seq] if kind == "position" => {
                Ok(Self::Position(Some(seq.parse().map_err(|_| unexpected())?)))
            }
            [info, render] if info == "info" && render == "render" => Ok(Self::RenderInfo),
            _ => Err(unexpected()),
        }
    }
}

/// Sequence carried as the last component of a position response name.
pub fn response_sequence(position_prefix: &Name, name: &Name) -> Result<u32, WireError> {
    match name.strip_prefix(position_prefix) {
        Some([seq]) => seq
            .parse()
            .map_err(|_| WireError::UnexpectedName(name.to_string())),
        _ => Err(WireError::UnexpectedName(name.to_string())),
    }
}

// ============================================================================
// RESPONDER
// ============================================================================

/// What the responder does with a position request.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionReply {
    /// Publish `payload` under `<position>/<sequence>`
    Reply { sequence: u32, payload: PositionPayload },
    
    /// Requested sequence is not produced yet; retry after a publish
    Defer,
    
    /// Nothing to say
    Silent,
}

/// Decides the answer to a position request for the local entity.
pub fn respond(
    window: &SequenceWindow,
    current: Option<u32>,
    history: &PositionHistory,
    requested: Option<u32>,
) -> PositionReply {
    let Some(current) = current else {
        return PositionReply::Silent;
    };
    let reset = |reason: &str| PositionReply::Reply {
        sequence: requested.unwrap_or(current),
        payload: PositionPayload::Reset {
            sequence: current,
            reason: reason.to_string(),
        },
    };
    let Some(requested) = requested else {
        return match history.get(current) {
            Some(position) => PositionReply::Reply {
                sequence: current,
                payload: PositionPayload::Position(position),
            },
            None => PositionReply::Silent,
        };
    };
    match window.classify(current, requested) {
        SequenceClass::Ahead => PositionReply::Defer,
        SequenceClass::Behind => reset("behind"),
        SequenceClass::Current => match history.get(requested) {
            Some(position) => PositionReply::Reply {
                sequence: requested,
                payload: PositionPayload::Position(position),
            },
            // Within the window but never recorded (e.g. after a restart)
            None => reset("missing"),
        },
    }
}
