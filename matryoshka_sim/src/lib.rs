//! Matryoshka Deterministic Simulation Harness
//!
//! This crate runs many peers inside one process so the discovery and
//! position protocols can be tested end to end.
//!
//! # Core Principle: Controlled Environment
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: tokio's paused clock only advances when every task waits
//! - **Network**: an in-memory hub with per-link latency, loss and partitions
//! - **Randomness**: movement and loss derive from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ current-thread runtime, start_paused(true)           │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼────┐                       │
//! │  │  Peer   │◄────────────►│  Peer   │     ...               │
//! │  │   #0    │    SimHub    │   #1    │                       │
//! │  └─────────┘              └─────────┘                       │
//! │       ▲                        ▲                            │
//! │  ┌────┴────────────────────────┴────┐                       │
//! │  │            Oracle                │                       │
//! │  │  (ground truth avatar movement)  │                       │
//! │  └──────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use matryoshka_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 6).run(ScenarioId::SplitBrain);
//! assert!(result.passed);
//! ```

mod agent;
mod context;
mod network;
mod oracle;
mod runner;
pub mod scenarios;
mod world;

pub use agent::{Recorder, SimulatedPeer};
pub use context::SimContext;
pub use network::{HubStats, SimFace, SimHub, SimNetworkController};
pub use oracle::{Avatar, Oracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimWorld, Visibility};
