//! Matryoshka Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seams that let the Matryoshka sync
//! engines run against a real named-data face in **Production** (tokio) and
//! against an in-memory hub in **Simulation**.
//!
//! # Core Concept: Named Request / Response
//!
//! Peers never address each other directly. They:
//! - express a [`Request`] for a hierarchical [`Name`] and await at most one
//!   [`SignedResponse`] before the request lifetime expires,
//! - register a [`RequestHandler`] under a name prefix to answer requests.
//!
//! Time, sleeping, task spawning and key derivation go through
//! [`SyncContext`] so that a seeded simulation can reproduce any run.
//!
//! # Example
//!
//! ```ignore
//! use matryoshka_env::{FaceTransport, Name, Request, SyncContext};
//!
//! async fn poll<Ctx: SyncContext, T: FaceTransport>(ctx: &Ctx, face: &T) {
//!     loop {
//!         let request = Request::new(Name::parse("/game/players/alice/position")?, lifetime);
//!         if let Ok(Some(response)) = face.express(request).await {
//!             handle(response);
//!         }
//!         ctx.sleep(Duration::from_millis(200)).await;
//!     }
//! }
//! ```

mod context;
mod transport;
mod types;
mod error;
mod tokio_impl;

pub use context::SyncContext;
pub use transport::{FaceTransport, NetworkController, RequestHandler};
pub use types::{Name, NodeId, RegistrationId, Request, SignedResponse};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
