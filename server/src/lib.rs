//! # Block-World Server Library
//!
//! This library implements the authoritative core of a persistent
//! multiplayer block-world server: for every block a connected actor tries
//! to change, it decides whether the change is allowed, and it propagates
//! accepted changes to the shared world state and to other observers under
//! a bounded per-tick budget.
//!
//! ## Core Responsibilities
//!
//! ### Authorization
//! Every placement runs through a layered pipeline: special block-type
//! gates, the zone layer (deny-wins, registration order), then the world's
//! access policy combined with the generic build/delete permissions. The
//! access-control structures are read lock-free on the hot path via
//! atomically swapped snapshots.
//!
//! ### Update Propagation
//! Approved changes are queued without blocking the submitting actor and
//! drained once per tick by the owning world, under a budget derived from
//! configured bandwidth and live observer count. The world's block array
//! has exactly one writer, the tick consumer; everything else only reads.
//!
//! ### Scheduling
//! A dual-lane cooperative scheduler drives the ticks: a foreground loop
//! for short periodic work, and a background loop for long-lived or slow
//! callbacks so they cannot stall time-sensitive tasks.
//!
//! ## Module Organization
//!
//! - [`rank`]: ordered rank definitions, permissions and limits
//! - [`access`]: the reusable min-rank + include/exclude policy primitive
//! - [`zone`]: spatially bounded regions carrying their own policies
//! - [`authorizer`]: the placement decision pipeline
//! - [`world`]: map state, the block-change queue and the tick drain
//! - [`scheduler`]: the dual-lane task runner
//! - [`player`]: connected actors and their registry
//! - [`config`]: server tunables
//! - [`network`]: the UDP session layer exercising all of the above

pub mod access;
pub mod authorizer;
pub mod config;
pub mod network;
pub mod player;
pub mod rank;
pub mod scheduler;
pub mod utils;
pub mod world;
pub mod zone;
