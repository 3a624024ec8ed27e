//! # MazeWar Game Server
//!
//! The authoritative server for a real-time, multi-player maze combat game.
//! Remote clients connect over TCP, log in with a single-character avatar,
//! navigate a shared maze, fire lasers at each other, chat, and receive
//! incrementally updated first-person views of their surroundings.
//!
//! ## Architecture
//!
//! One tokio task services each accepted connection, driving the framed
//! wire protocol from the `shared` crate. All game state is shared and
//! guarded:
//!
//! - the maze grid behind a single mutex ([`maze`]);
//! - the avatar-indexed player table and per-player records behind their
//!   own locks ([`player`]);
//! - the registry of live connections, which coordinates graceful
//!   shutdown by draining to empty ([`registry`]).
//!
//! Laser hits cross task boundaries out of band: the shooter tags the
//! victim's atomic flag and wakes its service task, which observes the hit
//! at its next poll point ([`service`]). The lifecycle (accept loop,
//! shutdown signal, drain, teardown) lives in [`server`].

pub mod maze;
pub mod player;
pub mod registry;
pub mod server;
pub mod service;
