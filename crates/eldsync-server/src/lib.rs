//! # eldsync-server
//!
//! HTTP server library for eldsync.
//!
//! This library provides the API handlers and state management that expose a
//! running [`eldsync_core::SyncOrchestrator`] to local collaborators.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
