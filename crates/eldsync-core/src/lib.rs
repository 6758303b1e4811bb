//! # eldsync-core
//!
//! Core synchronization engine for eldsync, a companion service for
//! Bluetooth ELD (electronic logging device) hardware.
//!
//! This crate provides:
//! - The connection lifecycle state machine and its async driver
//! - Chunked, retried history fetching with progressive escalation
//! - Deduplication and ordering of telemetry into a single timeline
//! - Timestamp normalization for the device's wire formats
//!
//! ## Architecture
//!
//! - [`link`] - Device link capability, plus simulated, mock and BlueZ drivers
//! - [`connection`] - Connection state machine and manager
//! - [`history`] - Time-window chunking, retry and cancellation of history queries
//! - [`escalation`] - Progressive widening of the history window
//! - [`timeline`] - Single-writer merged telemetry timeline
//! - [`orchestrator`] - Wires everything together for one device session
//! - [`record`], [`timestamp`], [`dedup`] - Telemetry records and their normalization
//! - [`packet`] - Wire frames
//! - [`progress`] - Sync progress notifications
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod escalation;
pub mod history;
pub mod link;
pub mod orchestrator;
pub mod packet;
pub mod progress;
pub mod record;
pub mod timeline;
pub mod timestamp;

// Re-export primary types for convenience
pub use config::{
    is_valid_imei, is_valid_mac_address, Config, ConfigError, ConfigResult, ConnectionConfig,
    DeviceConfig, EscalationConfig, HistoryConfig, ServerConfig, StageConfig, TimelineConfig,
};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionSession, ConnectionSnapshot, ConnectionState,
    ConnectionStateMachine, FailureReason, Phase,
};
pub use dedup::{dedup_and_sort, DedupOutcome};
pub use error::{Result, SyncError};
pub use escalation::{has_valid_data, EscalationController, EscalationOutcome, StageReport};
pub use history::{
    plan_chunks, ChunkStatus, FetchReport, FetchRequest, HistoryChunk, HistoryFetcher, RetryPolicy,
};
#[cfg(feature = "bluetooth")]
pub use link::bluez::BluezLink;
#[cfg(any(test, feature = "mock-link"))]
pub use link::mock::MockLink;
pub use link::sim::{SimulatedLink, SimulatorSettings};
pub use link::{
    DeviceLink, DiscoveredDevice, HistoryKind, LinkError, LinkEvent, LinkStatus, SharedLink,
};
pub use orchestrator::SyncOrchestrator;
pub use progress::{ProgressReporter, ProgressStatus, SyncProgress};
pub use record::{DutyStatus, RecordKey, TelemetryRecord};
pub use timeline::{SyncTimeline, TimelineSnapshot};
pub use timestamp::{format_wire, parse_timestamp, parse_wire, ResolvedTimestamp, TimeSource};
