//! # Chronicle Core
//!
//! Shared building blocks for the Chronicle event store:
//! - Log record and event types
//! - The `EventStore` trait
//! - Error types
//! - Configuration and metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 chronicle-core                  │
//! ├─────────────────────────────────────────────────┤
//! │  • types    - Log records, events, read results │
//! │  • traits   - EventStore API                    │
//! │  • error    - Error handling                    │
//! │  • config   - Node configuration (TOML)         │
//! │  • metrics  - Atomic counters                   │
//! │  • utils    - Hashing, checksums, time          │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, Result, StreamVersion};
pub use traits::{EventStore, ScavengeStatus, StorageStats};
pub use types::{
    AllEventsSlice, CommitRecord, ExpectedVersion, LogPosition, LogRecord, NewEvent, PrepareFlags,
    PrepareRecord, ReadEventResult, ReadStreamResult, RecordType, RecordedEvent, StreamSlice,
    WriteResult, DELETED_STREAM, STREAM_DELETED_EVENT_TYPE,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
