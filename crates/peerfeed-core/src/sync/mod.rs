//! Active synchronization
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncScheduler (background task)                                │
//! │  └── every interval: Syncer::sync_pass                          │
//! │                                                                 │
//! │  Syncer (one peer at a time)                                    │
//! │  ├── fetch_feed: request, verify each post, persist             │
//! │  │   └── spawns a detached fetch_profile                        │
//! │  └── fetch_profile: read one profile, merge into the store      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A pass only contacts known peers the transport reports as connected and
//! always re-requests their full history.

mod events;
mod scheduler;
mod syncer;

pub use events::{NodeEvent, SyncReport, EVENT_CHANNEL_CAPACITY};
pub use scheduler::{SyncScheduler, DEFAULT_SYNC_INTERVAL};
pub use syncer::{Syncer, DEFAULT_READ_TIMEOUT};
