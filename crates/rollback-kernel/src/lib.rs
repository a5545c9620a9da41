//! Rollback reconciliation kernel
//!
//! Runs rollback attempts end to end on top of `rollback-core`:
//! - **Controller**: dispatcher plus one worker task per attempt
//! - **State machine**: pure transition table and its guards
//! - **Event bus**: ordered, sequenced fan-out of every event
//! - **State store**: durable attempt snapshots (file or memory)
//! - **Recovery**: rebuilds in-flight attempts on startup
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use rollback_kernel::prelude::*;
//!
//! let store = Arc::new(FileStateStore::open("/var/lib/rollback")?);
//! let engine = Engine::start(config, collaborators, store, Arc::new(SystemClock)).await?;
//! let mut audit = engine.subscribe();
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod bus;
pub mod controller;
pub mod logging;
pub mod monitor;
pub mod recovery;
pub mod state_machine;
pub mod store;

// Re-exports for convenience
pub use bus::EventBus;
pub use controller::{Engine, EngineContext};
pub use monitor::AppMonitor;
pub use recovery::{RecoveryDecision, RecoveryEntry, RecoveryPlan};
pub use state_machine::{allowed_transitions, transition, validate_transition, Guards, Transition, TransitionError};
pub use store::{FileStateStore, MemoryStateStore, RetentionPolicy, StateStore};

/// Common imports
pub mod prelude {
    //! Common imports for embedding the engine
    pub use crate::{Engine, EventBus, FileStateStore, MemoryStateStore, RecoveryPlan, StateStore};
    pub use rollback_core::prelude::*;
    pub use std::sync::Arc;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
