//! # rolesync-engine
//!
//! Access synchronization engine: keeps each person's membership in a set
//! of external group chats equal to what their role entitles them to.
//!
//! - [`entitlement`] resolves a role to its chats
//! - [`reconciler`] diffs entitlement against the cached membership state
//! - [`operator`] executes admit and evict against a [`ChatApi`]
//! - [`lifecycle`] validates registration, decision, reassignment and
//!   termination
//! - [`engine`] ties them together into per-person passes

pub mod api;
pub mod audit;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod entitlement;
pub mod gate;
pub mod lease;
pub mod lifecycle;
pub mod operator;
pub mod reconciler;
pub mod report;
pub mod retry;
pub mod status;
pub mod testing;

mod error;

pub use api::{classify, AdmitOutcome, ApiError, ChatApi, Presence};
pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use error::{EngineError, LifecycleError, Result};
pub use lifecycle::Registration;
pub use reconciler::Operation;
pub use report::{
    ChatRights, OpReport, PassReport, PassTally, RoleUpdate, SweepReport, TriggerReport,
};
pub use retry::RetryPolicy;
pub use status::{PairStatus, PersonStatus, SyncStatus};
