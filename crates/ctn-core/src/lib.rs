#![deny(unsafe_code)]
//! Shared runtime for clustune maintenance operations.
//!
//! An operation never touches a device directly. It asks the [`Runtime`] for
//! a session, and the runtime decides, before anything is written, whether
//! the change may proceed offline, must be delegated to a live mount, or
//! must be refused:
//!
//! 1. [`session`] opens images and fences interrupted changes.
//! 2. [`lock`] negotiates the local or cluster lock and the handoff to
//!    child invocations.
//! 3. [`validate`] refuses dirty journals and inconsistent allocators.
//! 4. [`operation`] runs an operation body between two opens and closes
//!    both whatever happens.
//!
//! The only unsafe code is the live-mount control call in [`host`].

pub mod cluster;
pub mod config;
pub mod console;
pub mod host;
pub mod lease;
pub mod lock;
pub mod number;
pub mod online;
pub mod operation;
pub mod registry;
pub mod session;
pub mod signals;
pub mod validate;

pub use cluster::{ClusterStack, DlmContext, HostClusterStack};
pub use config::{Handoff, RuntimeConfig};
pub use console::{Console, init_tracing};
pub use host::{DeviceAccess, ExclusiveClaim, HostDevices, MountStatus, OnlineChannel};
pub use lease::DeviceKey;
pub use lock::{LockCoordinator, LockDecision};
pub use number::parse_number;
pub use operation::{
    Feature, FeatureAction, FeatureOutcome, OpContext, Operation, SingleFeature, run_operation,
};
pub use registry::SessionId;
pub use session::{InProgress, OpenOutcome, Opened, Runtime, Session};
pub use signals::{install_termination_handler, with_signals_blocked};
pub use validate::{JournalSummary, global_bitmap_check, journal_check};
