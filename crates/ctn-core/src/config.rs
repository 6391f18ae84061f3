//! Process configuration and the parent/child lock handoff contract.
//!
//! The environment is only read here, once, at process start. Everything
//! downstream receives the values explicitly.

use std::path::PathBuf;
use std::process::Command;

/// Environment variable a parent invocation uses to pass its lock decision
/// to a child invocation on the same device.
pub const LOCK_ENV: &str = "_CLUSTUNE_LOCK";
/// Cluster stack this node runs.
pub const STACK_ENV: &str = "CLUSTUNE_CLUSTER_STACK";
/// Directory holding the per-filesystem cluster lock files.
pub const LOCK_DIR_ENV: &str = "CLUSTUNE_LOCK_DIR";

pub const DEFAULT_CLUSTER_STACK: &str = "o2cb";
pub const DEFAULT_LOCK_DIR: &str = "/run/clustune";

/// Lock state inherited from a parent invocation.
///
/// Serialized as `_CLUSTUNE_LOCK=locked`, `_CLUSTUNE_LOCK=online`, or the
/// variable being unset. Unrecognized values read as [`Handoff::Absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handoff {
    #[default]
    Absent,
    /// The parent holds the cluster lock; do not lock again.
    Locked,
    /// The parent decided the change goes through the live mount.
    Online,
}

impl Handoff {
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("locked") => Self::Locked,
            Some("online") => Self::Online,
            _ => Self::Absent,
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::parse(std::env::var(LOCK_ENV).ok().as_deref())
    }

    #[must_use]
    pub fn as_env_value(self) -> Option<&'static str> {
        match self {
            Self::Absent => None,
            Self::Locked => Some("locked"),
            Self::Online => Some("online"),
        }
    }

    /// Export this marker to a child command, clearing any inherited value
    /// when absent.
    pub fn apply_to(self, command: &mut Command) {
        match self.as_env_value() {
            Some(value) => {
                command.env(LOCK_ENV, value);
            }
            None => {
                command.env_remove(LOCK_ENV);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Prefix for user-facing messages.
    pub progname: String,
    /// Signed verbosity; 1 is the default, each `-v` adds one and each `-q`
    /// subtracts one.
    pub verbosity: i32,
    /// Ask before every change instead of assuming "yes".
    pub interactive: bool,
    /// Cluster stack this node runs.
    pub running_stack: String,
    pub lock_dir: PathBuf,
    /// Marker inherited from the parent process.
    pub handoff: Handoff,
}

impl RuntimeConfig {
    /// Defaults without consulting the environment.
    #[must_use]
    pub fn new(progname: impl Into<String>) -> Self {
        Self {
            progname: progname.into(),
            verbosity: 1,
            interactive: false,
            running_stack: DEFAULT_CLUSTER_STACK.to_owned(),
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            handoff: Handoff::Absent,
        }
    }

    /// Defaults overridden by `CLUSTUNE_CLUSTER_STACK`, `CLUSTUNE_LOCK_DIR`
    /// and `_CLUSTUNE_LOCK`.
    #[must_use]
    pub fn from_env(progname: impl Into<String>) -> Self {
        let mut config = Self::new(progname);
        if let Ok(stack) = std::env::var(STACK_ENV) {
            let stack = stack.trim();
            if !stack.is_empty() {
                stack.clone_into(&mut config.running_stack);
            }
        }
        if let Some(dir) = std::env::var_os(LOCK_DIR_ENV) {
            config.lock_dir = PathBuf::from(dir);
        }
        config.handoff = Handoff::from_env();
        config
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: i32) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    #[must_use]
    pub fn with_handoff(mut self, handoff: Handoff) -> Self {
        self.handoff = handoff;
        self
    }

    #[must_use]
    pub fn with_running_stack(mut self, stack: impl Into<String>) -> Self {
        self.running_stack = stack.into();
        self
    }
}
