//! The two-phase operation runner and the feature plug-in contract.
//!
//! Every operation opens its device twice. The first open ("master") uses
//! the operation's declared flags and learns the mode: offline, online, or
//! stack mismatch. The second open reproduces that mode explicitly, so the
//! operation body only sees a working session plus the flags describing how
//! it must apply its change.

use crate::console::Console;
use crate::registry::SessionId;
use crate::session::{InProgress, OpenOutcome, Runtime};
use ctn_error::{CtnError, Result};
use ctn_ondisk::FsImage;
use ctn_types::{Cx, IncompatFeatures, OpenFlags};
use std::fmt;
use tracing::{debug, info, warn};

/// What an operation body is handed: its session and the mode it runs in.
pub struct OpContext<'a> {
    runtime: &'a mut Runtime,
    session: SessionId,
    flags: OpenFlags,
}

impl fmt::Debug for OpContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpContext")
            .field("session", &self.session)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl<'a> OpContext<'a> {
    pub fn new(runtime: &'a mut Runtime, session: SessionId, flags: OpenFlags) -> Self {
        Self {
            runtime,
            session,
            flags,
        }
    }

    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Flags the working session was opened with.
    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// The change must go through the live mount.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.flags.contains(OpenFlags::ONLINE)
    }

    #[must_use]
    pub fn cx(&self) -> &Cx {
        self.runtime.cx()
    }

    pub fn image(&self) -> Result<&FsImage> {
        self.runtime.image(self.session)
    }

    pub fn image_mut(&mut self) -> Result<&mut FsImage> {
        self.runtime.image_mut(self.session)
    }

    pub fn has_feature(&self, bit: IncompatFeatures) -> Result<bool> {
        Ok(self.image()?.superblock().has_incompat(bit))
    }

    pub fn console_mut(&mut self) -> &mut Console {
        self.runtime.console_mut()
    }

    pub fn write_super(&mut self) -> Result<()> {
        self.runtime.write_super(self.session)
    }

    pub fn set_in_progress(&mut self, what: InProgress) -> Result<()> {
        self.runtime.set_in_progress(self.session, what)
    }

    pub fn clear_in_progress(&mut self, what: InProgress) -> Result<()> {
        self.runtime.clear_in_progress(self.session, what)
    }

    pub fn online_control(&self, request: u64, arg: &mut [u8]) -> Result<()> {
        self.runtime.online_control(self.session, request, arg)
    }

    pub fn runtime(&mut self) -> &mut Runtime {
        self.runtime
    }
}

pub trait Operation {
    fn name(&self) -> &str;

    /// Flags for the master open. The working open strips `ONLINE` and
    /// `NOCLUSTER` and adds back whichever mode the master settled on.
    fn open_flags(&self) -> OpenFlags;

    /// Argument synopsis shown after the device in usage text.
    fn usage_args(&self) -> &str {
        ""
    }

    /// Take the operation's argument. Failures are usage errors.
    fn parse_arg(&mut self, arg: Option<&str>) -> Result<()>;

    fn run(&mut self, ctx: &mut OpContext<'_>) -> Result<()>;
}

/// Flags for the working open given the master's outcome.
#[must_use]
pub fn working_flags(declared: OpenFlags, master: OpenOutcome) -> OpenFlags {
    declared
        .without(OpenFlags::ONLINE)
        .without(OpenFlags::NOCLUSTER)
        .with(master.mode_flag())
}

/// Run `op` against `device` using the two-phase open.
///
/// Both sessions are closed whatever happens. The operation's own error
/// wins over close errors; among close errors the working session's wins.
pub fn run_operation(runtime: &mut Runtime, op: &mut dyn Operation, device: &str) -> Result<()> {
    let declared = op.open_flags();
    let master = runtime.open(device, declared)?;
    let flags = working_flags(declared, master.outcome);
    debug!(op = op.name(), device, master = ?master.outcome, %flags, "master session open");

    let working = match runtime.open(device, flags) {
        Ok(working) => working,
        Err(err) => {
            if let Err(close_err) = runtime.close(master.id) {
                warn!(device, error = %close_err, "closing master session");
            }
            return Err(err);
        }
    };

    let result = {
        let mut ctx = OpContext::new(runtime, working.id, flags);
        op.run(&mut ctx)
    };
    if let Err(err) = &result {
        debug!(op = op.name(), device, error = %err, "operation failed");
    }

    let close_working = runtime.close(working.id);
    let close_master = runtime.close(master.id);
    result.and(close_working).and(close_master)
}

// ── Single-feature operations ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureAction {
    Enable,
    Disable,
}

impl FeatureAction {
    pub fn parse(arg: Option<&str>) -> Result<Self> {
        match arg {
            Some("enable") => Ok(Self::Enable),
            Some("disable") => Ok(Self::Disable),
            Some(other) => Err(CtnError::Usage(format!("Unknown action: \"{other}\""))),
            None => Err(CtnError::Usage("No action specified".to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureOutcome {
    Changed,
    /// The feature was already in the requested state.
    NothingToDo,
    /// The user declined the confirmation prompt.
    Declined,
}

/// One incompat feature that can be switched on or off.
pub trait Feature {
    fn name(&self) -> &str;

    fn incompat_bit(&self) -> IncompatFeatures;

    fn open_flags(&self) -> OpenFlags;

    fn enable(&mut self, ctx: &mut OpContext<'_>) -> Result<FeatureOutcome>;

    fn disable(&mut self, ctx: &mut OpContext<'_>) -> Result<FeatureOutcome>;
}

/// Adapts a [`Feature`] to [`Operation`]: the argument picks the direction.
#[derive(Debug)]
pub struct SingleFeature<F> {
    feature: F,
    action: Option<FeatureAction>,
    outcome: Option<FeatureOutcome>,
}

impl<F: Feature> SingleFeature<F> {
    pub fn new(feature: F) -> Self {
        Self {
            feature,
            action: None,
            outcome: None,
        }
    }

    #[must_use]
    pub fn action(&self) -> Option<FeatureAction> {
        self.action
    }

    /// Set once `run` has completed.
    #[must_use]
    pub fn outcome(&self) -> Option<FeatureOutcome> {
        self.outcome
    }

    pub fn feature(&self) -> &F {
        &self.feature
    }
}

impl<F: Feature> Operation for SingleFeature<F> {
    fn name(&self) -> &str {
        self.feature.name()
    }

    fn open_flags(&self) -> OpenFlags {
        self.feature.open_flags()
    }

    fn usage_args(&self) -> &str {
        "{enable|disable}"
    }

    fn parse_arg(&mut self, arg: Option<&str>) -> Result<()> {
        self.action = Some(FeatureAction::parse(arg)?);
        Ok(())
    }

    fn run(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let Some(action) = self.action else {
            return Err(CtnError::Internal(format!(
                "no action chosen for feature {}",
                self.feature.name()
            )));
        };
        let outcome = match action {
            FeatureAction::Enable => self.feature.enable(ctx)?,
            FeatureAction::Disable => self.feature.disable(ctx)?,
        };
        info!(
            feature = self.feature.name(),
            bit = %self.feature.incompat_bit(),
            ?action,
            ?outcome,
            "feature operation finished"
        );
        self.outcome = Some(outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_flags_reproduce_the_master_mode() {
        let declared = OpenFlags::RW | OpenFlags::ALLOCATION | OpenFlags::ONLINE;
        assert_eq!(
            working_flags(declared, OpenOutcome::Ready),
            OpenFlags::RW | OpenFlags::ALLOCATION
        );
        assert_eq!(working_flags(declared, OpenOutcome::PerformOnline), declared);

        let tolerant = OpenFlags::RW | OpenFlags::NOCLUSTER;
        assert_eq!(working_flags(tolerant, OpenOutcome::Ready), OpenFlags::RW);
        assert_eq!(working_flags(tolerant, OpenOutcome::InvalidStackName), tolerant);
    }

    #[test]
    fn feature_actions_parse_strictly() {
        assert_eq!(FeatureAction::parse(Some("enable")).expect("enable"), FeatureAction::Enable);
        assert_eq!(
            FeatureAction::parse(Some("disable")).expect("disable"),
            FeatureAction::Disable
        );
        for bad in [Some("Enable"), Some("on"), Some(""), None] {
            let err = FeatureAction::parse(bad).unwrap_err();
            assert!(matches!(err, CtnError::Usage(_)), "{bad:?}: {err:?}");
        }
        assert_eq!(
            FeatureAction::parse(Some("toggle")).unwrap_err().to_string(),
            "Unknown action: \"toggle\""
        );
    }
}
