//! Lock negotiation for read-write sessions.
//!
//! ## Decisions
//!
//! | Filesystem | Situation | Decision |
//! |------------|-----------|----------|
//! | local-mount | exclusive open succeeds (or is already held) | `LocalExclusive` |
//! | local-mount | device busy with a read-write mount, caller is online-capable | `PerformOnline` |
//! | clustered | handoff says `locked` | `Adopted` |
//! | clustered | handoff says `online`, caller is online-capable | `PerformOnline` |
//! | clustered | trylock succeeds | `ClusterLocked` |
//! | clustered | trylock fails, caller is online-capable | `PerformOnline` |
//! | clustered | stack mismatch, caller passed `NOCLUSTER` | `StackMismatch` |
//! | clustered | stack matches, caller passed `NOCLUSTER` | `StackJoined` |
//!
//! Anything else is an error. Local and negotiated clustered outcomes
//! rewrite the handoff marker: `online` after `PerformOnline`, `locked` while
//! the cluster lock is held, and cleared otherwise. Adopted decisions and
//! failed cluster negotiation leave it alone.

use crate::cluster::{ClusterStack, DlmContext};
use crate::config::Handoff;
use crate::host::{DeviceAccess, ExclusiveClaim};
use crate::lease::{DeviceKey, Lease, LeaseArena};
use crate::signals::with_signals_blocked;
use ctn_error::{CtnError, Result};
use ctn_ondisk::FsImage;
use ctn_types::OpenFlags;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    LocalExclusive,
    ClusterLocked,
    /// A parent invocation holds the cluster lock.
    Adopted,
    /// The change has to go through the live mount.
    PerformOnline,
    /// The filesystem names another cluster stack and the caller accepts it.
    StackMismatch,
    /// `NOCLUSTER` caller on a matching stack; joined but not locked.
    StackJoined,
}

impl LockDecision {
    /// The control signal this decision reports to the opener, if any.
    #[must_use]
    pub fn mode_signal(self) -> Option<CtnError> {
        match self {
            Self::PerformOnline => Some(CtnError::PerformOnline),
            Self::StackMismatch => Some(CtnError::InvalidStackName),
            _ => None,
        }
    }
}

/// What one session holds. Released through [`LockCoordinator::release`].
#[derive(Debug, Default)]
#[must_use]
pub struct SessionLock {
    local: Option<Lease>,
    dlm: Option<DlmContext>,
}

impl SessionLock {
    #[must_use]
    pub fn holds_local(&self) -> bool {
        self.local.is_some()
    }

    #[must_use]
    pub fn has_dlm(&self) -> bool {
        self.dlm.is_some()
    }
}

/// Process-wide lock state: local claims by device, whether the cluster
/// lock is held, and the handoff marker.
pub struct LockCoordinator {
    stack: Box<dyn ClusterStack>,
    local: LeaseArena<ExclusiveClaim>,
    cluster_locked: bool,
    handoff: Handoff,
}

impl fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("stack", &self.stack.name())
            .field("cluster_locked", &self.cluster_locked)
            .field("handoff", &self.handoff)
            .finish_non_exhaustive()
    }
}

impl LockCoordinator {
    #[must_use]
    pub fn new(stack: Box<dyn ClusterStack>, handoff: Handoff) -> Self {
        Self {
            stack,
            local: LeaseArena::new(),
            cluster_locked: false,
            handoff,
        }
    }

    #[must_use]
    pub fn handoff(&self) -> Handoff {
        self.handoff
    }

    /// Overwrite the marker, as a parent clearing it before spawning would.
    pub fn set_handoff(&mut self, handoff: Handoff) {
        self.handoff = handoff;
    }

    #[must_use]
    pub fn cluster_locked(&self) -> bool {
        self.cluster_locked
    }

    #[must_use]
    pub fn local_holders(&self, key: &DeviceKey) -> usize {
        self.local.count(key)
    }

    /// Decide how `image` may be changed and take the matching lock.
    ///
    /// Whatever is acquired is recorded in `held`, also when the decision is
    /// a mode signal, so the session can give it back on close.
    pub fn acquire(
        &mut self,
        devices: &dyn DeviceAccess,
        image: &FsImage,
        flags: OpenFlags,
        held: &mut SessionLock,
    ) -> Result<LockDecision> {
        let decision = if image.superblock().is_local() {
            self.lock_local(devices, image.device_name(), flags, held)
        } else {
            self.lock_cluster(image, flags, held)
        };
        match &decision {
            Ok(decision) => debug!(device = %image.device_name(), ?decision, "lock decision"),
            Err(err) => debug!(device = %image.device_name(), error = %err, "lock failed"),
        }
        decision
    }

    fn lock_local(
        &mut self,
        devices: &dyn DeviceAccess,
        device: &str,
        flags: OpenFlags,
        held: &mut SessionLock,
    ) -> Result<LockDecision> {
        let key = devices.device_key(device);
        let lease = self.local.acquire_with(key, || {
            devices
                .claim_exclusive(device)
                .map_err(|err| classify_claim_error(devices, device, flags, err))
        });
        self.handoff = Handoff::Absent;
        match lease {
            Ok(lease) => {
                held.local = Some(lease);
                Ok(LockDecision::LocalExclusive)
            }
            Err(CtnError::PerformOnline) => {
                self.handoff = Handoff::Online;
                Ok(LockDecision::PerformOnline)
            }
            Err(err) => Err(err),
        }
    }

    fn lock_cluster(
        &mut self,
        image: &FsImage,
        flags: OpenFlags,
        held: &mut SessionLock,
    ) -> Result<LockDecision> {
        match self.handoff {
            Handoff::Locked => return Ok(LockDecision::Adopted),
            Handoff::Online if flags.contains(OpenFlags::ONLINE) => {
                return Ok(LockDecision::PerformOnline);
            }
            _ => {}
        }

        let decision = self.negotiate(image, flags, held)?;
        self.handoff = match decision {
            LockDecision::PerformOnline => Handoff::Online,
            _ if self.cluster_locked => Handoff::Locked,
            _ => Handoff::Absent,
        };
        Ok(decision)
    }

    fn negotiate(
        &mut self,
        image: &FsImage,
        flags: OpenFlags,
        held: &mut SessionLock,
    ) -> Result<LockDecision> {
        self.stack.init()?;

        let joined = self.stack.initialize_dlm(image);
        if flags.contains(OpenFlags::NOCLUSTER) {
            match joined {
                Ok(ctx) => {
                    held.dlm = Some(ctx);
                    return Ok(LockDecision::StackJoined);
                }
                Err(CtnError::InvalidStackName) => return Ok(LockDecision::StackMismatch),
                Err(_) => {}
            }
        }
        let ctx = joined?;

        let stack = &mut self.stack;
        match with_signals_blocked(|| stack.lock_down(&ctx)) {
            Ok(()) => {
                self.cluster_locked = true;
                held.dlm = Some(ctx);
                Ok(LockDecision::ClusterLocked)
            }
            Err(CtnError::TrylockFailed) if flags.contains(OpenFlags::ONLINE) => {
                held.dlm = Some(ctx);
                Ok(LockDecision::PerformOnline)
            }
            Err(err) => {
                if let Err(shutdown) = self.stack.shutdown(ctx) {
                    warn!(error = %shutdown, "cluster shutdown after failed lock");
                }
                Err(err)
            }
        }
    }

    /// Give back everything `held` took and clear the handoff marker.
    /// Every step runs; the first error is returned.
    pub fn release(&mut self, held: SessionLock) -> Result<()> {
        let SessionLock { local, dlm } = held;
        let mut first_err = None;

        if let Some(lease) = local {
            if self.local.release(lease).is_some() {
                debug!("local exclusive claim closed");
            }
        }

        if let Some(ctx) = dlm {
            if self.cluster_locked {
                let stack = &mut self.stack;
                if let Err(err) = with_signals_blocked(|| stack.release(&ctx)) {
                    first_err.get_or_insert(err);
                }
                self.cluster_locked = false;
            }
            if let Err(err) = self.stack.shutdown(ctx) {
                first_err.get_or_insert(err);
            }
        }

        self.handoff = Handoff::Absent;
        first_err.map_or(Ok(()), Err)
    }
}

/// An exclusive open failed: work out whether the holder is a mount we can
/// hand the change to.
fn classify_claim_error(
    devices: &dyn DeviceAccess,
    device: &str,
    flags: OpenFlags,
    err: std::io::Error,
) -> CtnError {
    match err.raw_os_error() {
        Some(libc::EBUSY) => match devices.mount_status(device) {
            Ok(status) if status.accepts_online() && flags.contains(OpenFlags::ONLINE) => {
                CtnError::PerformOnline
            }
            Ok(_) => CtnError::DeviceBusy,
            Err(err) => err,
        },
        Some(libc::ENOENT) => CtnError::DeviceNotFound(device.to_owned()),
        _ => CtnError::Io(err),
    }
}
