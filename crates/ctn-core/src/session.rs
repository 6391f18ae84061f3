//! Device sessions and the process runtime that owns them.
//!
//! A read-write open runs, in order: state-bit fencing, lock negotiation,
//! cache setup, and then either consistency validation (offline) or the
//! online descriptor (live mount). Any failure after registration undoes
//! what was taken, except the two mode outcomes, which keep the session.

use crate::cluster::{ClusterStack, HostClusterStack};
use crate::config::{Handoff, RuntimeConfig};
use crate::console::Console;
use crate::host::{DeviceAccess, HostDevices};
use crate::lease::{DeviceKey, Lease, LeaseArena};
use crate::lock::{LockCoordinator, LockDecision, SessionLock};
use crate::online::OnlineDescriptor;
use crate::registry::{SessionId, SessionRegistry};
use crate::signals::with_signals_blocked;
use crate::validate::{global_bitmap_check, journal_check};
use ctn_error::{CtnError, Result};
use ctn_ondisk::{FsImage, OpenMode};
use ctn_types::{Cx, IncompatFeatures, OpenFlags, TunefsFlags};
use std::collections::HashMap;
use std::process::Command;
use tracing::{debug, info, warn};

/// Mode an open settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Offline with full access.
    Ready,
    /// Changes go through the live mount.
    PerformOnline,
    /// The cluster stack does not match and the caller accepted that.
    InvalidStackName,
}

impl OpenOutcome {
    /// Flag the second open of an operation needs to reproduce this mode.
    #[must_use]
    pub fn mode_flag(self) -> OpenFlags {
        match self {
            Self::Ready => OpenFlags::NONE,
            Self::PerformOnline => OpenFlags::ONLINE,
            Self::InvalidStackName => OpenFlags::NOCLUSTER,
        }
    }
}

impl From<LockDecision> for OpenOutcome {
    fn from(decision: LockDecision) -> Self {
        match decision {
            LockDecision::PerformOnline => Self::PerformOnline,
            LockDecision::StackMismatch => Self::InvalidStackName,
            LockDecision::LocalExclusive
            | LockDecision::ClusterLocked
            | LockDecision::Adopted
            | LockDecision::StackJoined => Self::Ready,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub id: SessionId,
    pub outcome: OpenOutcome,
}

/// Marker recorded in the superblock while a change is underway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InProgress {
    Resize,
    Tunefs(TunefsFlags),
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    device: String,
    key: DeviceKey,
    flags: OpenFlags,
    image: FsImage,
    decision: Option<LockDecision>,
    lock: Option<SessionLock>,
    online: Option<Lease>,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    #[must_use]
    pub fn image(&self) -> &FsImage {
        &self.image
    }

    /// `None` for read-only sessions.
    #[must_use]
    pub fn decision(&self) -> Option<LockDecision> {
        self.decision
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.is_some()
    }
}

/// Everything one invocation holds: the sessions it opened, the lock state
/// they share, and the console and cancellation context they report to.
///
/// Dropping the runtime closes any sessions still open, newest first.
pub struct Runtime {
    cx: Cx,
    console: Console,
    devices: Box<dyn DeviceAccess>,
    coordinator: LockCoordinator,
    online: LeaseArena<OnlineDescriptor>,
    registry: SessionRegistry,
    sessions: HashMap<SessionId, Session>,
    journal_clusters: Option<u32>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("coordinator", &self.coordinator)
            .field("registry", &self.registry)
            .field("journal_clusters", &self.journal_clusters)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    #[must_use]
    pub fn new(
        config: &RuntimeConfig,
        devices: Box<dyn DeviceAccess>,
        stack: Box<dyn ClusterStack>,
    ) -> Self {
        let cx = Cx::for_request();
        Self {
            console: Console::new(config).with_cx(cx.clone()),
            cx,
            devices,
            coordinator: LockCoordinator::new(stack, config.handoff),
            online: LeaseArena::new(),
            registry: SessionRegistry::new(),
            sessions: HashMap::new(),
            journal_clusters: None,
        }
    }

    /// Runtime over this host's devices, mount table and lock directory.
    #[must_use]
    pub fn host(config: &RuntimeConfig) -> Self {
        Self::new(
            config,
            Box::new(HostDevices::new()),
            Box::new(HostClusterStack::new(
                config.running_stack.clone(),
                config.lock_dir.clone(),
            )),
        )
    }

    #[must_use]
    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console.with_cx(self.cx.clone());
        self
    }

    /// Replace the cancellation context; the console follows it.
    #[must_use]
    pub fn with_cx(mut self, cx: Cx) -> Self {
        self.console.set_cx(cx.clone());
        self.cx = cx;
        self
    }

    #[must_use]
    pub fn cx(&self) -> &Cx {
        &self.cx
    }

    #[must_use]
    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.console
    }

    #[must_use]
    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn handoff(&self) -> Handoff {
        self.coordinator.handoff()
    }

    /// Forget the inherited lock decision; the next open negotiates afresh.
    pub fn clear_handoff(&mut self) {
        self.coordinator.set_handoff(Handoff::Absent);
    }

    /// Pass the current lock decision on to a child invocation.
    pub fn export_handoff(&self, command: &mut Command) {
        self.coordinator.handoff().apply_to(command);
    }

    /// Largest journal seen by a clean journal check in this process.
    #[must_use]
    pub fn journal_clusters(&self) -> Option<u32> {
        self.journal_clusters
    }

    // ── Open / close ─────────────────────────────────────────────────────

    /// Open `device`. `RW` in `flags` selects a locked, validated session;
    /// otherwise the session is a plain read-only view.
    pub fn open(&mut self, device: &str, flags: OpenFlags) -> Result<Opened> {
        self.cx.checkpoint().map_err(|_| CtnError::Cancelled)?;
        let rw = flags.contains(OpenFlags::RW);
        let mode = if rw {
            OpenMode::ReadWrite
        } else {
            OpenMode::ReadOnly
        };
        let raw = self.devices.open_image(device, mode)?;
        let image = FsImage::open(&self.cx, device, raw, mode)?;
        let id = self.registry.register();
        let mut session = Session {
            id,
            device: device.to_owned(),
            key: self.devices.device_key(device),
            flags,
            image,
            decision: None,
            lock: None,
            online: None,
        };

        if !rw {
            debug!(session = %id, device, "opened read-only");
            self.sessions.insert(id, session);
            return Ok(Opened {
                id,
                outcome: OpenOutcome::Ready,
            });
        }

        match self.prepare_rw(&mut session, flags) {
            Ok(outcome) => {
                debug!(session = %id, device, %flags, ?outcome, "opened read-write");
                self.sessions.insert(id, session);
                Ok(Opened { id, outcome })
            }
            Err(err) => {
                self.registry.unregister(id);
                if let Err(close_err) = session.image.close(&Cx::for_request()) {
                    warn!(device, error = %close_err, "close after failed open");
                }
                Err(err)
            }
        }
    }

    fn prepare_rw(&mut self, session: &mut Session, flags: OpenFlags) -> Result<OpenOutcome> {
        let sb = session.image.superblock();
        if sb.has_incompat(IncompatFeatures::HEARTBEAT_DEV) {
            return Err(CtnError::HeartbeatDevice);
        }
        if sb.has_incompat(IncompatFeatures::RESIZE_INPROG) {
            return Err(CtnError::ResizeInProgress);
        }
        if sb.has_incompat(IncompatFeatures::TUNEFS_INPROG) {
            return Err(CtnError::TunefsInProgress(sb.tunefs_flag.bits()));
        }

        let mut held = SessionLock::default();
        let decision =
            self.coordinator
                .acquire(self.devices.as_ref(), &session.image, flags, &mut held)?;
        session.lock = Some(held);
        session.decision = Some(decision);

        let capacity = ctn_ondisk::inode::record_capacity(session.image.block_size());
        if let Err(err) = session.image.init_cache(capacity) {
            warn!(device = %session.device, error = %err, "running without io cache");
        }

        let outcome = OpenOutcome::from(decision);
        let checked = if outcome == OpenOutcome::PerformOnline {
            self.attach_online(session)
        } else {
            self.validate(session, flags)
        };
        if let Err(err) = checked {
            if let Some(lock) = session.lock.take() {
                if let Err(unlock_err) = self.coordinator.release(lock) {
                    warn!(device = %session.device, error = %unlock_err, "unlock after failed open");
                }
            }
            return Err(err);
        }
        Ok(outcome)
    }

    fn validate(&mut self, session: &Session, flags: OpenFlags) -> Result<()> {
        let summary = journal_check(&self.cx, &session.image)?;
        self.journal_clusters = Some(
            self.journal_clusters
                .map_or(summary.max_clusters, |seen| seen.max(summary.max_clusters)),
        );
        if flags.contains(OpenFlags::ALLOCATION) {
            global_bitmap_check(&self.cx, &session.image)?;
        }
        Ok(())
    }

    fn attach_online(&mut self, session: &mut Session) -> Result<()> {
        let devices = self.devices.as_ref();
        let device = session.device.as_str();
        let lease = self.online.acquire_with(session.key.clone(), || {
            let status = devices.mount_status(device)?;
            if !status.accepts_online() {
                return Err(CtnError::NotMounted);
            }
            let Some(mount_point) = status.mount_point else {
                return Err(CtnError::NotMounted);
            };
            let channel = devices.open_mount_point(&mount_point).map_err(|err| {
                match err.raw_os_error() {
                    Some(libc::EBUSY) => CtnError::DeviceBusy,
                    Some(libc::ENOENT) => CtnError::NotMounted,
                    _ => CtnError::Io(err),
                }
            })?;
            debug!(device, mount_point = %mount_point.display(), "online descriptor opened");
            Ok(OnlineDescriptor::new(channel))
        })?;
        session.online = Some(lease);
        Ok(())
    }

    /// Close a session: online descriptor, lock, then the image. Every step
    /// runs; the first error is returned.
    pub fn close(&mut self, id: SessionId) -> Result<()> {
        let Some(mut session) = self.sessions.remove(&id) else {
            return Err(CtnError::Internal(format!("session {id} is not open")));
        };
        self.registry.unregister(id);
        let mut first_err = None;

        if let Some(lease) = session.online.take() {
            if self.online.release(lease).is_some() {
                debug!(device = %session.device, "online descriptor closed");
            }
        }
        if let Some(lock) = session.lock.take() {
            if let Err(err) = self.coordinator.release(lock) {
                first_err.get_or_insert(err);
            }
        }
        // Teardown flushes even after a stop request.
        if let Err(err) = session.image.close(&Cx::for_request()) {
            first_err.get_or_insert(err);
        }

        debug!(session = %id, device = %session.device, "closed");
        first_err.map_or(Ok(()), Err)
    }

    /// Close every open session, newest first.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(id) = self.registry.top() {
            if !self.sessions.contains_key(&id) {
                self.registry.unregister(id);
                continue;
            }
            if let Err(err) = self.close(id) {
                warn!(session = %id, error = %err, "close during teardown");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // ── Session access ───────────────────────────────────────────────────

    pub fn session(&self, id: SessionId) -> Result<&Session> {
        self.sessions
            .get(&id)
            .ok_or_else(|| CtnError::Internal(format!("session {id} is not open")))
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| CtnError::Internal(format!("session {id} is not open")))
    }

    pub fn image(&self, id: SessionId) -> Result<&FsImage> {
        self.session(id).map(Session::image)
    }

    pub fn image_mut(&mut self, id: SessionId) -> Result<&mut FsImage> {
        self.session_mut(id).map(|session| &mut session.image)
    }

    /// Write the session's superblock with signals blocked.
    pub fn write_super(&mut self, id: SessionId) -> Result<()> {
        let cx = self.cx.clone();
        let image = self.image_mut(id)?;
        with_signals_blocked(|| image.write_super(&cx))
    }

    /// Record in the superblock that a change is underway.
    pub fn set_in_progress(&mut self, id: SessionId, what: InProgress) -> Result<()> {
        let sb = self.image_mut(id)?.superblock_mut();
        match what {
            InProgress::Resize => sb.feature_incompat.insert(IncompatFeatures::RESIZE_INPROG),
            InProgress::Tunefs(flag) => {
                sb.feature_incompat.insert(IncompatFeatures::TUNEFS_INPROG);
                sb.tunefs_flag.insert(flag);
            }
        }
        info!(?what, "marking change in progress");
        self.write_super(id)
    }

    /// Drop a marker set by [`set_in_progress`](Self::set_in_progress).
    /// `TUNEFS_INPROG` goes away with the last tunefs flag.
    pub fn clear_in_progress(&mut self, id: SessionId, what: InProgress) -> Result<()> {
        let sb = self.image_mut(id)?.superblock_mut();
        match what {
            InProgress::Resize => sb.feature_incompat.remove(IncompatFeatures::RESIZE_INPROG),
            InProgress::Tunefs(flag) => {
                sb.tunefs_flag.remove(flag);
                if sb.tunefs_flag == TunefsFlags::NONE {
                    sb.feature_incompat.remove(IncompatFeatures::TUNEFS_INPROG);
                }
            }
        }
        self.write_super(id)
    }

    /// Send a control request to the live mount behind an online session.
    pub fn online_control(&self, id: SessionId, request: u64, arg: &mut [u8]) -> Result<()> {
        let session = self.session(id)?;
        let descriptor = session
            .online
            .as_ref()
            .and_then(|lease| self.online.get(lease.key()))
            .ok_or_else(|| {
                CtnError::Internal(format!("session {id} has no online descriptor"))
            })?;
        descriptor.control(request, arg)
    }

    /// Sessions sharing the online descriptor of `id`'s device.
    #[must_use]
    pub fn online_holders(&self, id: SessionId) -> usize {
        self.sessions
            .get(&id)
            .map_or(0, |session| self.online.count(&session.key))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        if let Err(err) = self.close_all() {
            warn!(error = %err, "sessions left open at exit did not close cleanly");
        }
    }
}
