#![forbid(unsafe_code)]
//! Test support for clustune.
//!
//! [`FakeHost`] stands in for the devices and mount table of one machine and
//! [`FakeCluster`] for a lock manager shared by several nodes. Several
//! [`Runtime`]s built over the same fakes behave like separate processes
//! contending for the same filesystem.

pub mod fixture;

use ctn_block::{ByteDevice, MemByteDevice};
use ctn_core::cluster::check_stack_name;
use ctn_core::{
    ClusterStack, Console, DeviceAccess, DeviceKey, DlmContext, ExclusiveClaim, MountStatus,
    OnlineChannel, Runtime, RuntimeConfig,
};
use ctn_error::{CtnError, Result};
use ctn_ondisk::{FsImage, OpenMode};
use ctn_types::Cx;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Device path used by tests that need only one.
pub const DEVICE: &str = "/dev/ctn-test0";

// ── Host ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct HostState {
    images: HashMap<String, MemByteDevice>,
    claims: HashSet<String>,
    mounts: HashMap<String, MountStatus>,
    mount_point_errno: Option<i32>,
    request_errno: Option<i32>,
    requests: Vec<u64>,
}

/// Devices, exclusive claims and mounts of one simulated machine.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl fmt::Debug for FakeHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeHost")
            .field("claims", &state.claims)
            .field("mounts", &state.mounts)
            .finish_non_exhaustive()
    }
}

impl FakeHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an image at `device`. The returned handle shares its bytes.
    pub fn add_image(&self, device: &str, bytes: Vec<u8>) -> MemByteDevice {
        let mem = MemByteDevice::from_bytes(bytes);
        self.state.lock().images.insert(device.to_owned(), mem.clone());
        mem
    }

    /// Mount `device`. A mounted device refuses exclusive claims.
    pub fn mount(&self, device: &str, mount_point: impl Into<PathBuf>, read_only: bool) {
        self.state.lock().mounts.insert(
            device.to_owned(),
            MountStatus {
                mounted: true,
                read_only,
                swap: false,
                mount_point: Some(mount_point.into()),
            },
        );
    }

    pub fn add_swap(&self, device: &str) {
        self.state.lock().mounts.insert(
            device.to_owned(),
            MountStatus {
                swap: true,
                ..MountStatus::default()
            },
        );
    }

    pub fn unmount(&self, device: &str) {
        self.state.lock().mounts.remove(device);
    }

    /// Make opening any mount point fail with `errno`.
    pub fn fail_mount_point(&self, errno: i32) {
        self.state.lock().mount_point_errno = Some(errno);
    }

    /// Make every online request fail with `errno`.
    pub fn fail_requests(&self, errno: i32) {
        self.state.lock().request_errno = Some(errno);
    }

    #[must_use]
    pub fn is_claimed(&self, device: &str) -> bool {
        self.state.lock().claims.contains(device)
    }

    /// Online requests received so far, in order.
    #[must_use]
    pub fn online_requests(&self) -> Vec<u64> {
        self.state.lock().requests.clone()
    }

    #[must_use]
    pub fn devices(&self) -> FakeDevices {
        FakeDevices {
            state: Arc::clone(&self.state),
        }
    }
}

/// [`DeviceAccess`] over a [`FakeHost`].
pub struct FakeDevices {
    state: Arc<Mutex<HostState>>,
}

impl fmt::Debug for FakeDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeDevices").finish_non_exhaustive()
    }
}

struct ClaimGuard {
    state: Arc<Mutex<HostState>>,
    device: String,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.state.lock().claims.remove(&self.device);
        trace!(device = %self.device, "fake claim dropped");
    }
}

struct FakeChannel {
    state: Arc<Mutex<HostState>>,
}

impl OnlineChannel for FakeChannel {
    fn control(&self, request: u64, _arg: &mut [u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if let Some(errno) = state.request_errno {
            return Err(io::Error::from_raw_os_error(errno));
        }
        state.requests.push(request);
        Ok(())
    }
}

impl DeviceAccess for FakeDevices {
    fn device_key(&self, device: &str) -> DeviceKey {
        DeviceKey::new(device)
    }

    fn open_image(&self, device: &str, _mode: OpenMode) -> Result<Arc<dyn ByteDevice>> {
        let state = self.state.lock();
        let mem = state
            .images
            .get(device)
            .cloned()
            .ok_or_else(|| CtnError::DeviceNotFound(device.to_owned()))?;
        Ok(Arc::new(mem))
    }

    fn claim_exclusive(&self, device: &str) -> io::Result<ExclusiveClaim> {
        let mut state = self.state.lock();
        if !state.images.contains_key(device) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let mounted = state
            .mounts
            .get(device)
            .is_some_and(|status| status.mounted || status.swap);
        if mounted || !state.claims.insert(device.to_owned()) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        Ok(ExclusiveClaim::new(ClaimGuard {
            state: Arc::clone(&self.state),
            device: device.to_owned(),
        }))
    }

    fn mount_status(&self, device: &str) -> Result<MountStatus> {
        Ok(self
            .state
            .lock()
            .mounts
            .get(device)
            .cloned()
            .unwrap_or_default())
    }

    fn open_mount_point(&self, _mount_point: &Path) -> io::Result<Box<dyn OnlineChannel>> {
        if let Some(errno) = self.state.lock().mount_point_errno {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(Box::new(FakeChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

// ── Cluster ─────────────────────────────────────────────────────────────────

/// Holder id used for locks taken by [`FakeCluster::hold_elsewhere`].
const FOREIGN_HOLDER: u64 = u64::MAX;

#[derive(Debug, Default)]
struct ClusterState {
    locks: HashMap<String, u64>,
    next_id: u64,
    joins: usize,
    lock_attempts: usize,
    down: bool,
}

/// Lock manager shared by every node stack created from it.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    running: String,
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    #[must_use]
    pub fn new(running: &str) -> Self {
        Self {
            running: running.to_owned(),
            state: Arc::default(),
        }
    }

    /// A node's view of the cluster.
    #[must_use]
    pub fn stack(&self) -> FakeClusterStack {
        FakeClusterStack {
            running: self.running.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Stop answering `init`.
    pub fn set_down(&self, down: bool) {
        self.state.lock().down = down;
    }

    /// Take the lock on `domain` as some other node would.
    pub fn hold_elsewhere(&self, domain: &str) {
        self.state.lock().locks.insert(domain.to_owned(), FOREIGN_HOLDER);
    }

    pub fn release_elsewhere(&self, domain: &str) {
        let mut state = self.state.lock();
        if state.locks.get(domain) == Some(&FOREIGN_HOLDER) {
            state.locks.remove(domain);
        }
    }

    #[must_use]
    pub fn is_locked(&self, domain: &str) -> bool {
        self.state.lock().locks.contains_key(domain)
    }

    #[must_use]
    pub fn lock_attempts(&self) -> usize {
        self.state.lock().lock_attempts
    }

    #[must_use]
    pub fn joins(&self) -> usize {
        self.state.lock().joins
    }
}

/// [`ClusterStack`] for one node of a [`FakeCluster`]. The lock domain is
/// the device path.
#[derive(Debug)]
pub struct FakeClusterStack {
    running: String,
    state: Arc<Mutex<ClusterState>>,
}

impl FakeClusterStack {
    fn drop_lock(&self, ctx: &DlmContext) -> bool {
        let mut state = self.state.lock();
        if state.locks.get(ctx.domain()) == Some(&ctx.id()) {
            state.locks.remove(ctx.domain());
            true
        } else {
            false
        }
    }
}

impl ClusterStack for FakeClusterStack {
    fn name(&self) -> &str {
        &self.running
    }

    fn init(&mut self) -> Result<()> {
        if self.state.lock().down {
            return Err(CtnError::ClusterStack("cluster stack is not running".to_owned()));
        }
        Ok(())
    }

    fn initialize_dlm(&mut self, image: &FsImage) -> Result<DlmContext> {
        check_stack_name(&self.running, image)?;
        let mut state = self.state.lock();
        state.joins += 1;
        state.next_id += 1;
        Ok(DlmContext::new(image.device_name(), state.next_id))
    }

    fn lock_down(&mut self, ctx: &DlmContext) -> Result<()> {
        let mut state = self.state.lock();
        state.lock_attempts += 1;
        if state.locks.contains_key(ctx.domain()) {
            return Err(CtnError::TrylockFailed);
        }
        state.locks.insert(ctx.domain().to_owned(), ctx.id());
        Ok(())
    }

    fn release(&mut self, ctx: &DlmContext) -> Result<()> {
        self.drop_lock(ctx);
        Ok(())
    }

    fn shutdown(&mut self, ctx: DlmContext) -> Result<()> {
        if self.drop_lock(&ctx) {
            trace!(domain = ctx.domain(), "lock dropped on shutdown");
        }
        Ok(())
    }
}

// ── Runtimes ────────────────────────────────────────────────────────────────

/// Quiet, non-interactive configuration.
#[must_use]
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::new("clustune-test").with_verbosity(0)
}

/// One simulated process on `host`, joined to `cluster`.
#[must_use]
pub fn runtime(host: &FakeHost, cluster: &FakeCluster, config: &RuntimeConfig) -> Runtime {
    Runtime::new(config, Box::new(host.devices()), Box::new(cluster.stack()))
        .with_cx(Cx::for_testing())
}

/// Console that reads `answers` instead of standard input.
#[must_use]
pub fn answering(config: &RuntimeConfig, answers: &str) -> Console {
    Console::new(config).with_input(Cursor::new(answers.as_bytes().to_vec()))
}

/// Read-only view of `mem` for assertions.
pub fn peek(mem: &MemByteDevice) -> Result<FsImage> {
    FsImage::open(
        &Cx::for_testing(),
        "peek",
        Arc::new(mem.clone()),
        OpenMode::ReadOnly,
    )
}

/// Claim clusters from the global bitmap until `keep` remain free.
pub fn fill_to(mem: &MemByteDevice, keep: u32) -> Result<()> {
    let cx = Cx::for_testing();
    let image = FsImage::open(&cx, "fill", Arc::new(mem.clone()), OpenMode::ReadWrite)?;
    while ctn_alloc::free_clusters(&cx, &image)? > keep {
        ctn_alloc::claim_cluster(&cx, &image)?;
    }
    image.close(&cx)
}
