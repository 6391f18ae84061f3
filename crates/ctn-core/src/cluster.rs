//! Cluster stack boundary: joining a filesystem's lock domain and taking
//! the whole-filesystem distributed lock.

use ctn_error::{CtnError, Result};
use ctn_ondisk::FsImage;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, trace};

/// A joined lock domain. Owned by the session that joined it and handed
/// back to the stack on shutdown.
#[derive(Debug, PartialEq, Eq)]
pub struct DlmContext {
    domain: String,
    id: u64,
}

impl DlmContext {
    #[must_use]
    pub fn new(domain: impl Into<String>, id: u64) -> Self {
        Self {
            domain: domain.into(),
            id,
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub trait ClusterStack: Send {
    /// Name of the stack this node runs.
    fn name(&self) -> &str;

    /// Make sure the stack is reachable. Called before every join.
    fn init(&mut self) -> Result<()>;

    /// Join the lock domain of `image`. Fails with
    /// [`CtnError::InvalidStackName`] when the filesystem was formatted for
    /// a different stack.
    fn initialize_dlm(&mut self, image: &FsImage) -> Result<DlmContext>;

    /// Take the filesystem lock without waiting. Fails with
    /// [`CtnError::TrylockFailed`] when another holder has it.
    fn lock_down(&mut self, ctx: &DlmContext) -> Result<()>;

    fn release(&mut self, ctx: &DlmContext) -> Result<()>;

    /// Leave the domain. Any lock still held through `ctx` is dropped.
    fn shutdown(&mut self, ctx: DlmContext) -> Result<()>;
}

/// Stack name check shared by implementations.
pub fn check_stack_name(running: &str, image: &FsImage) -> Result<()> {
    let on_disk = image.superblock().cluster_stack.as_str();
    if on_disk == running {
        Ok(())
    } else {
        debug!(device = %image.device_name(), on_disk, running, "cluster stack mismatch");
        Err(CtnError::InvalidStackName)
    }
}

// ── Host stack ──────────────────────────────────────────────────────────────

/// Cluster lock backed by `flock(2)` on one file per filesystem under a
/// shared lock directory.
///
/// Every node mounting the lock directory contends on the same files, so the
/// lock excludes other processes on this host and on any node sharing the
/// directory.
#[derive(Debug)]
pub struct HostClusterStack {
    running: String,
    lock_dir: PathBuf,
    next_id: u64,
    held: HashMap<u64, Flock<File>>,
}

impl HostClusterStack {
    #[must_use]
    pub fn new(running: impl Into<String>, lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            running: running.into(),
            lock_dir: lock_dir.into(),
            next_id: 0,
            held: HashMap::new(),
        }
    }

    fn lock_path(&self, domain: &str) -> PathBuf {
        self.lock_dir.join(format!("{domain}.lock"))
    }
}

/// Lock domain name for a device path: the canonical path with separators
/// flattened.
#[must_use]
pub fn domain_for_device(device: &str) -> String {
    let canonical = std::fs::canonicalize(device).unwrap_or_else(|_| PathBuf::from(device));
    canonical
        .to_string_lossy()
        .trim_start_matches('/')
        .replace('/', "_")
}

impl ClusterStack for HostClusterStack {
    fn name(&self) -> &str {
        &self.running
    }

    fn init(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.lock_dir).map_err(|err| {
            CtnError::ClusterStack(format!(
                "cannot prepare lock directory {}: {err}",
                self.lock_dir.display()
            ))
        })
    }

    fn initialize_dlm(&mut self, image: &FsImage) -> Result<DlmContext> {
        check_stack_name(&self.running, image)?;
        self.next_id += 1;
        let ctx = DlmContext::new(domain_for_device(image.device_name()), self.next_id);
        trace!(domain = ctx.domain(), id = ctx.id(), "joined lock domain");
        Ok(ctx)
    }

    fn lock_down(&mut self, ctx: &DlmContext) -> Result<()> {
        let path = self.lock_path(ctx.domain());
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| {
                CtnError::ClusterStack(format!("cannot open lock file {}: {err}", path.display()))
            })?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                self.held.insert(ctx.id(), lock);
                debug!(domain = ctx.domain(), "cluster lock taken");
                Ok(())
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(CtnError::TrylockFailed),
            Err((_, errno)) => Err(CtnError::ClusterStack(format!(
                "lock {}: {errno}",
                path.display()
            ))),
        }
    }

    fn release(&mut self, ctx: &DlmContext) -> Result<()> {
        let Some(lock) = self.held.remove(&ctx.id()) else {
            return Ok(());
        };
        lock.unlock()
            .map(drop)
            .map_err(|(_, errno)| CtnError::ClusterStack(format!("unlock {}: {errno}", ctx.domain())))?;
        debug!(domain = ctx.domain(), "cluster lock released");
        Ok(())
    }

    fn shutdown(&mut self, ctx: DlmContext) -> Result<()> {
        if self.held.remove(&ctx.id()).is_some() {
            debug!(domain = ctx.domain(), "dropped cluster lock on shutdown");
        }
        trace!(domain = ctx.domain(), "left lock domain");
        Ok(())
    }
}
