//! Access to devices and mounts on this host.
//!
//! [`DeviceAccess`] is the seam between session management and the
//! operating system: opening images, exclusive claims, the mount table, and
//! the live mount's control path. [`HostDevices`] is the real
//! implementation; tests substitute in-memory ones.

use crate::lease::DeviceKey;
use ctn_block::{ByteDevice, FileByteDevice};
use ctn_error::{CtnError, Result};
use ctn_ondisk::OpenMode;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// How a device is currently in use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountStatus {
    pub mounted: bool,
    pub read_only: bool,
    pub swap: bool,
    pub mount_point: Option<PathBuf>,
}

impl MountStatus {
    /// A read-write mount that can take online requests.
    #[must_use]
    pub fn accepts_online(&self) -> bool {
        self.mounted && !self.read_only && !self.swap
    }
}

/// An exclusive claim on a device. Dropping it releases the claim.
pub struct ExclusiveClaim {
    _guard: Box<dyn Send>,
}

impl ExclusiveClaim {
    pub fn new<G: Send + 'static>(guard: G) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl fmt::Debug for ExclusiveClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveClaim").finish_non_exhaustive()
    }
}

/// Control path of a mounted filesystem.
pub trait OnlineChannel: Send {
    /// Issue control request `request` with `arg` as its in/out buffer.
    fn control(&self, request: u64, arg: &mut [u8]) -> std::io::Result<()>;
}

pub trait DeviceAccess: Send {
    fn device_key(&self, device: &str) -> DeviceKey;

    fn open_image(&self, device: &str, mode: OpenMode) -> Result<Arc<dyn ByteDevice>>;

    /// Open `device` for exclusive use. Fails with `EBUSY` when someone else
    /// (a mount, another tool) holds it.
    fn claim_exclusive(&self, device: &str) -> std::io::Result<ExclusiveClaim>;

    fn mount_status(&self, device: &str) -> Result<MountStatus>;

    fn open_mount_point(&self, mount_point: &Path) -> std::io::Result<Box<dyn OnlineChannel>>;
}

// ── Host implementation ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostDevices {
    mounts_table: PathBuf,
    swaps_table: PathBuf,
}

impl Default for HostDevices {
    fn default() -> Self {
        Self {
            mounts_table: PathBuf::from("/proc/mounts"),
            swaps_table: PathBuf::from("/proc/swaps"),
        }
    }
}

impl HostDevices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read mount and swap tables from other files.
    #[must_use]
    pub fn with_tables(mounts_table: impl Into<PathBuf>, swaps_table: impl Into<PathBuf>) -> Self {
        Self {
            mounts_table: mounts_table.into(),
            swaps_table: swaps_table.into(),
        }
    }
}

fn read_table(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(CtnError::Io(err)),
    }
}

/// Undo the octal escapes (`\040` for space) used in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' && idx + 3 < bytes.len() {
            let digits = &bytes[idx + 1..idx + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0_u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    idx += 4;
                    continue;
                }
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Find `device` in mount table text (`/proc/mounts` format).
#[must_use]
pub fn parse_mount_table(text: &str, device: &DeviceKey) -> Option<(PathBuf, bool)> {
    text.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = unescape_mount_field(fields.next()?);
        let target = unescape_mount_field(fields.next()?);
        let _fstype = fields.next()?;
        let options = fields.next().unwrap_or("");
        if DeviceKey::canonical(&source) != *device {
            return None;
        }
        let read_only = options.split(',').any(|opt| opt == "ro");
        Some((PathBuf::from(target), read_only))
    })
}

/// True if `device` is listed as active swap (`/proc/swaps` format).
#[must_use]
pub fn parse_swap_table(text: &str, device: &DeviceKey) -> bool {
    text.lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| DeviceKey::canonical(&unescape_mount_field(name)) == *device)
}

impl DeviceAccess for HostDevices {
    fn device_key(&self, device: &str) -> DeviceKey {
        DeviceKey::canonical(device)
    }

    fn open_image(&self, device: &str, mode: OpenMode) -> Result<Arc<dyn ByteDevice>> {
        let writable = mode == OpenMode::ReadWrite;
        match FileByteDevice::open(device, writable) {
            Ok(dev) => Ok(Arc::new(dev)),
            Err(CtnError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CtnError::DeviceNotFound(device.to_owned()))
            }
            Err(err) => Err(err),
        }
    }

    /// `O_EXCL` claims block devices. It means nothing for a regular file,
    /// so an image file also carries a non-blocking `flock`.
    fn claim_exclusive(&self, device: &str) -> std::io::Result<ExclusiveClaim> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL)
            .open(device)?;
        let fd = file.as_raw_fd();
        if !file.metadata()?.is_file() {
            trace!(device, fd, "exclusive claim taken");
            return Ok(ExclusiveClaim::new(file));
        }
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                std::io::Error::from_raw_os_error(libc::EBUSY)
            } else {
                std::io::Error::from(errno)
            }
        })?;
        trace!(device, fd, "exclusive claim taken with file lock");
        Ok(ExclusiveClaim::new(lock))
    }

    fn mount_status(&self, device: &str) -> Result<MountStatus> {
        let key = self.device_key(device);
        let mut status = MountStatus::default();
        if let Some((target, read_only)) = parse_mount_table(&read_table(&self.mounts_table)?, &key)
        {
            status.mounted = true;
            status.read_only = read_only;
            status.mount_point = Some(target);
        }
        status.swap = parse_swap_table(&read_table(&self.swaps_table)?, &key);
        Ok(status)
    }

    fn open_mount_point(&self, mount_point: &Path) -> std::io::Result<Box<dyn OnlineChannel>> {
        let file = File::open(mount_point)?;
        Ok(Box::new(MountPointChannel { file }))
    }
}

/// Control requests issued as ioctls on the mount point directory.
#[derive(Debug)]
pub struct MountPointChannel {
    file: File,
}

impl OnlineChannel for MountPointChannel {
    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    fn control(&self, request: u64, arg: &mut [u8]) -> std::io::Result<()> {
        // SAFETY: the descriptor is owned by `self.file` and stays open for
        // the call; `arg` is a live, exclusively borrowed buffer that the
        // request reads and writes in place.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg.as_mut_ptr()) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}
