//! Requests delegated to a live mount.

use crate::host::OnlineChannel;
use ctn_error::CtnError;
use std::fmt;
use tracing::debug;

/// Sort a failed control request into caller misuse or a refusal by the
/// mounted filesystem.
#[must_use]
pub fn classify_online_error(request: u64, err: &std::io::Error) -> CtnError {
    match err.raw_os_error() {
        Some(libc::EBADF | libc::EFAULT | libc::ENOTTY) => {
            CtnError::Internal(format!("online request {request:#x}: {err}"))
        }
        _ => CtnError::OnlineFailed(format!("request {request:#x}: {err}")),
    }
}

/// The mount point's control descriptor, shared by every session on the
/// device through a lease.
pub struct OnlineDescriptor {
    channel: Box<dyn OnlineChannel>,
}

impl fmt::Debug for OnlineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnlineDescriptor").finish_non_exhaustive()
    }
}

impl OnlineDescriptor {
    #[must_use]
    pub fn new(channel: Box<dyn OnlineChannel>) -> Self {
        Self { channel }
    }

    pub fn control(&self, request: u64, arg: &mut [u8]) -> ctn_error::Result<()> {
        self.channel.control(request, arg).map_err(|err| {
            let err = classify_online_error(request, &err);
            debug!(request, error = %err, "online request failed");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct Refusing(i32);

    impl OnlineChannel for Refusing {
        fn control(&self, _request: u64, _arg: &mut [u8]) -> io::Result<()> {
            Err(io::Error::from_raw_os_error(self.0))
        }
    }

    #[test]
    fn misuse_errnos_are_internal() {
        for errno in [libc::EBADF, libc::EFAULT, libc::ENOTTY] {
            let desc = OnlineDescriptor::new(Box::new(Refusing(errno)));
            let err = desc.control(0x4f01, &mut []).unwrap_err();
            assert!(matches!(err, CtnError::Internal(_)), "errno {errno}: {err:?}");
        }
    }

    #[test]
    fn other_errnos_are_online_failures() {
        for errno in [libc::ENOSPC, libc::EINVAL, libc::EROFS] {
            let desc = OnlineDescriptor::new(Box::new(Refusing(errno)));
            let err = desc.control(0x4f01, &mut [0; 8]).unwrap_err();
            assert!(matches!(err, CtnError::OnlineFailed(_)), "errno {errno}: {err:?}");
        }
    }
}
