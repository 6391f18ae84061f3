//! Reference-counted OS resources shared by sessions on the same device.

use ctn_error::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Device identity: the canonical path when it resolves, the given path
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey(PathBuf);

impl DeviceKey {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    #[must_use]
    pub fn canonical(path: &str) -> Self {
        Self(std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path)))
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

/// Proof of one reference on a leased resource. Not `Clone`: each lease is
/// released exactly once, by value.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a lease leaks its reference; release it through the arena"]
pub struct Lease {
    key: DeviceKey,
}

impl Lease {
    #[must_use]
    pub fn key(&self) -> &DeviceKey {
        &self.key
    }
}

/// Resources keyed by device. The resource is created by the first
/// [`acquire_with`](Self::acquire_with) and handed back by the release that
/// drops the count to zero.
#[derive(Debug)]
pub struct LeaseArena<R> {
    entries: HashMap<DeviceKey, (R, usize)>,
}

impl<R> Default for LeaseArena<R> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<R> LeaseArena<R> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on `key`, calling `open` only if nobody holds one.
    pub fn acquire_with<F>(&mut self, key: DeviceKey, open: F) -> Result<Lease>
    where
        F: FnOnce() -> Result<R>,
    {
        if let Some((_, count)) = self.entries.get_mut(&key) {
            *count += 1;
            return Ok(Lease { key });
        }
        let resource = open()?;
        self.entries.insert(key.clone(), (resource, 1));
        Ok(Lease { key })
    }

    /// Drop one reference. Returns the resource when it was the last.
    pub fn release(&mut self, lease: Lease) -> Option<R> {
        let (_, count) = self.entries.get_mut(&lease.key)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }
        self.entries.remove(&lease.key).map(|(resource, _)| resource)
    }

    #[must_use]
    pub fn get(&self, key: &DeviceKey) -> Option<&R> {
        self.entries.get(key).map(|(resource, _)| resource)
    }

    #[must_use]
    pub fn count(&self, key: &DeviceKey) -> usize {
        self.entries.get(key).map_or(0, |(_, count)| *count)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctn_error::CtnError;

    #[test]
    fn resource_opens_once_and_closes_on_last_release() {
        let mut arena = LeaseArena::new();
        let key = DeviceKey::new("/dev/sdb1");
        let mut opens = 0;

        let first = arena
            .acquire_with(key.clone(), || {
                opens += 1;
                Ok("fd")
            })
            .expect("first");
        let second = arena
            .acquire_with(key.clone(), || {
                opens += 1;
                Ok("fd")
            })
            .expect("second");
        assert_eq!(opens, 1);
        assert_eq!(arena.count(&key), 2);

        assert_eq!(arena.release(first), None);
        assert_eq!(arena.count(&key), 1);
        assert_eq!(arena.release(second), Some("fd"));
        assert!(arena.is_empty());
    }

    #[test]
    fn failed_open_leaves_no_entry() {
        let mut arena: LeaseArena<()> = LeaseArena::new();
        let key = DeviceKey::new("/dev/missing");
        let err = arena
            .acquire_with(key.clone(), || Err(CtnError::DeviceBusy))
            .unwrap_err();
        assert!(matches!(err, CtnError::DeviceBusy));
        assert_eq!(arena.count(&key), 0);
    }

    #[test]
    fn devices_are_counted_separately() {
        let mut arena = LeaseArena::new();
        let a = arena.acquire_with(DeviceKey::new("/dev/a"), || Ok(1)).expect("a");
        let b = arena.acquire_with(DeviceKey::new("/dev/b"), || Ok(2)).expect("b");
        assert_eq!(arena.get(&DeviceKey::new("/dev/a")), Some(&1));
        assert_eq!(arena.release(a), Some(1));
        assert_eq!(arena.count(&DeviceKey::new("/dev/b")), 1);
        assert_eq!(arena.release(b), Some(2));
    }

    #[test]
    fn canonical_key_resolves_symlinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("disk.img");
        std::fs::write(&target, b"x").expect("write");
        let link = dir.path().join("alias");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");

        let by_target = DeviceKey::canonical(target.to_str().expect("utf8"));
        let by_link = DeviceKey::canonical(link.to_str().expect("utf8"));
        assert_eq!(by_target, by_link);
    }
}
