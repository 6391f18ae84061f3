//! Superblock feature masks and session open flags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Names of the set bits of `bits`, in table order.
#[must_use]
pub fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Format a bitmask as `NAME|NAME|0xUNKNOWN`, or `(none)` when zero.
fn format_flags(f: &mut fmt::Formatter<'_>, bits: u32, known: &[(u32, &'static str)]) -> fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}

macro_rules! flag_set_methods {
    ($ty:ident, $raw:ty) => {
        impl $ty {
            pub const NONE: Self = Self(0);

            #[must_use]
            pub fn bits(self) -> $raw {
                self.0
            }

            /// True when every bit of `flag` is set.
            #[must_use]
            pub fn contains(self, flag: Self) -> bool {
                flag.0 != 0 && (self.0 & flag.0) == flag.0
            }

            /// True when any bit of `flag` is set.
            #[must_use]
            pub fn intersects(self, flag: Self) -> bool {
                (self.0 & flag.0) != 0
            }

            pub fn insert(&mut self, flag: Self) {
                self.0 |= flag.0;
            }

            pub fn remove(&mut self, flag: Self) {
                self.0 &= !flag.0;
            }

            #[must_use]
            pub fn with(self, flag: Self) -> Self {
                Self(self.0 | flag.0)
            }

            #[must_use]
            pub fn without(self, flag: Self) -> Self {
                Self(self.0 & !flag.0)
            }

            #[must_use]
            pub fn describe(self) -> Vec<&'static str> {
                describe_flags(u32::from(self.0), Self::KNOWN)
            }
        }

        impl std::ops::BitOr for $ty {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                format_flags(f, u32::from(self.0), Self::KNOWN)
            }
        }
    };
}

/// Compatible feature flags (`s_feature_compat`); unknown bits are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompatFeatures(pub u32);

impl CompatFeatures {
    pub const BACKUP_SB: Self = Self(0x0001);
    pub const JBD2_SB: Self = Self(0x0002);

    const KNOWN: &'static [(u32, &'static str)] = &[(0x0001, "BACKUP_SB"), (0x0002, "JBD2_SB")];
}

flag_set_methods!(CompatFeatures, u32);

/// Incompatible feature flags (`s_feature_incompat`).
///
/// Besides format capabilities this mask carries the state bits maintenance
/// tools use to fence each other: a heartbeat-only device, an interrupted
/// resize, and an interrupted feature change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IncompatFeatures(pub u32);

impl IncompatFeatures {
    pub const HEARTBEAT_DEV: Self = Self(0x0002);
    pub const RESIZE_INPROG: Self = Self(0x0004);
    pub const LOCAL_MOUNT: Self = Self(0x0008);
    pub const SPARSE_ALLOC: Self = Self(0x0010);
    pub const TUNEFS_INPROG: Self = Self(0x0020);
    pub const INLINE_DATA: Self = Self(0x0040);

    const KNOWN: &'static [(u32, &'static str)] = &[
        (0x0002, "HEARTBEAT_DEV"),
        (0x0004, "RESIZE_INPROG"),
        (0x0008, "LOCAL_MOUNT"),
        (0x0010, "SPARSE_ALLOC"),
        (0x0020, "TUNEFS_INPROG"),
        (0x0040, "INLINE_DATA"),
    ];
}

flag_set_methods!(IncompatFeatures, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoCompatFeatures(pub u32);

impl RoCompatFeatures {
    pub const UNWRITTEN: Self = Self(0x0001);

    const KNOWN: &'static [(u32, &'static str)] = &[(0x0001, "UNWRITTEN")];
}

flag_set_methods!(RoCompatFeatures, u32);

/// `s_tunefs_flag`: which feature change was underway when `TUNEFS_INPROG`
/// was set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunefsFlags(pub u16);

impl TunefsFlags {
    pub const REMOVE_SLOT: Self = Self(0x0001);
    pub const DIR_TRAILER: Self = Self(0x0002);
    pub const INLINE_EXPAND: Self = Self(0x0004);

    const KNOWN: &'static [(u32, &'static str)] = &[
        (0x0001, "REMOVE_SLOT"),
        (0x0002, "DIR_TRAILER"),
        (0x0004, "INLINE_EXPAND"),
    ];
}

flag_set_methods!(TunefsFlags, u16);

/// Requirements an operation places on the session that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open read-only; no locking and no validation.
    pub const RO: Self = Self(0x0000);
    /// Open read-write; locks the device and validates journals.
    pub const RW: Self = Self(0x0001);
    /// The operation allocates space; validate the global bitmap first.
    pub const ALLOCATION: Self = Self(0x0002);
    /// The operation can be delegated to a live mount.
    pub const ONLINE: Self = Self(0x0004);
    /// The operation tolerates (and intends to fix) a cluster stack mismatch.
    pub const NOCLUSTER: Self = Self(0x0008);

    const KNOWN: &'static [(u32, &'static str)] = &[
        (0x0001, "RW"),
        (0x0002, "ALLOCATION"),
        (0x0004, "ONLINE"),
        (0x0008, "NOCLUSTER"),
    ];
}

flag_set_methods!(OpenFlags, u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incompat_display_lists_known_then_unknown_bits() {
        let bits = IncompatFeatures::LOCAL_MOUNT | IncompatFeatures::INLINE_DATA;
        assert_eq!(bits.to_string(), "LOCAL_MOUNT|INLINE_DATA");

        let with_unknown = IncompatFeatures(0x0040 | 0x8000_0000);
        assert_eq!(with_unknown.to_string(), "INLINE_DATA|0x80000000");
        assert_eq!(IncompatFeatures::NONE.to_string(), "(none)");
    }

    #[test]
    fn insert_and_remove_touch_only_named_bits() {
        let mut bits = IncompatFeatures::SPARSE_ALLOC;
        bits.insert(IncompatFeatures::TUNEFS_INPROG);
        assert!(bits.contains(IncompatFeatures::TUNEFS_INPROG));
        bits.remove(IncompatFeatures::TUNEFS_INPROG);
        assert_eq!(bits, IncompatFeatures::SPARSE_ALLOC);
    }

    #[test]
    fn open_flags_strip_mode_bits() {
        let declared = OpenFlags::RW | OpenFlags::ALLOCATION | OpenFlags::ONLINE;
        let stripped = declared.without(OpenFlags::ONLINE | OpenFlags::NOCLUSTER);
        assert!(stripped.contains(OpenFlags::RW));
        assert!(stripped.contains(OpenFlags::ALLOCATION));
        assert!(!stripped.contains(OpenFlags::ONLINE));
        assert_eq!(declared.describe(), vec!["RW", "ALLOCATION", "ONLINE"]);
    }

    #[test]
    fn contains_on_empty_flag_is_false() {
        assert!(!OpenFlags::RW.contains(OpenFlags::RO));
    }
}
