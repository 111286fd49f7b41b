//! Permission and attribute evaluation.

use crate::entry::Entry;
use crate::session::Identity;
use sfs_error::{Result, SfsError};
use sfs_types::{Access, Attributes, GROUP_SHIFT, OTHER_SHIFT, OWNER_SHIFT};

/// Test `requested` against the triplet that applies to `(uid, gid)`:
/// owner first, then group, then other.
#[must_use]
pub fn has_permission(entry: &Entry, uid: u32, gid: u32, requested: Access) -> bool {
    let shift = if uid == entry.owner {
        OWNER_SHIFT
    } else if gid == entry.group {
        GROUP_SHIFT
    } else {
        OTHER_SHIFT
    };
    let triplet = (entry.mode >> shift) & 0o7;
    triplet & requested.bits() == requested.bits()
}

/// Derived flag: the owner cannot write.
#[must_use]
pub fn is_read_only(entry: &Entry) -> bool {
    (entry.mode >> OWNER_SHIFT) & Access::WRITE.bits() == 0
}

/// `HSAR`-style string, `-` for each clear flag.
#[must_use]
pub fn attribute_string(entry: &Entry) -> String {
    let flag = |on: bool, c: char| if on { c } else { '-' };
    [
        flag(entry.attributes.contains(Attributes::HIDDEN), 'H'),
        flag(entry.attributes.contains(Attributes::SYSTEM), 'S'),
        flag(entry.attributes.contains(Attributes::ARCHIVE), 'A'),
        flag(is_read_only(entry), 'R'),
    ]
    .iter()
    .collect()
}

/// Enforce `requested`; uid 0 passes.
pub fn require(entry: &Entry, identity: &Identity, requested: Access) -> Result<()> {
    if identity.is_root() || has_permission(entry, identity.uid, identity.gid, requested) {
        Ok(())
    } else {
        Err(SfsError::PermissionDenied)
    }
}

/// Refuse destructive operations on system entries, even for root.
pub fn require_not_system(entry: &Entry) -> Result<()> {
    if entry.attributes.contains(Attributes::SYSTEM) {
        return Err(SfsError::SystemProtected(entry.name.clone()));
    }
    Ok(())
}

/// Only root or the owner may change mode, owner or group.
pub fn require_owner(entry: &Entry, identity: &Identity) -> Result<()> {
    if identity.is_root() || identity.uid == entry.owner {
        Ok(())
    } else {
        Err(SfsError::PermissionDenied)
    }
}
