//! Index key derivation.
//!
//! A key is the first four bytes, big-endian, of the BLAKE3 digest of the
//! qualified name `"{owner}:{parent}:{F|D}:{name}"`.

use sfs_btree::Key;
use sfs_types::{DirId, EntryKind};

#[must_use]
pub fn qualified_name(owner: u32, parent: DirId, kind: EntryKind, name: &str) -> String {
    format!("{owner}:{}:{}:{name}", parent.0, kind.tag())
}

#[must_use]
pub fn index_key(owner: u32, parent: DirId, kind: EntryKind, name: &str) -> Key {
    let digest = blake3::hash(qualified_name(owner, parent, kind, name).as_bytes());
    let bytes = digest.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_format() {
        assert_eq!(
            qualified_name(1000, DirId(4), EntryKind::Directory, "docs"),
            "1000:4:D:docs"
        );
    }

    #[test]
    fn key_is_stable_and_namespaced() {
        let a = index_key(0, DirId::ROOT, EntryKind::File, "a.txt");
        assert_eq!(a, index_key(0, DirId::ROOT, EntryKind::File, "a.txt"));
        assert_ne!(a, index_key(0, DirId::ROOT, EntryKind::Directory, "a.txt"));
        assert_ne!(a, index_key(1, DirId::ROOT, EntryKind::File, "a.txt"));
        assert_ne!(a, index_key(0, DirId(1), EntryKind::File, "a.txt"));
    }

    #[test]
    fn key_is_digest_prefix() {
        let digest = blake3::hash(b"0:0:F:x");
        let expected = u32::from_be_bytes(digest.as_bytes()[..4].try_into().unwrap());
        assert_eq!(index_key(0, DirId::ROOT, EntryKind::File, "x"), expected);
    }
}
