//! Caller context: identity, working directory, output sink, and the account
//! store that maps ids to names.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sfs_types::DirId;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
}

impl Identity {
    #[must_use]
    pub fn new(uid: u32, gid: u32, name: impl Into<String>) -> Self {
        Self {
            uid,
            gid,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn root() -> Self {
        Self::new(0, 0, "root")
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Per-client state passed into every engine call.
#[derive(Debug, Clone)]
pub struct Session {
    pub cwd: DirId,
    pub identity: Identity,
    output: String,
}

impl Session {
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            cwd: DirId::ROOT,
            identity,
            output: String::new(),
        }
    }

    /// Append one status line to the output sink.
    pub fn say(&mut self, line: impl fmt::Display) {
        use fmt::Write as _;
        let _ = writeln!(self.output, "{line}");
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Drain the output sink.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

/// Id-to-name lookups for users and groups.
pub trait AccountStore: Send + Sync + fmt::Debug {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// In-memory account store. Root (uid 0, gid 0) is always present.
#[derive(Debug)]
pub struct AccountTable {
    users: RwLock<BTreeMap<u32, String>>,
    groups: RwLock<BTreeMap<u32, String>>,
}

impl Default for AccountTable {
    fn default() -> Self {
        Self {
            users: RwLock::new(BTreeMap::from([(0, "root".to_owned())])),
            groups: RwLock::new(BTreeMap::from([(0, "root".to_owned())])),
        }
    }
}

impl AccountTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, uid: u32, name: impl Into<String>) {
        self.users.write().insert(uid, name.into());
    }

    pub fn add_group(&self, gid: u32, name: impl Into<String>) {
        self.groups.write().insert(gid, name.into());
    }
}

impl AccountStore for AccountTable {
    fn user_name(&self, uid: u32) -> Option<String> {
        self.users.read().get(&uid).cloned()
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.groups.read().get(&gid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_sink_collects_lines() {
        let mut session = Session::new(Identity::root());
        session.say("one");
        session.say(format_args!("two {}", 2));
        assert_eq!(session.output(), "one\ntwo 2\n");
        assert_eq!(session.take_output(), "one\ntwo 2\n");
        assert!(session.output().is_empty());
    }

    #[test]
    fn account_table_has_root() {
        let accounts = AccountTable::new();
        assert_eq!(accounts.user_name(0).as_deref(), Some("root"));
        assert_eq!(accounts.group_name(0).as_deref(), Some("root"));
        assert!(accounts.user_name(1000).is_none());
        accounts.add_user(1000, "alice");
        accounts.add_group(100, "staff");
        assert_eq!(accounts.user_name(1000).as_deref(), Some("alice"));
        assert_eq!(accounts.group_name(100).as_deref(), Some("staff"));
    }
}
