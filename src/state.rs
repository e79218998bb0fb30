//! Databases known for one connection.

use crate::mirror::DatabaseMirror;
use crate::types::ServerInfo;

/// The mirrors of one connection, the selected one and the last server info.
///
/// Names are unique and at most one mirror is current.
#[derive(Debug, Default, Clone)]
pub struct ServerState {
    databases: Vec<DatabaseMirror>,
    current: Option<usize>,
    server_info: Option<ServerInfo>,
}

impl ServerState {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// All known mirrors, in discovery order.
    pub fn databases(&self) -> &[DatabaseMirror] {
        &self.databases
    }

    /// Find a mirror by name.
    pub fn find(&self, name: &str) -> Option<&DatabaseMirror> {
        self.databases.iter().find(|db| db.name() == name)
    }

    /// Find a mirror by name, mutably.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut DatabaseMirror> {
        self.databases.iter_mut().find(|db| db.name() == name)
    }

    /// The selected mirror.
    pub fn current(&self) -> Option<&DatabaseMirror> {
        self.current.map(|idx| &self.databases[idx])
    }

    /// The selected mirror, mutably.
    pub fn current_mut(&mut self) -> Option<&mut DatabaseMirror> {
        self.current.map(|idx| &mut self.databases[idx])
    }

    /// Last observed server info.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub(crate) fn set_server_info(&mut self, info: ServerInfo) {
        self.server_info = Some(info);
    }

    /// Add a mirror unless one with the same name is cached. The cached one
    /// always wins so locally accumulated keys survive.
    pub(crate) fn insert_if_absent(&mut self, mut db: DatabaseMirror) -> bool {
        if self.position(db.name()).is_some() {
            return false;
        }
        db.set_current(false);
        self.databases.push(db);
        true
    }

    /// Make `db` current, adopting the cached mirror of the same name when
    /// there is one. Returns `None` when `db` is already current.
    pub(crate) fn switch_current(&mut self, db: DatabaseMirror) -> Option<&DatabaseMirror> {
        if self.current().is_some_and(|cur| cur.name() == db.name()) {
            return None;
        }
        let idx = match self.position(db.name()) {
            Some(idx) => idx,
            None => {
                self.databases.push(db);
                self.databases.len() - 1
            }
        };
        self.select(idx);
        self.current()
    }

    /// Insert `db` if unseen, then make the mirror of that name current.
    pub(crate) fn adopt_default(&mut self, db: DatabaseMirror) -> &DatabaseMirror {
        let idx = match self.position(db.name()) {
            Some(idx) => idx,
            None => {
                self.databases.push(db);
                self.databases.len() - 1
            }
        };
        self.select(idx);
        &self.databases[idx]
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.databases.iter().position(|db| db.name() == name)
    }

    fn select(&mut self, idx: usize) {
        for (i, db) in self.databases.iter_mut().enumerate() {
            db.set_current(i == idx);
        }
        self.current = Some(idx);
    }
}
