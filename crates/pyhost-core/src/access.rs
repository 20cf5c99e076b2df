//! Access Control: admins plus the persisted allow-list.

use std::collections::{BTreeSet, HashSet};
use std::sync::RwLock;

use crate::error::HostResult;
use crate::project::PrincipalId;
use crate::store::ProjectStore;

pub struct AccessControl {
    admins: HashSet<PrincipalId>,
    allowed: RwLock<HashSet<PrincipalId>>,
    store: ProjectStore,
}

impl AccessControl {
    /// Loads the persisted set. A store that cannot be read leaves only the admins allowed.
    pub fn load(admins: impl IntoIterator<Item = PrincipalId>, store: ProjectStore) -> Self {
        let allowed = store.load_principals().unwrap_or_else(|e| {
            tracing::error!(error = %e, "error loading allowed users");
            HashSet::new()
        });
        tracing::info!(count = allowed.len(), "loaded allowed users");
        Self {
            admins: admins.into_iter().collect(),
            allowed: RwLock::new(allowed),
            store,
        }
    }

    pub fn is_admin(&self, id: PrincipalId) -> bool {
        self.admins.contains(&id)
    }

    pub fn is_allowed(&self, id: PrincipalId) -> bool {
        self.is_admin(id) || self.allowed.read().map(|s| s.contains(&id)).unwrap_or(false)
    }

    /// Idempotent.
    pub fn add(&self, id: PrincipalId) -> HostResult<()> {
        self.store.insert_principal(id)?;
        if let Ok(mut set) = self.allowed.write() {
            set.insert(id);
        }
        Ok(())
    }

    /// Returns `false` for admins and unknown ids; nothing changes in that case.
    pub fn remove(&self, id: PrincipalId) -> HostResult<bool> {
        if self.is_admin(id) {
            return Ok(false);
        }
        let present = self.allowed.read().map(|s| s.contains(&id)).unwrap_or(false);
        if !present {
            return Ok(false);
        }
        self.store.remove_principal(id)?;
        if let Ok(mut set) = self.allowed.write() {
            set.remove(&id);
        }
        Ok(true)
    }

    /// Every principal, sorted, paired with its admin flag.
    pub fn list(&self) -> Vec<(PrincipalId, bool)> {
        let mut ids: BTreeSet<PrincipalId> = self.admins.iter().copied().collect();
        if let Ok(set) = self.allowed.read() {
            ids.extend(set.iter().copied());
        }
        ids.into_iter().map(|id| (id, self.is_admin(id))).collect()
    }
}
