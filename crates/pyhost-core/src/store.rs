//! Persistence Store: sled-backed principal set and owner -> projects mapping.
//!
//! Two trees:
//! - `principals`: key = principal id (big-endian u64), value = empty.
//! - `projects`: key = owner id (big-endian u64), value = JSON array of [`Project`].

use std::collections::{HashMap, HashSet};
use std::path::Path;

use sled::{Db, Tree};

use crate::error::HostResult;
use crate::project::{PrincipalId, Project};

const PRINCIPALS_TREE: &str = "principals";
const PROJECTS_TREE: &str = "projects";

/// Durable store. Cheap to clone; clones share the same database.
#[derive(Clone)]
pub struct ProjectStore {
    db: Db,
    principals: Tree,
    projects: Tree,
}

impl ProjectStore {
    /// Opens or creates the database at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> HostResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway in-memory database.
    pub fn temporary() -> HostResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> HostResult<Self> {
        let principals = db.open_tree(PRINCIPALS_TREE)?;
        let projects = db.open_tree(PROJECTS_TREE)?;
        Ok(Self {
            db,
            principals,
            projects,
        })
    }

    pub fn load_principals(&self) -> HostResult<HashSet<PrincipalId>> {
        let mut out = HashSet::new();
        for entry in self.principals.iter().keys() {
            let key = entry?;
            if let Some(id) = decode_id(&key) {
                out.insert(id);
            }
        }
        Ok(out)
    }

    pub fn insert_principal(&self, id: PrincipalId) -> HostResult<()> {
        self.principals.insert(id.to_be_bytes(), Vec::<u8>::new())?;
        self.principals.flush()?;
        Ok(())
    }

    pub fn remove_principal(&self, id: PrincipalId) -> HostResult<()> {
        self.principals.remove(id.to_be_bytes())?;
        self.principals.flush()?;
        Ok(())
    }

    /// Every owner's project list. Undecodable entries are logged and skipped.
    pub fn load_projects(&self) -> HostResult<HashMap<PrincipalId, Vec<Project>>> {
        let mut out = HashMap::new();
        for entry in self.projects.iter() {
            let (key, value) = entry?;
            let Some(owner) = decode_id(&key) else {
                tracing::warn!("skipping project list with malformed owner key");
                continue;
            };
            match serde_json::from_slice::<Vec<Project>>(&value) {
                Ok(list) => {
                    out.insert(owner, list);
                }
                Err(e) => tracing::error!(owner, error = %e, "skipping unreadable project list"),
            }
        }
        Ok(out)
    }

    /// Replace the stored list for `owner`. An empty list removes the owner entry.
    pub fn save_owner_projects(&self, owner: PrincipalId, projects: &[Project]) -> HostResult<()> {
        if projects.is_empty() {
            self.projects.remove(owner.to_be_bytes())?;
        } else {
            let bytes = serde_json::to_vec(projects)?;
            self.projects.insert(owner.to_be_bytes(), bytes)?;
        }
        self.projects.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> HostResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_id(bytes: &[u8]) -> Option<PrincipalId> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectId;
    use std::path::PathBuf;

    #[test]
    fn principals_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ProjectStore::open_path(dir.path()).unwrap();
            store.insert_principal(11).unwrap();
            store.insert_principal(12).unwrap();
            store.remove_principal(11).unwrap();
        }
        let store = ProjectStore::open_path(dir.path()).unwrap();
        let loaded = store.load_principals().unwrap();
        assert_eq!(loaded, HashSet::from([12]));
    }

    #[test]
    fn project_lists_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new(
            ProjectId::new("projects/5/app"),
            5,
            500,
            vec![PathBuf::from("projects/5/app/main.py")],
        );
        {
            let store = ProjectStore::open_path(dir.path()).unwrap();
            store.save_owner_projects(5, &[project.clone()]).unwrap();
            store.flush().unwrap();
        }
        let store = ProjectStore::open_path(dir.path()).unwrap();
        let loaded = store.load_projects().unwrap();
        assert_eq!(loaded.get(&5), Some(&vec![project]));
    }

    #[test]
    fn empty_list_removes_owner() {
        let store = ProjectStore::temporary().unwrap();
        let project = Project::new(ProjectId::new("p"), 1, 1, vec![]);
        store.save_owner_projects(1, &[project]).unwrap();
        store.save_owner_projects(1, &[]).unwrap();
        assert!(store.load_projects().unwrap().is_empty());
    }
}
