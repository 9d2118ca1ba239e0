use sled::Db;
use std::path::Path;

use crate::error::Result;

const CREDENTIAL_TREE: &str = "credential";
const PROFILE_TREE: &str = "profiles";

/// Durable client-local key/value store (Sled).
///
/// Holds exactly two kinds of state: the bearer credential and the
/// per-subject profile blobs. Nothing here is ever sent to the server.
#[derive(Clone)] // Sled handles are cheap to clone and share one database
pub struct LocalStore {
    db: Db,
    credential_tree: sled::Tree,
    profile_tree: sled::Tree,
}

impl LocalStore {
    /// Open or create the store under `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway store, removed when dropped. Used by tests and one-off runs.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let credential_tree = db.open_tree(CREDENTIAL_TREE)?;
        let profile_tree = db.open_tree(PROFILE_TREE)?;
        Ok(Self {
            db,
            credential_tree,
            profile_tree,
        })
    }

    pub fn get_credential(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.credential_tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Credential writes are flushed before returning.
    pub fn put_credential(&self, key: &str, value: &[u8]) -> Result<()> {
        self.credential_tree.insert(key.as_bytes(), value)?;
        self.credential_tree.flush()?;
        Ok(())
    }

    pub fn remove_credential(&self, key: &str) -> Result<()> {
        self.credential_tree.remove(key.as_bytes())?;
        self.credential_tree.flush()?;
        Ok(())
    }

    pub fn get_profile(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.profile_tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn put_profile(&self, key: &str, value: &[u8]) -> Result<()> {
        self.profile_tree.insert(key.as_bytes(), value)?;
        self.profile_tree.flush()?;
        Ok(())
    }

    /// Keys currently present in the profile tree (diagnostics and tests).
    pub fn profile_keys(&self) -> Result<Vec<String>> {
        let mut keys = vec![];
        for item in self.profile_tree.iter() {
            let (k, _) = item?;
            keys.push(String::from_utf8_lossy(&k).into_owned());
        }
        Ok(keys)
    }

    /// Flush everything to disk (used on shutdown of the CLI).
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
