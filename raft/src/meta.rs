use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::msg::NodeId;

/// Durable cluster membership.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub peers: Vec<NodeId>,
    #[serde(default, rename = "idlepeers")]
    pub idle_peers: Vec<NodeId>,
}

impl Meta {
    /// Inserts `id` keeping insertion order. Returns false if already present.
    pub fn add_peer(&mut self, id: &str) -> bool {
        insert_ordered(&mut self.peers, id)
    }

    pub fn remove_peer(&mut self, id: &str) -> bool {
        remove_ordered(&mut self.peers, id)
    }

    pub fn add_idle_peer(&mut self, id: &str) -> bool {
        insert_ordered(&mut self.idle_peers, id)
    }

    pub fn remove_idle_peer(&mut self, id: &str) -> bool {
        remove_ordered(&mut self.idle_peers, id)
    }
}

fn insert_ordered(set: &mut Vec<NodeId>, id: &str) -> bool {
    if set.iter().any(|p| p == id) {
        return false;
    }
    set.push(id.to_string());
    true
}

fn remove_ordered(set: &mut Vec<NodeId>, id: &str) -> bool {
    let len = set.len();
    set.retain(|p| p != id);
    set.len() != len
}

/// Stores [`Meta`] as one JSON file, replaced wholesale on every write.
#[derive(Clone, Debug)]
pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    /// Creates the parent directory if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file means no prior membership.
    pub fn read(&self) -> Result<Meta> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Meta::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes to a sibling temp file and renames it over the old one, so a
    /// crash leaves either the previous or the new membership on disk.
    pub fn write(&self, meta: &Meta) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(meta)?;
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
