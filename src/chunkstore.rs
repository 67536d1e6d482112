//! Content-addressed storage of chunk contents.

use crate::db::{self, Database, CF_CHUNKS};
use crate::error::{Error, Result};
use crate::model::{validate_project, Chunk};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub trait ChunkStore: Send + Sync {
    /// The chunk stored under `object_id`; `NotFound` if there is none.
    fn get(&self, project: &str, object_id: &str) -> Result<Chunk>;
}

#[derive(Debug, Clone)]
pub struct PersistentChunkStore {
    db: Arc<Database>,
}

impl PersistentChunkStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Stores `chunk` and returns its object ID, the hex SHA-256 prefix of
    /// its encoding. Storing identical content twice is a no-op.
    pub fn put(&self, project: &str, chunk: &Chunk) -> Result<String> {
        validate_project(project)?;
        let bytes = bincode::serialize(chunk)?;
        let object_id = hex::encode(&Sha256::digest(&bytes)[..16]);
        let cf = self.db.cf(CF_CHUNKS)?;
        self.db
            .raw()
            .put_cf(cf, db::project_key(project, object_id.as_bytes()), bytes)?;
        Ok(object_id)
    }
}

impl ChunkStore for PersistentChunkStore {
    fn get(&self, project: &str, object_id: &str) -> Result<Chunk> {
        validate_project(project)?;
        let cf = self.db.cf(CF_CHUNKS)?;
        let bytes = self
            .db
            .raw()
            .get_cf(cf, db::project_key(project, object_id.as_bytes()))?
            .ok_or_else(|| {
                Error::not_found(format!("chunk object {object_id} in project {project}"))
            })?;
        Ok(bincode::deserialize(&bytes)?)
    }
}
