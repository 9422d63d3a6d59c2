use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::Database;

use super::subscribers::SUBSCRIBERS;
use super::trust::TRUSTED_HOSTS;

/// Handle to the registry database. Cheap to clone; all writes go through
/// single redb write transactions, which serializes concurrent upserts.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the registry database and ensure its tables exist.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open registry database")?;

        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(SUBSCRIBERS)?;
            write_txn.open_table(TRUSTED_HOSTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}
