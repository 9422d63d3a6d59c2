use anyhow::{Context, Result};
use redb::TableDefinition;

use super::model::TrustedHost;

pub(crate) const TRUSTED_HOSTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("trusted_hosts");

impl super::db::Store {
    /// Pinned host identity for `address`, if one was ever recorded.
    pub fn trusted_host(&self, address: &str) -> Result<Option<TrustedHost>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRUSTED_HOSTS)?;

        match table.get(address)? {
            Some(v) => {
                let (entry, _): (TrustedHost, _) =
                    bincode::serde::decode_from_slice(v.value(), bincode::config::standard())
                        .context("bincode decode trusted host")?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Pin a host identity. Callers only invoke this on first contact; a
    /// mismatch against an existing pin must never reach this method.
    pub fn record_trusted_host(&self, entry: &TrustedHost) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .context("bincode encode trusted host")?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRUSTED_HOSTS)?;
            table.insert(entry.address.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
