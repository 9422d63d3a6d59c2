use anyhow::{Context, Result};
use redb::{ReadableTable, TableDefinition};

use super::model::{unix_now, Subscriber};

pub(crate) const SUBSCRIBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscribers");

impl super::db::Store {
    /// Create or fully overwrite the record for `address` in one write
    /// transaction. `last_seen` never moves backwards.
    pub fn upsert_subscriber(
        &self,
        address: &str,
        principal: &str,
        port: u16,
        install_dir: &str,
        post_install_command: &str,
    ) -> Result<Subscriber> {
        let now = unix_now();

        let write_txn = self.db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(SUBSCRIBERS)?;

            let previous_seen = {
                match table.get(address)? {
                    Some(v) => {
                        let (existing, _): (Subscriber, _) = bincode::serde::decode_from_slice(
                            v.value(),
                            bincode::config::standard(),
                        )
                        .context("bincode decode subscriber")?;
                        Some(existing.last_seen)
                    }
                    None => None,
                }
            };

            let record = Subscriber {
                address: address.to_owned(),
                principal: principal.to_owned(),
                port,
                install_dir: install_dir.to_owned(),
                post_install_command: post_install_command.to_owned(),
                last_seen: previous_seen.map_or(now, |seen| seen.max(now)),
            };

            let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard())
                .context("bincode encode subscriber")?;
            table.insert(address, bytes.as_slice())?;
            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    /// Snapshot of every subscriber, ordered by address.
    pub fn list_subscribers(&self) -> Result<Vec<Subscriber>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SUBSCRIBERS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let (record, _): (Subscriber, _) =
                bincode::serde::decode_from_slice(v.value(), bincode::config::standard())
                    .context("bincode decode subscriber")?;
            records.push(record);
        }
        Ok(records)
    }

    /// Delete every record older than `ttl_seconds` in one transaction and
    /// return the evicted addresses. Runs at the start of a distribution
    /// pass so an evicted subscriber is not pushed to in that pass.
    pub fn evict_stale(&self, ttl_seconds: i64) -> Result<Vec<String>> {
        let now = unix_now();

        let write_txn = self.db.begin_write()?;
        let evicted = {
            let mut table = write_txn.open_table(SUBSCRIBERS)?;

            let stale: Vec<String> = {
                let mut stale = Vec::new();
                for item in table.iter()? {
                    let (k, v) = item?;
                    let (record, _): (Subscriber, _) =
                        bincode::serde::decode_from_slice(v.value(), bincode::config::standard())
                            .context("bincode decode subscriber")?;
                    if record.is_stale(ttl_seconds, now) {
                        stale.push(k.value().to_owned());
                    }
                }
                stale
            };

            for address in &stale {
                table.remove(address.as_str())?;
            }
            stale
        };
        write_txn.commit()?;
        Ok(evicted)
    }
}
