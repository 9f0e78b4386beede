//! Durable ledger backed by a single redb file.
//!
//! One table keyed by the deposit id string; values are bincode-encoded
//! [`Deposit`] records. Every update runs in one write transaction, so the
//! version check and the write commit together.

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::ledger::{
    validate_transition, Deposit, DepositId, LedgerError, LedgerStore, NewDeposit,
};

const DEPOSITS: TableDefinition<&str, &[u8]> = TableDefinition::new("deposits");

fn storage_err(e: impl Into<redb::Error>) -> LedgerError {
    LedgerError::Persistence(e.into().to_string())
}

fn encode(deposit: &Deposit) -> Result<Vec<u8>, LedgerError> {
    bincode::serialize(deposit).map_err(|e| LedgerError::Persistence(format!("encode: {e}")))
}

fn decode(bytes: &[u8]) -> Result<Deposit, LedgerError> {
    bincode::deserialize(bytes).map_err(|e| LedgerError::Persistence(format!("decode: {e}")))
}

pub struct RedbLedger {
    db: Database,
}

impl RedbLedger {
    /// Opens (or creates) the ledger file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(storage_err)?;

        // Make sure the table exists so read transactions never see it missing.
        let txn = db.begin_write().map_err(storage_err)?;
        txn.open_table(DEPOSITS).map_err(storage_err)?;
        txn.commit().map_err(storage_err)?;

        tracing::info!(path = %path.display(), "Ledger: opened redb store");
        Ok(Self { db })
    }

    fn scan(&self, filter: impl Fn(&Deposit) -> bool) -> Result<Vec<Deposit>, LedgerError> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(DEPOSITS).map_err(storage_err)?;

        let mut out = Vec::new();
        for item in table.iter().map_err(storage_err)? {
            let (_, value) = item.map_err(storage_err)?;
            let deposit = decode(value.value())?;
            if filter(&deposit) {
                out.push(deposit);
            }
        }
        out.sort_by_key(|d| d.id);
        Ok(out)
    }
}

impl LedgerStore for RedbLedger {
    fn create(&self, deposit: NewDeposit) -> Result<Deposit, LedgerError> {
        let record = Deposit::open(DepositId::generate(), deposit);
        let key = record.id.to_string();
        let bytes = encode(&record)?;

        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(DEPOSITS).map_err(storage_err)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        Ok(record)
    }

    fn find_by_id(&self, id: &DepositId) -> Result<Option<Deposit>, LedgerError> {
        let key = id.to_string();
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(DEPOSITS).map_err(storage_err)?;
        let found = table.get(key.as_str()).map_err(storage_err)?;
        found.map(|guard| decode(guard.value())).transpose()
    }

    fn find_active(&self) -> Result<Vec<Deposit>, LedgerError> {
        self.scan(|d| !d.withdrawn)
    }

    fn find_by_owner(&self, owner: &str) -> Result<Vec<Deposit>, LedgerError> {
        self.scan(|d| d.owner == owner)
    }

    fn update(&self, next: &Deposit) -> Result<Deposit, LedgerError> {
        let key = next.id.to_string();
        let txn = self.db.begin_write().map_err(storage_err)?;
        let stored = {
            let mut table = txn.open_table(DEPOSITS).map_err(storage_err)?;
            let current = match table.get(key.as_str()).map_err(storage_err)? {
                Some(guard) => decode(guard.value())?,
                None => return Err(LedgerError::NotFound(next.id)),
            };
            // Returning early drops `txn` uncommitted, which aborts it.
            validate_transition(&current, next)?;

            let mut stored = next.clone();
            stored.version = current.version + 1;
            let bytes = encode(&stored)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(storage_err)?;
            stored
        };
        txn.commit().map_err(storage_err)?;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::ledger::tests::new_deposit;
    use crate::accrual::ledger::TransitionViolation;
    use chrono::{DateTime, Utc};
    use testresult::TestResult;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap()
    }

    #[test]
    fn test_create_and_reload() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ledger.redb");

        let id = {
            let ledger = RedbLedger::open(&path)?;
            let d = ledger.create(new_deposit("0xseller", 1_000_000_000, start()))?;
            ledger.update(&d.with_accrued(8_219_178))?;
            d.id
        };

        let reopened = RedbLedger::open(&path)?;
        let d = reopened.find_by_id(&id)?.ok_or("deposit missing after reopen")?;
        assert_eq!(d.principal, 1_000_000_000);
        assert_eq!(d.accumulated_yield, 8_219_178);
        assert_eq!(d.version, 1);
        Ok(())
    }

    #[test]
    fn test_cas_and_terminal_rules() -> TestResult {
        let dir = tempfile::tempdir()?;
        let ledger = RedbLedger::open(dir.path().join("ledger.redb"))?;
        let d = ledger.create(new_deposit("0xseller", 1_000, start()))?;

        ledger.update(&d.with_accrued(3))?;
        assert!(matches!(
            ledger.update(&d.with_accrued(4)),
            Err(LedgerError::VersionConflict { found: 1, .. })
        ));

        let current = ledger.find_by_id(&d.id)?.ok_or("missing")?;
        let frozen = ledger.update(&current.finalized(5, start()))?;
        assert!(matches!(
            ledger.update(&frozen.with_accrued(6)),
            Err(LedgerError::InvalidStateTransition {
                violation: TransitionViolation::Terminal,
                ..
            })
        ));
        assert_eq!(ledger.find_by_id(&d.id)?, Some(frozen));
        Ok(())
    }

    #[test]
    fn test_active_and_owner_queries() -> TestResult {
        let dir = tempfile::tempdir()?;
        let ledger = RedbLedger::open(dir.path().join("ledger.redb"))?;
        let a = ledger.create(new_deposit("0xa", 1, start()))?;
        let b = ledger.create(new_deposit("0xb", 2, start()))?;
        ledger.create(new_deposit("0xa", 3, start()))?;
        ledger.update(&a.finalized(0, start()))?;

        let active: Vec<_> = ledger.find_active()?.into_iter().map(|d| d.id).collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&b.id));
        assert!(!active.contains(&a.id));

        assert_eq!(ledger.find_by_owner("0xa")?.len(), 2);
        assert!(ledger.find_by_owner("0xc")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_update_missing_record() -> TestResult {
        let dir = tempfile::tempdir()?;
        let ledger = RedbLedger::open(dir.path().join("ledger.redb"))?;
        let other = RedbLedger::open(dir.path().join("other.redb"))?;
        let d = other.create(new_deposit("0xa", 1, start()))?;
        assert_eq!(ledger.update(&d), Err(LedgerError::NotFound(d.id)));
        Ok(())
    }
}
