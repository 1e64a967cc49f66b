//! The per-table, per-column ORM capability policy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use crate::error::OrmError;

/// Capability record for a single table.
#[derive(Debug, Clone, Default)]
pub struct TablePolicy {
    pub read_columns: BTreeSet<String>,
    pub insert_columns: BTreeSet<String>,
    pub update_columns: BTreeSet<String>,
    pub delete_allowed: bool,
}

/// Write-once, then read-only, mapping from table name to its capability
/// record. Defaults to empty (deny everything).
#[derive(Debug, Default)]
pub struct OrmPolicy {
    tables: RwLock<BTreeMap<String, TablePolicy>>,
    applied: std::sync::atomic::AtomicBool,
}

impl OrmPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the policy exactly once. Subsequent calls are rejected; the
    /// orchestrator is expected to call this during or immediately after
    /// `on_ready`.
    pub fn apply(&self, tables: BTreeMap<String, TablePolicy>) -> Result<(), OrmError> {
        if self
            .applied
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(OrmError::SyntaxRejected(
                "ORM policy already applied; it may only be set once".into(),
            ));
        }
        *self.tables.write().expect("policy lock poisoned") = tables;
        Ok(())
    }

    pub fn is_applied(&self) -> bool {
        self.applied.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn table(&self, table: &str) -> TablePolicy {
        self.tables
            .read()
            .expect("policy lock poisoned")
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Checks a `select`'s requested columns against the read policy.
    /// Returns the first forbidden column, if any.
    pub fn check_read(&self, table: &str, columns: &[String]) -> Result<(), OrmError> {
        let policy = self.table(table);
        for column in columns {
            if !policy.read_columns.contains(column) {
                return Err(OrmError::Forbidden(column.clone()));
            }
        }
        Ok(())
    }

    pub fn check_insert(&self, table: &str, columns: &[String]) -> Result<(), OrmError> {
        let policy = self.table(table);
        for column in columns {
            if !policy.insert_columns.contains(column) {
                return Err(OrmError::Forbidden(column.clone()));
            }
        }
        Ok(())
    }

    pub fn check_update(&self, table: &str, columns: &[String]) -> Result<(), OrmError> {
        let policy = self.table(table);
        for column in columns {
            if !policy.update_columns.contains(column) {
                return Err(OrmError::Forbidden(column.clone()));
            }
        }
        Ok(())
    }

    pub fn check_delete_allowed(&self, table: &str) -> Result<(), OrmError> {
        let policy = self.table(table);
        if !policy.delete_allowed {
            return Err(OrmError::Forbidden(format!("delete on {table}")));
        }
        Ok(())
    }
}
