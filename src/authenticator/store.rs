//! Authenticator persistence.
//!
//! The gateway owns the real database; this crate only needs whole-record reads
//! and writes. [`InMemoryAuthenticatorStore`] backs the standalone server and tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::types::AuthenticatorRecord;

#[async_trait]
pub trait AuthenticatorStore: Send + Sync {
    async fn get(&self, id: u64) -> Result<Option<AuthenticatorRecord>>;

    async fn get_by_slug(&self, slug: &str) -> Result<Option<AuthenticatorRecord>>;

    /// Insert or replace a whole record. Readers observe either the old or the
    /// new record.
    async fn put(&self, record: AuthenticatorRecord) -> Result<()>;

    /// Reserve an id for a new record. Ids start at 1.
    async fn allocate_id(&self) -> Result<u64>;
}

/// Records keyed by id, with a slug index.
pub struct InMemoryAuthenticatorStore {
    records: RwLock<HashMap<u64, Arc<AuthenticatorRecord>>>,
    next_id: AtomicU64,
}

impl InMemoryAuthenticatorStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryAuthenticatorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthenticatorStore for InMemoryAuthenticatorStore {
    async fn get(&self, id: u64) -> Result<Option<AuthenticatorRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("Authenticator store lock poisoned"))?;
        Ok(records.get(&id).map(|r| r.as_ref().clone()))
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Option<AuthenticatorRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("Authenticator store lock poisoned"))?;
        Ok(records
            .values()
            .find(|r| r.slug == slug)
            .map(|r| r.as_ref().clone()))
    }

    async fn put(&self, record: AuthenticatorRecord) -> Result<()> {
        if record.id == 0 {
            anyhow::bail!("authenticator id must be positive");
        }

        let mut records = self
            .records
            .write()
            .map_err(|_| anyhow!("Authenticator store lock poisoned"))?;

        if records
            .values()
            .any(|r| r.slug == record.slug && r.id != record.id)
        {
            anyhow::bail!("slug '{}' already exists", record.slug);
        }

        debug!(id = record.id, slug = %record.slug, "Stored authenticator");
        self.next_id.fetch_max(record.id.saturating_add(1), Ordering::SeqCst);
        records.insert(record.id, Arc::new(record));
        Ok(())
    }

    async fn allocate_id(&self) -> Result<u64> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}
