//! Per-key async locks
//!
//! Contributions for one account are serialized; different accounts proceed
//! in parallel. Appends to one tenant's audit chain are serialized the same way.
//! Lock order is always account, then chain.

use apgms_core::ObligationType;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A sharded mutex: one async lock per key, created on first use
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys that have ever been locked
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Key of one designated account
pub type AccountKey = (String, ObligationType);

/// The two critical sections of the ledger write path
#[derive(Default)]
pub struct LedgerLocks {
    accounts: KeyedLocks<AccountKey>,
    chains: KeyedLocks<String>,
}

impl LedgerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-writer section for one designated account
    pub async fn account(&self, tenant_id: &str, obligation: ObligationType) -> OwnedMutexGuard<()> {
        self.accounts.lock(&(tenant_id.to_string(), obligation)).await
    }

    /// Single-writer section for one tenant's audit chain
    pub async fn chain(&self, tenant_id: &str) -> OwnedMutexGuard<()> {
        self.chains.lock(&tenant_id.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let guard = locks.lock(&"a".to_string()).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&"a".to_string()).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = LedgerLocks::new();
        let _paygw = locks.account("org-1", ObligationType::Paygw).await;

        let gst = tokio::time::timeout(
            Duration::from_millis(100),
            locks.account("org-1", ObligationType::Gst),
        )
        .await;
        assert!(gst.is_ok());

        let other_tenant = tokio::time::timeout(Duration::from_millis(100), locks.chain("org-2")).await;
        assert!(other_tenant.is_ok());
    }
}
