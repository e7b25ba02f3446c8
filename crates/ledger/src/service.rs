//! Ledger handle - wires the stores, locks and event emitter together

use crate::account::AccountRepo;
use crate::audit::{AuditChain, ChainVerification};
use crate::config::LedgerConfig;
use crate::contribution::{ContributionRecord, ContributionRepo};
use crate::db;
use crate::error::LedgerResult;
use crate::idempotency::IdempotencyStore;
use crate::ingest::Ingestor;
use crate::locks::LedgerLocks;
use apgms_bus::EventEmitter;
use apgms_core::{DesignatedAccount, ObligationType};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Everything a process needs to read and write the ledger
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    locks: Arc<LedgerLocks>,
    audit: AuditChain,
    idempotency: IdempotencyStore,
    ingestor: Ingestor,
    events: EventEmitter,
    config: LedgerConfig,
}

impl Ledger {
    /// Connect to the configured database and create the schema
    pub async fn open(config: LedgerConfig, events: EventEmitter) -> LedgerResult<Self> {
        let pool = db::connect(&config).await?;
        Ok(Self::from_pool(pool, config, events))
    }

    /// Build on an existing pool whose schema is already in place
    pub fn from_pool(pool: SqlitePool, config: LedgerConfig, events: EventEmitter) -> Self {
        let locks = Arc::new(LedgerLocks::new());
        let audit = AuditChain::new(pool.clone(), locks.clone());
        let idempotency = IdempotencyStore::new(pool.clone());
        let ingestor = Ingestor::new(
            pool.clone(),
            locks.clone(),
            idempotency.clone(),
            audit.clone(),
            events.clone(),
            config.default_actor.clone(),
        );

        Self {
            pool,
            locks,
            audit,
            idempotency,
            ingestor,
            events,
            config,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn locks(&self) -> &Arc<LedgerLocks> {
        &self.locks
    }

    pub fn audit(&self) -> &AuditChain {
        &self.audit
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub async fn account(
        &self,
        tenant_id: &str,
        obligation: ObligationType,
    ) -> LedgerResult<Option<DesignatedAccount>> {
        let mut conn = self.pool.acquire().await?;
        AccountRepo::find(&mut conn, tenant_id, obligation).await
    }

    pub async fn accounts(&self, tenant_id: &str) -> LedgerResult<Vec<DesignatedAccount>> {
        let mut conn = self.pool.acquire().await?;
        AccountRepo::list_for_tenant(&mut conn, tenant_id).await
    }

    pub async fn tenants(&self) -> LedgerResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        AccountRepo::tenants(&mut conn).await
    }

    pub async fn contributions(&self, tenant_id: &str) -> LedgerResult<Vec<ContributionRecord>> {
        let mut conn = self.pool.acquire().await?;
        ContributionRepo::list_for_tenant(&mut conn, tenant_id).await
    }

    pub async fn verify_chain(&self, tenant_id: &str) -> LedgerResult<ChainVerification> {
        self.audit.verify(tenant_id).await
    }
}
