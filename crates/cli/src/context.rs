//! Application context - wires everything together

use apgms_bus::{EventBus, EventEmitter, EventLogSubscriber};
use apgms_ledger::{Ledger, LedgerConfig};
use apgms_recon::{BankingBalanceReader, LedgerMirrorReader, ReconciliationJob, SnapshotBalanceReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Resolve configuration: file (or defaults), then `APGMS_*` variables, then flags
pub fn load_config(path: Option<&Path>, database_url: Option<&str>) -> anyhow::Result<LedgerConfig> {
    let mut config = match path {
        Some(path) => LedgerConfig::from_file(path)?,
        None => LedgerConfig::default(),
    };
    config.apply_env()?;

    if let Some(url) = database_url {
        config.database_url = url.to_string();
    }
    Ok(config)
}

/// Application context - ledger, bus and optional event log
pub struct AppContext {
    pub ledger: Ledger,
    pub bus: Arc<EventBus>,
    event_log: Option<JoinHandle<()>>,
}

impl AppContext {
    /// Open the ledger and start the event log subscriber when `events.log_dir` is set
    pub async fn new(config: LedgerConfig) -> anyhow::Result<Self> {
        let bus = Arc::new(EventBus::new(config.events.channel_capacity));

        let event_log = match &config.events.log_dir {
            Some(dir) => {
                let subscriber = EventLogSubscriber::open(dir)?;
                Some(bus.spawn_subscriber(Arc::new(subscriber)))
            }
            None => None,
        };

        let emitter = EventEmitter::new(bus.clone(), config.events.clone());
        let ledger = Ledger::open(config, emitter).await?;

        Ok(Self {
            ledger,
            bus,
            event_log,
        })
    }

    /// Reconciliation job against a bank snapshot, or the ledger mirror without one
    pub async fn reconciliation_job(&self, bank_snapshot: Option<&Path>) -> anyhow::Result<Arc<ReconciliationJob>> {
        let reader: Arc<dyn BankingBalanceReader> = match bank_snapshot {
            Some(path) => Arc::new(SnapshotBalanceReader::from_file(path)?),
            None => {
                tracing::warn!("No bank snapshot given, reconciling against the ledger itself");
                Arc::new(LedgerMirrorReader)
            }
        };

        let job = ReconciliationJob::new(
            self.ledger.clone(),
            reader,
            self.ledger.config().reconciliation.clone(),
        )
        .await?;
        Ok(Arc::new(job))
    }

    /// Close the bus and let the event log drain
    pub async fn shutdown(self) {
        let Self {
            ledger,
            bus,
            event_log,
        } = self;
        drop(ledger);
        drop(bus);

        if let Some(handle) = event_log {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                tracing::warn!("Event log did not drain before shutdown");
            }
        }
    }
}
