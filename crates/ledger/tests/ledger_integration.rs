//! Integration tests for the designated account ledger
//!
//! Every test runs against a real SQLite file in a temp directory.

use apgms_bus::{EventBus, EventEmitter, EventPriority};
use apgms_core::{ContributionSource, MinorUnits, ObligationType};
use apgms_ledger::{
    actions, ContributionRequest, Ledger, LedgerConfig, LedgerError,
};
use sqlx::Row;
use std::sync::Arc;
use tempfile::TempDir;

async fn setup(dir: &TempDir) -> (Ledger, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new(256));
    let config = LedgerConfig::for_sqlite_file(dir.path().join("ledger.db"));
    let emitter = EventEmitter::new(bus.clone(), config.events.clone());
    let ledger = Ledger::open(config, emitter).await.unwrap();
    (ledger, bus)
}

fn units(value: i64) -> MinorUnits {
    MinorUnits::new(value).unwrap()
}

fn payroll(tenant: &str, amount: i64, key: &str) -> ContributionRequest {
    ContributionRequest::new(tenant, ObligationType::Paygw, amount, ContributionSource::PayrollSystem, key)
}

async fn balance(ledger: &Ledger, tenant: &str, obligation: ObligationType) -> i64 {
    ledger
        .account(tenant, obligation)
        .await
        .unwrap()
        .map(|a| a.balance_minor_units.value())
        .unwrap_or(0)
}

async fn allow_tampering(ledger: &Ledger) {
    sqlx::query("DROP TRIGGER audit_log_no_update").execute(ledger.pool()).await.unwrap();
    sqlx::query("DROP TRIGGER audit_log_no_delete").execute(ledger.pool()).await.unwrap();
}

/// Test: the same request N times applies once and answers identically
#[tokio::test]
async fn test_repeated_submission_applies_once() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    let mut payloads = Vec::new();
    for i in 0..5 {
        let receipt = ledger.ingestor().ingest(payroll("org-1", 12_500, "payrun-42")).await.unwrap();
        assert_eq!(receipt.replayed, i > 0);
        assert_eq!(receipt.status_code, 201);
        payloads.push(receipt.payload);
    }

    assert!(payloads.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 12_500);
    assert_eq!(ledger.contributions("org-1").await.unwrap().len(), 1);
}

/// Test: same key with a different payload is a conflict and changes nothing
#[tokio::test]
async fn test_key_reuse_with_other_payload_conflicts() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    ledger.ingestor().ingest(payroll("org-1", 10_000, "k-1")).await.unwrap();
    let result = ledger.ingestor().ingest(payroll("org-1", 99_999, "k-1")).await;

    match result {
        Err(e @ LedgerError::IdempotencyKeyConflict { .. }) => {
            assert_eq!(e.code(), "idempotency_key_conflict");
            assert!(!e.is_retryable());
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 10_000);
    assert_eq!(ledger.contributions("org-1").await.unwrap().len(), 1);
}

/// Test: the same key in another tenant is an unrelated operation
#[tokio::test]
async fn test_keys_are_scoped_per_tenant() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    ledger.ingestor().ingest(payroll("org-1", 100, "shared")).await.unwrap();
    let other = ledger.ingestor().ingest(payroll("org-2", 200, "shared")).await.unwrap();

    assert!(!other.replayed);
    assert_eq!(balance(&ledger, "org-2", ObligationType::Paygw).await, 200);
}

/// Test: non-positive amounts are rejected before any store is touched
#[tokio::test]
async fn test_invalid_amount_rejected() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    for amount in [0, -1, -50_000] {
        let result = ledger.ingestor().ingest(payroll("org-1", amount, "k-bad")).await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount(a)) if a == amount));
    }

    assert!(ledger.tenants().await.unwrap().is_empty());
    assert!(ledger.idempotency().lookup("org-1", "k-bad").await.unwrap().is_none());
}

/// Test: a blank key is a client error
#[tokio::test]
async fn test_missing_key_rejected() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    let result = ledger.ingestor().ingest(payroll("org-1", 100, "")).await;
    assert!(matches!(result, Err(LedgerError::MissingIdempotencyKey)));
}

/// Test: 9999 -> 10000 unlocks, and raising the requirement past the balance locks again
#[tokio::test]
async fn test_lock_boundary() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;
    let required = units(10_000);

    let first = ledger
        .ingestor()
        .ingest(payroll("org-1", 9_999, "k-1").with_required(required))
        .await
        .unwrap();
    assert!(first.outcome.account.locked);
    assert!(first.outcome.lock_changed);

    let second = ledger
        .ingestor()
        .ingest(payroll("org-1", 1, "k-2").with_required(required))
        .await
        .unwrap();
    assert_eq!(second.outcome.account.balance_minor_units.value(), 10_000);
    assert!(!second.outcome.account.locked);
    assert!(second.outcome.lock_changed);

    let relocked = ledger
        .ingestor()
        .recompute_coverage("org-1", ObligationType::Paygw, units(10_001), Some("ops"))
        .await
        .unwrap();
    assert!(relocked.account.locked);
    assert!(relocked.decision.changed);

    let unchanged = ledger
        .ingestor()
        .recompute_coverage("org-1", ObligationType::Paygw, units(10_001), None)
        .await
        .unwrap();
    assert!(!unchanged.decision.changed);
    assert!(unchanged.audit_entry.is_none());

    let actions: Vec<String> = ledger
        .audit()
        .entries("org-1")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            actions::CONTRIBUTION_APPLIED,
            actions::ACCOUNT_LOCKED,
            actions::CONTRIBUTION_APPLIED,
            actions::ACCOUNT_UNLOCKED,
            actions::ACCOUNT_LOCKED,
        ]
    );
}

/// Test: deposits are accepted while the account is locked
#[tokio::test]
async fn test_locked_account_accepts_deposits() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;
    let required = units(1_000_000);

    for i in 0..3 {
        let receipt = ledger
            .ingestor()
            .ingest(payroll("org-1", 100, &format!("k-{}", i)).with_required(required))
            .await
            .unwrap();
        assert!(receipt.outcome.account.locked);
        assert_eq!(receipt.outcome.lock_changed, i == 0);
    }
    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 300);
}

/// Test: contribution and lock events reach subscribers after commit
#[tokio::test]
async fn test_events_published() {
    let dir = TempDir::new().unwrap();
    let (ledger, bus) = setup(&dir).await;
    let mut receiver = bus.subscribe();

    let receipt = ledger
        .ingestor()
        .ingest(payroll("org-1", 500, "k-1").with_required(units(1_000)))
        .await
        .unwrap();

    let applied = receiver.recv().await.unwrap();
    assert_eq!(applied.subject, "apgms.dev.designated_account.contribution_applied");
    assert_eq!(applied.envelope.key, receipt.outcome.contribution.id);
    assert_eq!(applied.envelope.payload["amountMinorUnits"], 500);

    let lock = receiver.recv().await.unwrap();
    assert_eq!(lock.subject, "apgms.dev.designated_account.lock_changed");
    assert_eq!(lock.envelope.priority, EventPriority::High);
    assert_eq!(lock.envelope.payload["locked"], true);

    // A replay publishes nothing.
    ledger.ingestor().ingest(payroll("org-1", 500, "k-1")).await.unwrap();
    assert!(receiver.try_recv().is_err());
}

/// Test: 50 concurrent contributions to one account lose no update
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_contributions_same_account() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    let mut handles = Vec::new();
    for i in 1..=50i64 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .ingestor()
                .ingest(payroll("org-1", i * 100, &format!("payrun-{}", i)))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let expected: i64 = (1..=50i64).map(|i| i * 100).sum();
    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, expected);
    assert_eq!(ledger.contributions("org-1").await.unwrap().len(), 50);

    let verification = ledger.verify_chain("org-1").await.unwrap();
    assert!(verification.valid);
    assert_eq!(verification.entries_checked, 50);
}

/// Test: concurrent retries of one key apply it exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_retries_same_key() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.ingestor().ingest(payroll("org-1", 7_000, "payrun-1")).await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) if !receipt.replayed => applied += 1,
            Ok(_) => {}
            Err(e) => assert!(matches!(e, LedgerError::KeyInFlight { .. }), "unexpected {:?}", e),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 7_000);
}

/// Test: once a key has completed, concurrent retries all replay it
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replays_of_completed_key() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    let first = ledger.ingestor().ingest(payroll("org-1", 7_000, "k-1")).await.unwrap();
    assert!(!first.replayed);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.ingestor().ingest(payroll("org-1", 7_000, "k-1")).await
        }));
    }

    for handle in handles {
        let receipt = handle.await.unwrap().unwrap();
        assert!(receipt.replayed);
        assert_eq!(receipt.status_code, first.status_code);
        assert_eq!(receipt.payload, first.payload);
    }

    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 7_000);
}

/// Test: different accounts of one tenant are updated independently
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_obligations() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let ledger = ledger.clone();
        let (obligation, source) = if i % 2 == 0 {
            (ObligationType::Paygw, ContributionSource::PayrollSystem)
        } else {
            (ObligationType::Gst, ContributionSource::PosSystem)
        };
        handles.push(tokio::spawn(async move {
            let request = ContributionRequest::new("org-1", obligation, 250, source, format!("evt-{}", i));
            ledger.ingestor().ingest(request).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 2_500);
    assert_eq!(balance(&ledger, "org-1", ObligationType::Gst).await, 2_500);
    assert!(ledger.verify_chain("org-1").await.unwrap().valid);
}

/// Test: the store refuses a negative balance even when written directly
#[tokio::test]
async fn test_balance_never_negative() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    ledger.ingestor().ingest(payroll("org-1", 100, "k-1")).await.unwrap();
    let result = sqlx::query("UPDATE designated_accounts SET balance_minor_units = -1 WHERE tenant_id = 'org-1'")
        .execute(ledger.pool())
        .await;

    assert!(result.is_err());
    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 100);
}

/// Test: editing a stored payload breaks verification at that entry and quarantines the tenant
#[tokio::test]
async fn test_tampered_payload_quarantines_tenant() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    for i in 0..3 {
        ledger.ingestor().ingest(payroll("org-1", 1_000, &format!("k-{}", i))).await.unwrap();
    }
    let entries = ledger.audit().entries("org-1").await.unwrap();
    let target = &entries[1];

    allow_tampering(&ledger).await;
    let original: String = sqlx::query("SELECT payload FROM audit_log WHERE id = ?")
        .bind(&target.id)
        .fetch_one(ledger.pool())
        .await
        .unwrap()
        .get("payload");
    sqlx::query("UPDATE audit_log SET payload = ? WHERE id = ?")
        .bind(original.replace("1000", "1"))
        .bind(&target.id)
        .execute(ledger.pool())
        .await
        .unwrap();

    let verification = ledger.verify_chain("org-1").await.unwrap();
    assert!(!verification.valid);
    assert_eq!(verification.broken_at_entry_id.as_deref(), Some(target.id.as_str()));
    assert!(ledger.audit().quarantine_status("org-1").await.unwrap().is_some());

    // Writes for the tenant are refused and leave no trace.
    let refused = ledger.ingestor().ingest(payroll("org-1", 5_000, "k-new")).await;
    assert!(matches!(refused, Err(LedgerError::AuditChainIntegrityViolation { .. })));
    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 3_000);

    // Other tenants are unaffected.
    ledger.ingestor().ingest(payroll("org-2", 5_000, "k-new")).await.unwrap();

    // Release is refused until the chain is repaired.
    let early = ledger.audit().release_quarantine("org-1", "ops", "investigated").await;
    assert!(early.is_err());

    sqlx::query("UPDATE audit_log SET payload = ? WHERE id = ?")
        .bind(&original)
        .bind(&target.id)
        .execute(ledger.pool())
        .await
        .unwrap();
    let released = ledger
        .audit()
        .release_quarantine("org-1", "ops", "payload restored from backup")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(released.action, actions::QUARANTINE_RELEASED);

    // The key that failed earlier was never registered.
    let retried = ledger.ingestor().ingest(payroll("org-1", 5_000, "k-new")).await.unwrap();
    assert!(!retried.replayed);
    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 8_000);
    assert!(ledger.verify_chain("org-1").await.unwrap().valid);
}

/// Test: editing a stored hash is detected at that entry
#[tokio::test]
async fn test_tampered_hash_detected() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    for i in 0..4 {
        ledger.ingestor().ingest(payroll("org-1", 10, &format!("k-{}", i))).await.unwrap();
    }
    let entries = ledger.audit().entries("org-1").await.unwrap();

    allow_tampering(&ledger).await;
    sqlx::query("UPDATE audit_log SET hash = ? WHERE id = ?")
        .bind("0".repeat(64))
        .bind(&entries[2].id)
        .execute(ledger.pool())
        .await
        .unwrap();

    let verification = ledger.verify_chain("org-1").await.unwrap();
    assert!(!verification.valid);
    assert_eq!(verification.broken_at_entry_id.as_deref(), Some(entries[2].id.as_str()));
}

/// Test: deleting the newest entry is caught through the chain head
#[tokio::test]
async fn test_tail_deletion_detected() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    for i in 0..3 {
        ledger.ingestor().ingest(payroll("org-1", 10, &format!("k-{}", i))).await.unwrap();
    }
    let entries = ledger.audit().entries("org-1").await.unwrap();
    let last = entries.last().unwrap();

    allow_tampering(&ledger).await;
    sqlx::query("DELETE FROM audit_log WHERE id = ?")
        .bind(&last.id)
        .execute(ledger.pool())
        .await
        .unwrap();

    let verification = ledger.verify_chain("org-1").await.unwrap();
    assert!(!verification.valid);
    assert_eq!(verification.broken_at_entry_id.as_deref(), Some(last.id.as_str()));
}

/// Test: an append notices a tampered tip without a full verify
#[tokio::test]
async fn test_append_checks_tip() {
    let dir = TempDir::new().unwrap();
    let (ledger, _bus) = setup(&dir).await;

    ledger.ingestor().ingest(payroll("org-1", 10, "k-1")).await.unwrap();
    let tip = ledger.audit().entries("org-1").await.unwrap().remove(0);

    allow_tampering(&ledger).await;
    sqlx::query("UPDATE audit_log SET actor_id = 'mallory' WHERE id = ?")
        .bind(&tip.id)
        .execute(ledger.pool())
        .await
        .unwrap();

    let result = ledger.ingestor().ingest(payroll("org-1", 10, "k-2")).await;
    match result {
        Err(LedgerError::AuditChainIntegrityViolation { broken_at_entry_id, .. }) => {
            assert_eq!(broken_at_entry_id.as_deref(), Some(tip.id.as_str()));
        }
        other => panic!("expected integrity violation, got {:?}", other),
    }

    let quarantine = ledger.audit().quarantine_status("org-1").await.unwrap().unwrap();
    assert_eq!(quarantine.broken_at_entry_id.as_deref(), Some(tip.id.as_str()));
    assert_eq!(balance(&ledger, "org-1", ObligationType::Paygw).await, 10);
}

/// Test: a fresh database file reopens with its chain intact
#[tokio::test]
async fn test_reopen_preserves_chain() {
    let dir = TempDir::new().unwrap();
    {
        let (ledger, _bus) = setup(&dir).await;
        ledger.ingestor().ingest(payroll("org-1", 10, "k-1")).await.unwrap();
        ledger.pool().close().await;
    }

    let (ledger, _bus) = setup(&dir).await;
    let replay = ledger.ingestor().ingest(payroll("org-1", 10, "k-1")).await.unwrap();
    assert!(replay.replayed);

    ledger.ingestor().ingest(payroll("org-1", 10, "k-2")).await.unwrap();
    let verification = ledger.verify_chain("org-1").await.unwrap();
    assert!(verification.valid);
    assert_eq!(verification.entries_checked, 2);
}
