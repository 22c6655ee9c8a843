mod common;

use chrono::Utc;
use common::{provider_callback, rc, Harness, ScriptedAdapter};
use ppob_gateway::database::models::{CallbackEvent, TransactionStatus};
use ppob_gateway::services::provider_callback::CallbackDisposition;
use ppob_gateway::services::transaction_engine::{CreateTransactionRequest, EngineConfig};
use ppob_gateway::workers::{
    ProviderCallbackSweepConfig, ProviderCallbackSweepWorker, RetrySweepConfig, RetrySweepWorker,
    WebhookRetryConfig, WebhookRetryWorker,
};
use std::time::Duration;
use tokio::sync::watch;

fn topup(client_id: i64, reference: &str, product: &str) -> CreateTransactionRequest {
    CreateTransactionRequest {
        client_id,
        reference_id: reference.to_string(),
        product_code: product.to_string(),
        customer_no: "081298765432".to_string(),
        is_sandbox: false,
        metadata: None,
    }
}

fn immediate_retry() -> EngineConfig {
    EngineConfig {
        pending_retry: Duration::ZERO,
        ..EngineConfig::default()
    }
}

async fn sweep_provider_callbacks(h: &Harness) -> Vec<CallbackDisposition> {
    let mut dispositions = Vec::new();
    for callback in h.provider_callbacks.claim_due(50).await.unwrap() {
        dispositions.push(h.provider_callbacks.process(&callback).await.unwrap());
    }
    h.settle().await;
    dispositions
}

#[tokio::test]
async fn callback_for_settled_transaction_changes_nothing() {
    let alpha = ScriptedAdapter::new("alpha", vec![rc("00")]);
    let h = Harness::new(vec![alpha]).await;
    let product = h.prepaid_product("XL25").await;
    h.provider_sku(&product, "alpha", 25_000, false).await;

    let tx = h
        .engine
        .create_transaction(topup(h.client.id, "ORD-R-1", "XL25"))
        .await
        .unwrap()
        .transaction;
    h.settle().await;
    assert_eq!(tx.status, TransactionStatus::Success);

    let (body, signature) = provider_callback(&tx.transaction_id, "40", None);
    h.provider_callbacks
        .ingest("alpha", &body, Some(&signature))
        .await
        .unwrap();

    assert_eq!(
        sweep_provider_callbacks(&h).await,
        vec![CallbackDisposition::Ignored]
    );

    let stored = h.store.transactions().await;
    assert_eq!(stored[0].status, TransactionStatus::Success);
    assert!(stored[0].failed_code.is_none());
    assert_eq!(h.store.callback_logs().await.len(), 1);
    assert_eq!(h.transport.events(), vec!["transaction.success"]);

    let callbacks = h.store.provider_callbacks().await;
    assert!(callbacks[0].is_processed);
    assert!(callbacks[0].process_error.is_none());
}

#[tokio::test]
async fn pushed_success_settles_a_processing_transaction() {
    let alpha = ScriptedAdapter::new("alpha", vec![rc("03")]);
    let h = Harness::new(vec![alpha]).await;
    let product = h.prepaid_product("XL50").await;
    h.provider_sku(&product, "alpha", 50_000, false).await;

    let tx = h
        .engine
        .create_transaction(topup(h.client.id, "ORD-R-2", "XL50"))
        .await
        .unwrap()
        .transaction;
    assert_eq!(tx.status, TransactionStatus::Processing);

    let (body, signature) = provider_callback(&tx.transaction_id, "00", Some("SN-PUSHED"));
    h.provider_callbacks
        .ingest("alpha", &body, Some(&signature))
        .await
        .unwrap();

    let worker = ProviderCallbackSweepWorker::new(
        h.provider_callbacks.clone(),
        ProviderCallbackSweepConfig::default(),
    );
    let (_tx, rx) = watch::channel(false);
    worker.run_cycle(&rx).await.unwrap();
    h.settle().await;

    let stored = h.store.transactions().await;
    assert_eq!(stored[0].status, TransactionStatus::Success);
    assert_eq!(stored[0].serial_number.as_deref(), Some("SN-PUSHED"));
    assert_eq!(h.transport.events(), vec!["transaction.success"]);

    // Replaying the same callback is a no-op.
    h.provider_callbacks
        .ingest("alpha", &body, Some(&signature))
        .await
        .unwrap();
    worker.run_cycle(&rx).await.unwrap();
    h.settle().await;
    assert_eq!(h.transport.events(), vec!["transaction.success"]);
}

#[tokio::test]
async fn forged_callback_is_rejected_before_storage() {
    let alpha = ScriptedAdapter::new("alpha", vec![]);
    let h = Harness::new(vec![alpha]).await;

    let (body, _) = provider_callback("TRX-20260101-000001", "00", None);
    let err = h
        .provider_callbacks
        .ingest("alpha", &body, Some("deadbeef"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("signature"));

    let err = h
        .provider_callbacks
        .ingest("nobody", &body, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown provider"));
    assert!(h.store.provider_callbacks().await.is_empty());
}

#[tokio::test]
async fn redrive_continues_the_suffix_sequence() {
    let alpha = ScriptedAdapter::new("alpha", vec![rc("01")]);
    let h = Harness::with_config(vec![alpha.clone()], immediate_retry()).await;
    let product = h.prepaid_product("TRI10").await;
    h.provider_sku(&product, "alpha", 10_000, false).await;

    let tx = h
        .engine
        .create_transaction(topup(h.client.id, "ORD-R-3", "TRI10"))
        .await
        .unwrap()
        .transaction;
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.ref_sequence, 1);

    let worker = RetrySweepWorker::new(
        h.engine.clone(),
        h.stores.transactions.clone(),
        RetrySweepConfig::default(),
    );
    let (_tx, rx) = watch::channel(false);

    alpha.push(rc("01"));
    let stats = worker.run_cycle(&rx).await.unwrap();
    assert_eq!(stats.redriven, 1);

    alpha.push(rc("00"));
    worker.run_cycle(&rx).await.unwrap();
    h.settle().await;

    let base = tx.transaction_id.clone();
    assert_eq!(
        alpha.ref_ids(),
        vec![base.clone(), format!("{}-1", base), format!("{}-2", base)]
    );

    let stored = h.store.transactions().await;
    assert_eq!(stored[0].status, TransactionStatus::Success);
    assert_eq!(stored[0].ref_sequence, 3);
    assert_eq!(stored[0].retry_count, 2);
    assert_eq!(stored[0].provider_ref_id, Some(format!("{}-2", base)));

    // Pending is logged once no matter how often the row was parked.
    let events: Vec<CallbackEvent> = h
        .store
        .callback_logs()
        .await
        .into_iter()
        .map(|l| l.event)
        .collect();
    assert_eq!(events.len(), 2);
    assert!(events.contains(&CallbackEvent::Pending));
    assert!(events.contains(&CallbackEvent::Success));
}

#[tokio::test]
async fn superseded_token_only_counts_when_successful() {
    let alpha = ScriptedAdapter::new("alpha", vec![rc("01")]);
    let h = Harness::with_config(vec![alpha.clone()], immediate_retry()).await;
    let product = h.prepaid_product("SMART10").await;
    h.provider_sku(&product, "alpha", 10_000, false).await;

    let tx = h
        .engine
        .create_transaction(topup(h.client.id, "ORD-R-4", "SMART10"))
        .await
        .unwrap()
        .transaction;

    alpha.push(rc("03"));
    let worker = RetrySweepWorker::new(
        h.engine.clone(),
        h.stores.transactions.clone(),
        RetrySweepConfig::default(),
    );
    let (_tx, rx) = watch::channel(false);
    worker.run_cycle(&rx).await.unwrap();

    let stored = h.store.transactions().await;
    assert_eq!(stored[0].status, TransactionStatus::Pending);
    assert_eq!(
        stored[0].provider_ref_id,
        Some(format!("{}-1", tx.transaction_id))
    );
    assert!(stored[0].next_retry_at.is_none());

    let (stale, signature) = provider_callback(&tx.transaction_id, "01", None);
    h.provider_callbacks
        .ingest("alpha", &stale, Some(&signature))
        .await
        .unwrap();
    assert_eq!(
        sweep_provider_callbacks(&h).await,
        vec![CallbackDisposition::Ignored]
    );
    assert_eq!(
        h.store.transactions().await[0].status,
        TransactionStatus::Pending
    );

    let (late, signature) = provider_callback(&tx.transaction_id, "00", Some("SN-LATE"));
    h.provider_callbacks
        .ingest("alpha", &late, Some(&signature))
        .await
        .unwrap();
    assert_eq!(
        sweep_provider_callbacks(&h).await,
        vec![CallbackDisposition::Applied]
    );

    let settled = &h.store.transactions().await[0];
    assert_eq!(settled.status, TransactionStatus::Success);
    assert_eq!(settled.serial_number.as_deref(), Some("SN-LATE"));
}

#[tokio::test]
async fn previous_provider_cannot_fail_a_transaction_it_no_longer_owns() {
    let alpha = ScriptedAdapter::new("alpha", vec![rc("01")]);
    let beta = ScriptedAdapter::new("beta", vec![rc("03")]);
    let h = Harness::new(vec![alpha, beta]).await;
    let product = h.prepaid_product("TRI10").await;
    h.provider_sku(&product, "alpha", 10_100, false).await;
    h.provider_sku(&product, "beta", 10_200, false).await;

    let tx = h
        .engine
        .create_transaction(topup(h.client.id, "ORD-R-5", "TRI10"))
        .await
        .unwrap()
        .transaction;
    let beta_token = format!("{}-1", tx.transaction_id);
    assert_eq!(tx.status, TransactionStatus::Processing);
    assert_eq!(tx.provider_code.as_deref(), Some("beta"));
    assert_eq!(tx.provider_ref_id.as_deref(), Some(beta_token.as_str()));

    let (late_failure, signature) = provider_callback(&tx.transaction_id, "40", None);
    h.provider_callbacks
        .ingest("alpha", &late_failure, Some(&signature))
        .await
        .unwrap();
    assert_eq!(
        sweep_provider_callbacks(&h).await,
        vec![CallbackDisposition::Ignored]
    );
    let stored = &h.store.transactions().await[0];
    assert_eq!(stored.status, TransactionStatus::Processing);
    assert!(stored.failed_code.is_none());
    assert!(h.transport.events().is_empty());

    let (settled, signature) = provider_callback(&beta_token, "00", Some("SN-BETA"));
    h.provider_callbacks
        .ingest("beta", &settled, Some(&signature))
        .await
        .unwrap();
    assert_eq!(
        sweep_provider_callbacks(&h).await,
        vec![CallbackDisposition::Applied]
    );
    let stored = &h.store.transactions().await[0];
    assert_eq!(stored.status, TransactionStatus::Success);
    assert_eq!(stored.serial_number.as_deref(), Some("SN-BETA"));
    assert_eq!(h.transport.events(), vec!["transaction.success"]);
}

#[tokio::test]
async fn undelivered_webhook_follows_the_retry_schedule_then_stops() {
    let alpha = ScriptedAdapter::new("alpha", vec![rc("00")]);
    let h = Harness::new(vec![alpha]).await;
    let product = h.prepaid_product("XL100").await;
    h.provider_sku(&product, "alpha", 99_000, false).await;
    h.transport.respond_with(&[503, 503, 503, 503, 503, 503]);

    h.engine
        .create_transaction(topup(h.client.id, "ORD-W-1", "XL100"))
        .await
        .unwrap();
    h.settle().await;

    let log = &h.store.callback_logs().await[0];
    assert_eq!(log.attempt, 1);
    assert!(!log.is_delivered);
    assert_eq!(log.http_status, Some(503));
    let delay = log.next_retry_at.unwrap() - log.updated_at;
    assert_eq!(delay.num_seconds(), 30);

    let worker = WebhookRetryWorker::new(h.callbacks.clone(), WebhookRetryConfig::default());
    let (_tx, rx) = watch::channel(false);

    let expected_delays = [60, 300, 1_800, 7_200];
    for (i, secs) in expected_delays.iter().enumerate() {
        // Nothing is due until the retry time has passed.
        assert_eq!(worker.run_cycle(&rx).await.unwrap(), 0);

        h.store.set_callback_retry_at(Utc::now()).await;
        assert_eq!(worker.run_cycle(&rx).await.unwrap(), 1);

        let log = &h.store.callback_logs().await[0];
        assert_eq!(log.attempt, i as i32 + 2);
        let delay = log.next_retry_at.unwrap() - log.updated_at;
        assert_eq!(delay.num_seconds(), *secs);
    }

    // Fifth retry (sixth delivery) failed: the schedule is used up.
    h.store.set_callback_retry_at(Utc::now()).await;
    assert_eq!(worker.run_cycle(&rx).await.unwrap(), 1);
    let log = &h.store.callback_logs().await[0];
    assert_eq!(log.attempt, 6);
    assert!(log.next_retry_at.is_none());
    assert!(!log.is_delivered);

    h.store.set_callback_retry_at(Utc::now()).await;
    assert_eq!(worker.run_cycle(&rx).await.unwrap(), 0);

    let deliveries = h.transport.deliveries();
    assert_eq!(deliveries.len(), 6);
    assert!(deliveries.iter().all(|d| d.body == deliveries[0].body));
    assert!(!h.store.transactions().await[0].callback_sent);
}

#[tokio::test]
async fn webhook_retry_stops_once_delivered() {
    let alpha = ScriptedAdapter::new("alpha", vec![rc("00")]);
    let h = Harness::new(vec![alpha]).await;
    let product = h.prepaid_product("XL20").await;
    h.provider_sku(&product, "alpha", 20_000, false).await;
    h.transport.respond_with(&[500]);

    h.engine
        .create_transaction(topup(h.client.id, "ORD-W-2", "XL20"))
        .await
        .unwrap();
    h.settle().await;

    h.store.set_callback_retry_at(Utc::now()).await;
    let worker = WebhookRetryWorker::new(h.callbacks.clone(), WebhookRetryConfig::default());
    let (_tx, rx) = watch::channel(false);
    assert_eq!(worker.run_cycle(&rx).await.unwrap(), 1);

    let log = &h.store.callback_logs().await[0];
    assert!(log.is_delivered);
    assert_eq!(log.attempt, 2);
    assert!(log.next_retry_at.is_none());
    assert!(h.store.transactions().await[0].callback_sent);

    h.store.set_callback_retry_at(Utc::now()).await;
    assert_eq!(worker.run_cycle(&rx).await.unwrap(), 0);
    assert_eq!(h.transport.deliveries().len(), 2);
}
