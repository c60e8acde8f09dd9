//! Queue listeners end to end: admission, dispatch, ack/nack and topology.

mod common;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::{
    test_config, wait_for_listeners, wait_until, Harness, ScriptedStore, INVOICES, ORDERS,
};
use event_job_provisioner::error::{FatalError, ProvisionerError};
use event_job_provisioner::events::{ProcessedMessage, ProvisionerEvent};
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

fn drain_processed(events: &mut Receiver<ProvisionerEvent>) -> Vec<ProcessedMessage> {
    let mut processed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ProvisionerEvent::Processed(message) = event {
            processed.push(message);
        }
    }
    processed
}

#[tokio::test(start_paused = true)]
async fn test_messages_become_jobs_and_are_acked() {
    let harness = Harness::new(test_config(true), ScriptedStore::with(&[("orders", ORDERS)]));
    let mut events = harness.provisioner.publisher().subscribe();
    harness.broker.publish("orders", r#"{"id":1}"#);
    harness.broker.publish("orders", r#"{"id":2}"#);

    harness.provisioner.start().await.unwrap();
    wait_until(Duration::from_secs(10), || harness.broker.acked().len() == 2).await;

    let jobs = harness.orchestrator.jobs();
    assert_eq!(
        jobs,
        vec![
            ("resize-1".to_string(), br#"{"id":1}"#.to_vec()),
            ("resize-2".to_string(), br#"{"id":2}"#.to_vec()),
        ]
    );

    let secrets = harness.orchestrator.secrets();
    assert_eq!(secrets.len(), 2);
    assert_eq!(secrets[0].name, "resize-1");
    assert_eq!(secrets[0].data["MESSAGE"], STANDARD.encode(r#"{"id":1}"#));

    let processed = drain_processed(&mut events);
    assert_eq!(processed.len(), 2);
    assert!(processed
        .iter()
        .all(|message| message.success && message.alias == "orders"));
    assert_eq!(harness.broker.pending("orders"), 0);
    assert_eq!(harness.broker.unacked_count(), 0);
    harness.provisioner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_dispatch_is_nacked_without_requeue() {
    let harness = Harness::new(test_config(true), ScriptedStore::with(&[("orders", ORDERS)]));
    let mut events = harness.provisioner.publisher().subscribe();
    harness.orchestrator.set_dispatch_failing(true);
    harness.broker.publish("orders", "poison");

    harness.provisioner.start().await.unwrap();
    wait_until(Duration::from_secs(10), || harness.broker.nacked().len() == 1).await;

    let (message, requeue) = harness.broker.nacked().remove(0);
    assert_eq!(message.content(), "poison");
    assert!(!requeue);
    assert_eq!(harness.broker.pending("orders"), 0);

    let processed = drain_processed(&mut events);
    assert_eq!(processed.len(), 1);
    assert!(!processed[0].success);
    assert!(matches!(
        processed[0].error,
        Some(ProvisionerError::OrchestrationDispatch { ref alias, .. }) if alias == "orders"
    ));
    harness.provisioner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_dispatch_requeues_when_configured() {
    let mut config = test_config(true);
    config.broker.requeue_on_failure = true;
    let harness = Harness::new(config, ScriptedStore::with(&[("orders", ORDERS)]));
    harness.orchestrator.set_dispatch_failing(true);
    harness.broker.publish("orders", "retry me");

    harness.provisioner.start().await.unwrap();
    wait_until(Duration::from_secs(20), || harness.broker.nacked().len() >= 2).await;

    let nacked = harness.broker.nacked();
    assert!(nacked[0].1);
    assert!(!nacked[0].0.redelivered);
    assert!(nacked[1].0.redelivered);
    assert_eq!(nacked[1].0.content(), "retry me");
    harness.provisioner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_busy_queue_is_left_untouched() {
    let harness = Harness::new(test_config(true), ScriptedStore::with(&[("orders", ORDERS)]));
    harness.orchestrator.set_active(3);
    harness.broker.publish("orders", "later");

    harness.provisioner.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(12)).await;

    assert!(harness.orchestrator.count_queries() >= 3);
    assert_eq!(harness.broker.pending("orders"), 1);
    assert!(harness.orchestrator.jobs().is_empty());

    harness.orchestrator.set_active(1);
    wait_until(Duration::from_secs(10), || harness.orchestrator.jobs().len() == 1).await;
    harness.provisioner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_declare_failure_is_fatal() {
    let harness = Harness::new(test_config(true), ScriptedStore::with(&[("orders", ORDERS)]));
    harness.broker.fail_declare_for("orders");

    harness.provisioner.start().await.unwrap();
    let fatal = tokio::time::timeout(Duration::from_secs(5), harness.provisioner.wait_for_fatal())
        .await
        .unwrap();

    assert!(matches!(
        fatal,
        Some(FatalError::ListenerTopology(ProvisionerError::QueueDeclare { ref queue, .. }))
            if queue == "orders"
    ));
    assert!(harness.provisioner.listeners().active_aliases().await.is_empty());
    harness.provisioner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reload_replaces_listener_set() {
    let harness = Harness::new(
        test_config(true),
        ScriptedStore::with(&[("orders", ORDERS), ("invoices", INVOICES)]),
    );
    harness.provisioner.start().await.unwrap();
    wait_for_listeners(harness.provisioner.listeners(), &["invoices", "orders"]).await;
    assert!(harness.broker.declared_queues().contains("invoices"));

    // A changed spec alongside the removal makes this a reload
    harness.store.remove("invoices");
    harness
        .store
        .set("orders", "jobName: resize\nimage: resizer:2\nparallelism: 2\ninterval: 5\n");
    harness.provisioner.reconciler().reconcile().await.unwrap();
    wait_for_listeners(harness.provisioner.listeners(), &["orders"]).await;

    harness.broker.publish("invoices", "orphan");
    harness.broker.publish("orders", "kept");
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(harness.broker.pending("invoices"), 1);
    assert_eq!(harness.broker.pending("orders"), 0);
    assert_eq!(harness.orchestrator.jobs().len(), 1);
    harness.provisioner.stop().await;
}
