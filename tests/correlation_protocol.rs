//! Call/response correlation across a link: ordering, timeouts, queueing,
//! and what the Hub refuses before routing.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchboard::bridge::{Bridge, PageEvent};
use switchboard::channel::{duplex, ChannelEnd};
use switchboard::config::BridgeConfig;
use switchboard::correlator::Correlator;
use switchboard::hub::{Hub, StateStore};
use switchboard::integrations::AgentLink;
use switchboard::protocol::{Envelope, RelayError, SequentialIdSource};
use switchboard::Config;
use tokio::sync::mpsc;

fn ids() -> Arc<SequentialIdSource> {
    Arc::new(SequentialIdSource::deterministic())
}

async fn real_hub() -> Hub {
    let link = Arc::new(AgentLink::new(ids(), Duration::from_secs(30)));
    Hub::new(&Config::default(), Vec::new(), link, StateStore::in_memory())
        .await
        .unwrap()
}

/// Hub stand-in that answers pings and hands every other call to the test,
/// in arrival order, instead of answering it.
fn spawn_holding_hub(mut end: ChannelEnd) -> mpsc::UnboundedReceiver<Envelope> {
    let (held_tx, held_rx) = mpsc::unbounded_channel();
    let sender = Arc::clone(&end.sender);
    tokio::spawn(async move {
        while let Some(call) = end.inbox.recv().await {
            let Some(id) = call.correlation_id.clone() else {
                continue;
            };
            if call.kind == "ping" {
                let _ = sender.send(Envelope::response(id, &Ok(json!({ "pong": true })))).await;
                continue;
            }
            let _ = held_tx.send(call);
        }
    });
    held_rx
}

#[tokio::test(start_paused = true)]
async fn calls_queued_while_unreachable_are_sent_in_issue_order() {
    let (page, hub, control) = duplex("page", "hub", 32);
    control.sever();
    let mut held = spawn_holding_hub(hub);
    let bridge = Bridge::start(page, &BridgeConfig::default(), ids());

    for step in 1..=4usize {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.call("update_settings", json!({ "step": step })).await });
    }
    while bridge.queued() < 4 {
        tokio::task::yield_now().await;
    }

    let mut events = bridge.subscribe();
    control.restore();
    loop {
        if let PageEvent::ConnectivityChanged { connected: true, .. } = events.recv().await.unwrap() {
            break;
        }
    }

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(held.recv().await.unwrap().payload["step"].clone());
    }
    assert_eq!(order, [json!(1), json!(2), json!(3), json!(4)]);
    assert_eq!(bridge.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_late_reply_is_ignored() {
    let (page, hub, _control) = duplex("page", "hub", 32);
    let hub_sender = Arc::clone(&hub.sender);
    let mut held = spawn_holding_hub(hub);
    let bridge = Bridge::start(page, &BridgeConfig::default(), ids());

    let started = tokio::time::Instant::now();
    let result = bridge.call("get_status", Value::Null).await;
    assert_eq!(result, Err(RelayError::Timeout(Duration::from_secs(30))));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(bridge.pending(), 0);

    let stale = held.recv().await.unwrap();
    let id = stale.correlation_id.unwrap();
    hub_sender
        .send(Envelope::response(id, &Ok(json!({ "late": true }))))
        .await
        .unwrap();
    tokio::task::yield_now().await;
    assert_eq!(bridge.pending(), 0);
    assert!(bridge.is_connected());
}

#[tokio::test]
async fn correlator_resolves_by_id_not_arrival_order() {
    let correlator = Correlator::new(ids(), Duration::from_secs(30));
    let first = correlator.register("get_status");
    let second = correlator.register("ping");
    let first_id = first.correlation_id().to_string();
    let second_id = second.correlation_id().to_string();
    assert_ne!(first_id, second_id);

    assert!(correlator.resolve(&second_id, Ok(json!("second"))));
    assert!(correlator.resolve(&first_id, Ok(json!("first"))));
    assert_eq!(first.wait().await.unwrap(), json!("first"));
    assert_eq!(second.wait().await.unwrap(), json!("second"));

    // Already settled: a duplicate reply is a no-op.
    assert!(!correlator.resolve(&first_id, Ok(json!("again"))));
    assert!(correlator.is_empty());
}

#[tokio::test]
async fn foreign_link_is_rejected_even_when_claiming_an_allowed_origin() {
    let hub = real_hub().await;
    let (page, hub_end, _control) = duplex("page", "hub", 32);
    hub.attach_page(hub_end, "https://evil.example");

    // Stamps the allow-listed `app://switchboard` on every call.
    let bridge = Bridge::start(page, &BridgeConfig::default(), ids());

    let result = bridge.call("clear_cache", Value::Null).await;
    assert_eq!(
        result,
        Err(RelayError::Unauthorized("https://evil.example".into()))
    );
    assert!(bridge.is_connected());
    bridge.teardown();
}

#[tokio::test]
async fn trusted_link_is_not_affected_by_what_the_page_claims() {
    let hub = real_hub().await;
    let (page, hub_end, _control) = duplex("page", "hub", 32);
    hub.attach_page(hub_end, "app://switchboard");

    let config = BridgeConfig {
        origin: "https://somewhere.else".into(),
        ..BridgeConfig::default()
    };
    let bridge = Bridge::start(page, &config, ids());
    assert_eq!(
        bridge.call("clear_cache", Value::Null).await.unwrap(),
        json!({ "cleared": 0 })
    );
    bridge.teardown();
}

#[tokio::test]
async fn unknown_call_kind_comes_back_as_an_error() {
    let hub = real_hub().await;
    let (page, hub_end, _control) = duplex("page", "hub", 32);
    hub.attach_page(hub_end, "app://switchboard");
    let bridge = Bridge::start(page, &BridgeConfig::default(), ids());

    assert_eq!(
        bridge.call("format_disk", json!({})).await,
        Err(RelayError::UnknownRequest("format_disk".into()))
    );
    // The link is still usable afterwards.
    assert_eq!(
        bridge.call("ping", Value::Null).await.unwrap(),
        json!({ "pong": true })
    );
    bridge.teardown();
}

#[tokio::test]
async fn teardown_rejects_outstanding_calls() {
    let (page, hub, _control) = duplex("page", "hub", 32);
    let _held = spawn_holding_hub(hub);
    let bridge = Bridge::start(page, &BridgeConfig::default(), ids());

    let outstanding = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.call("get_status", Value::Null).await }
    });
    while bridge.pending() == 0 {
        tokio::task::yield_now().await;
    }

    bridge.teardown();
    assert_eq!(
        outstanding.await.unwrap(),
        Err(RelayError::ContextTornDown)
    );
}
