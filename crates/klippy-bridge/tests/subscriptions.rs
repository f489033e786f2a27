mod support;

use std::time::Duration;

use klippy_bridge::{BridgeEvent, ChannelSink, KlippyBridge, ObjectRequest, StatusSink};
use serde_json::{Map, Value, json};
use support::{FakeKlippy, fast_config, next_event, tmpdir};
use tokio::time::timeout;

async fn ready_bridge(label: &str) -> (FakeKlippy, KlippyBridge) {
    let dir = tmpdir(label);
    let fake = FakeKlippy::start(&dir);
    let bridge = KlippyBridge::new(fast_config(&fake.path));
    bridge.connect().await.unwrap();
    bridge.wait_ready().await.unwrap();
    (fake, bridge)
}

fn last_upstream_objects(fake: &FakeKlippy) -> Value {
    fake.requests_for("objects/subscribe")
        .pop()
        .map(|r| r.params["objects"].clone())
        .unwrap_or(Value::Null)
}

#[tokio::test]
async fn pushes_are_pruned_per_subscriber() {
    let (fake, bridge) = ready_bridge("prune").await;
    let (a, mut rx_a) = ChannelSink::new();
    let (b, mut rx_b) = ChannelSink::new();

    let snap_a = bridge
        .subscribe(a.clone(), ObjectRequest::new().with_fields("toolhead", ["position"]))
        .await
        .unwrap();
    assert_eq!(snap_a.eventtime, 100.5);
    assert_eq!(
        Value::Object(snap_a.status),
        json!({"toolhead": {"position": [0.0, 0.0, 0.0, 0.0]}})
    );

    let snap_b = bridge
        .subscribe(b.clone(), ObjectRequest::new().with_all("toolhead"))
        .await
        .unwrap();
    assert_eq!(snap_b.status["toolhead"]["velocity"], json!(5));

    // Webhooks stay pinned; B's all-fields request dominates A's list.
    assert_eq!(
        last_upstream_objects(&fake),
        json!({"toolhead": null, "webhooks": null})
    );

    fake.push_status(json!({"toolhead": {"position": [1, 2, 3, 0], "velocity": 5}}));
    let got_a = rx_a.recv().await.unwrap();
    assert_eq!(got_a.eventtime, 200.25);
    assert_eq!(
        Value::Object(got_a.status),
        json!({"toolhead": {"position": [1, 2, 3, 0]}})
    );
    let got_b = rx_b.recv().await.unwrap();
    assert_eq!(
        Value::Object(got_b.status),
        json!({"toolhead": {"position": [1, 2, 3, 0], "velocity": 5}})
    );

    // An update touching nothing A asked for is not delivered to A.
    fake.push_status(json!({"toolhead": {"velocity": 10}}));
    let got_b = rx_b.recv().await.unwrap();
    assert_eq!(Value::Object(got_b.status), json!({"toolhead": {"velocity": 10}}));
    assert!(rx_a.try_recv().is_err());
    bridge.close(true).await;
}

#[tokio::test]
async fn resubscribe_replaces_and_unsubscribe_is_local() {
    let (fake, bridge) = ready_bridge("resubscribe").await;
    let (a, _rx_a) = ChannelSink::new();
    bridge
        .subscribe(a.clone(), ObjectRequest::new().with_all("toolhead"))
        .await
        .unwrap();
    bridge
        .subscribe(a.clone(), ObjectRequest::new().with_fields("extruder", ["temperature"]))
        .await
        .unwrap();
    assert_eq!(bridge.subscriber_count(), 1);
    assert_eq!(
        last_upstream_objects(&fake),
        json!({"extruder": ["temperature"], "webhooks": null})
    );

    let before = fake.requests_for("objects/subscribe").len();
    assert!(bridge.unsubscribe(a.subscriber_id()));
    assert_eq!(bridge.subscriber_count(), 0);
    assert_eq!(fake.requests_for("objects/subscribe").len(), before);
    bridge.close(true).await;
}

#[tokio::test]
async fn request_for_routes_through_aggregator() {
    let (fake, bridge) = ready_bridge("request-for").await;
    let (a, mut rx_a) = ChannelSink::new();
    let mut params = Map::new();
    params.insert("objects".into(), json!({"extruder": ["target"]}));
    let res = bridge
        .request_for(a.clone(), "printer.objects.subscribe", params)
        .await
        .unwrap();
    assert_eq!(res, json!({"eventtime": 100.5, "status": {"extruder": {"target": 0}}}));

    // Other endpoints pass straight through.
    let mut params = Map::new();
    params.insert("k".into(), json!("v"));
    let res = bridge.request_for(a, "echo", params).await.unwrap();
    assert_eq!(res, json!({"k": "v"}));

    fake.push_status(json!({"extruder": {"target": 210, "temperature": 25.0}}));
    let got = rx_a.recv().await.unwrap();
    assert_eq!(Value::Object(got.status), json!({"extruder": {"target": 210}}));
    bridge.close(true).await;
}

#[tokio::test]
async fn closed_sinks_are_dropped() {
    let (fake, bridge) = ready_bridge("closed-sink").await;
    let (a, rx_a) = ChannelSink::new();
    bridge
        .subscribe(a, ObjectRequest::new().with_all("toolhead"))
        .await
        .unwrap();
    drop(rx_a);
    let mut events = bridge.events();
    fake.push_status(json!({"toolhead": {"velocity": 1}}));
    next_event(&mut events, |e| matches!(e, BridgeEvent::StatusUpdate(_))).await;
    assert_eq!(bridge.subscriber_count(), 0);
    bridge.close(true).await;
}

#[tokio::test]
async fn subscribers_do_not_survive_reconnect() {
    let (fake, bridge) = ready_bridge("sub-reconnect").await;
    let mut events = bridge.events();
    let (a, mut rx_a) = ChannelSink::new();
    bridge
        .subscribe(a.clone(), ObjectRequest::new().with_all("toolhead"))
        .await
        .unwrap();

    fake.drop_connections();
    next_event(&mut events, |e| matches!(e, BridgeEvent::Disconnected)).await;
    assert_eq!(bridge.subscriber_count(), 0);
    next_event(&mut events, |e| matches!(e, BridgeEvent::Ready)).await;

    // The fresh upstream subscription only carries webhooks.
    assert_eq!(last_upstream_objects(&fake), json!({"webhooks": null}));
    fake.push_status(json!({"toolhead": {"velocity": 2}}));
    next_event(&mut events, |e| matches!(e, BridgeEvent::StatusUpdate(_))).await;
    assert!(rx_a.try_recv().is_err());

    // Re-subscribing restores delivery.
    bridge
        .subscribe(a, ObjectRequest::new().with_all("toolhead"))
        .await
        .unwrap();
    fake.push_status(json!({"toolhead": {"velocity": 3}}));
    let got = timeout(Duration::from_secs(5), rx_a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Value::Object(got.status), json!({"toolhead": {"velocity": 3}}));
    bridge.close(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribes_both_reach_upstream() {
    let (fake, bridge) = ready_bridge("concurrent").await;
    for round in 0..20 {
        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let (ra, rb) = tokio::join!(
            bridge.subscribe(a.clone(), ObjectRequest::new().with_fields("toolhead", ["position"])),
            bridge.subscribe(b.clone(), ObjectRequest::new().with_fields("extruder", ["temperature"])),
        );
        ra.unwrap();
        rb.unwrap();
        assert_eq!(
            last_upstream_objects(&fake),
            json!({
                "extruder": ["temperature"],
                "toolhead": ["position"],
                "webhooks": null,
            }),
            "round {round}"
        );

        fake.push_status(json!({
            "toolhead": {"position": [round, 0, 0, 0]},
            "extruder": {"temperature": 200.0},
        }));
        let got_a = timeout(Duration::from_secs(5), rx_a.recv()).await.unwrap().unwrap();
        assert_eq!(got_a.status["toolhead"]["position"][0], json!(round));
        let got_b = timeout(Duration::from_secs(5), rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(Value::Object(got_b.status), json!({"extruder": {"temperature": 200.0}}));

        bridge.unsubscribe(a.subscriber_id());
        bridge.unsubscribe(b.subscriber_id());
    }
    bridge.close(true).await;
}
