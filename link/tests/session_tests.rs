//! Integration tests for the transport session against a fake gateway.

mod common;

use common::{init_logging, test_client, EventRecorder, FakeGateway};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use trade_link::{
    ClientFrame, ConnectionOptions, Event, ServerFrame, SessionState, SubscriptionHandle,
    Topic, TradeLinkClient, TradeLinkError, TradeLinkTimeouts, UpdateEvent, UpdateKind,
    BOOTSTRAP_ACCOUNT_STATE, BOOTSTRAP_OPEN_ORDERS, BOOTSTRAP_POSITIONS,
    FAULT_GATEWAY_UNREACHABLE,
};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_update(handle: &mut SubscriptionHandle) -> UpdateEvent {
    tokio::time::timeout(Duration::from_secs(5), handle.next())
        .await
        .expect("timed out waiting for update")
        .expect("update stream ended")
}

#[tokio::test]
async fn test_connect_reaches_ready_with_bootstrap() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let client = test_client(&gateway.url());

    let session = client.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.is_connected());
    assert_eq!(session.accounts(), vec!["TEST1".to_string()]);
    assert_eq!(session.server_version(), 42);

    let positions = session.bootstrap(BOOTSTRAP_POSITIONS).unwrap();
    assert_eq!(positions["method"], "positions");
    assert!(session.bootstrap(BOOTSTRAP_OPEN_ORDERS).is_some());
    assert!(session.bootstrap(BOOTSTRAP_ACCOUNT_STATE).is_some());

    let stats = session.stats();
    assert!(stats.frames_sent >= 3);
    assert!(stats.frames_received >= 3);
    assert!(stats.bytes_received > 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_call_round_trip() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let session = test_client(&gateway.url()).connect().await.unwrap();

    let result = session
        .call("server_time", json!({"tz": "utc"}), None)
        .await
        .unwrap();
    assert_eq!(result["method"], "server_time");
    assert_eq!(result["params"]["tz"], "utc");

    session.disconnect().await;
}

/// 100 concurrent calls answered in reverse order must each resolve to
/// their own, non-swapped result.
#[tokio::test]
async fn test_concurrent_calls_resolve_unswapped() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let session = Arc::new(test_client(&gateway.url()).connect().await.unwrap());

    gateway.hold_replies(100);
    let mut callers = Vec::new();
    for seq in 0..100u32 {
        let session = session.clone();
        callers.push(tokio::spawn(async move {
            let result = session
                .call("echo", json!({"seq": seq}), Some(Duration::from_secs(10)))
                .await
                .unwrap();
            (seq, result)
        }));
    }

    for caller in callers {
        let (seq, result) = caller.await.unwrap();
        assert_eq!(result["params"]["seq"], seq, "reply swapped for call {}", seq);
    }

    session.disconnect().await;
}

#[tokio::test]
async fn test_call_timeout_then_late_reply_is_discarded() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let session = test_client(&gateway.url()).connect().await.unwrap();

    gateway.drop_method("slow");
    let err = session
        .call("slow", json!({}), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeLinkError::TimeoutError(_)));

    // The reply arrives after the caller gave up; nothing happens.
    let (call_id, _) = gateway.wait_for_request("slow").await;
    gateway.inject(ServerFrame::Reply {
        call_id,
        result: json!("late"),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(session.is_connected());
    let result = session.call("server_time", json!({}), None).await.unwrap();
    assert_eq!(result["method"], "server_time");

    session.disconnect().await;
}

#[tokio::test]
async fn test_call_error_reaches_only_its_caller() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let session = test_client(&gateway.url()).connect().await.unwrap();

    gateway.fail_method("order", 321);
    let err = session.call("order", json!({}), None).await.unwrap_err();
    assert!(matches!(
        err,
        TradeLinkError::GatewayError { code: 321, .. }
    ));

    // Other traffic is unaffected.
    let result = session.call("server_time", json!({}), None).await.unwrap();
    assert_eq!(result["method"], "server_time");

    session.disconnect().await;
}

#[tokio::test]
async fn test_notify_carries_no_call_id() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let session = test_client(&gateway.url()).connect().await.unwrap();

    session.notify("cancel_all", json!({"scope": "day"})).await.unwrap();
    wait_until(|| {
        gateway.received().iter().any(|frame| {
            matches!(frame, ClientFrame::Notify { method, .. } if method == "cancel_all")
        })
    })
    .await;
    assert_eq!(gateway.request_count("cancel_all"), 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_subscription_push_and_pull() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let session = test_client(&gateway.url()).connect().await.unwrap();

    let mut handle = session
        .subscribe("quotes", json!({"symbol": "EURUSD"}))
        .await
        .unwrap();
    wait_until(|| {
        gateway.received().iter().any(|frame| {
            matches!(frame, ClientFrame::Subscribe { topic, .. } if topic == "quotes")
        })
    })
    .await;

    gateway.inject(ServerFrame::Update {
        subscription_id: handle.id(),
        kind: UpdateKind::Append,
        data: json!({"bid": 1.09}),
    });
    gateway.inject(ServerFrame::Update {
        subscription_id: handle.id(),
        kind: UpdateKind::Append,
        data: json!({"bid": 1.10}),
    });
    gateway.inject(ServerFrame::Update {
        subscription_id: handle.id(),
        kind: UpdateKind::Replace,
        data: json!({"status": "open"}),
    });

    let first = next_update(&mut handle).await;
    assert_eq!(first.kind, UpdateKind::Append);
    assert_eq!(first.data["bid"], 1.09);
    let _ = next_update(&mut handle).await;
    let third = next_update(&mut handle).await;
    assert_eq!(third.kind, UpdateKind::Replace);

    let snapshot = handle.live().snapshot();
    assert_eq!(snapshot.rows.len(), 2);
    assert_eq!(snapshot.state["status"], "open");
    assert_eq!(snapshot.revision, 3);
    assert!(!snapshot.stale);

    handle.close().await.unwrap();
    session.disconnect().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_updates() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let session = test_client(&gateway.url()).connect().await.unwrap();

    let mut handle = session.subscribe("quotes", json!({})).await.unwrap();
    let id = handle.id();
    gateway.inject(ServerFrame::Update {
        subscription_id: id,
        kind: UpdateKind::Append,
        data: json!({"bid": 1.0}),
    });
    next_update(&mut handle).await;

    handle.close().await.unwrap();
    assert!(handle.is_closed());
    wait_until(|| {
        gateway.received().iter().any(|frame| {
            matches!(frame, ClientFrame::Unsubscribe { subscription_id } if *subscription_id == id)
        })
    })
    .await;

    // Updates for the cancelled id are discarded; the reader's view of
    // the live result never changes again.
    gateway.inject(ServerFrame::Update {
        subscription_id: id,
        kind: UpdateKind::Append,
        data: json!({"bid": 2.0}),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.live().rows().len(), 1);

    session.disconnect().await;
}

/// Two subscriptions with identical params get distinct ids and
/// independently updated live results.
#[tokio::test]
async fn test_identical_params_are_independent() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let session = test_client(&gateway.url()).connect().await.unwrap();

    let a = session
        .subscribe("quotes", json!({"symbol": "EURUSD"}))
        .await
        .unwrap();
    let b = session
        .subscribe("quotes", json!({"symbol": "EURUSD"}))
        .await
        .unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.params(), b.params());

    gateway.inject(ServerFrame::Update {
        subscription_id: a.id(),
        kind: UpdateKind::Append,
        data: json!({"bid": 1.0}),
    });
    wait_until(|| a.live().rows().len() == 1).await;
    assert_eq!(b.live().rows().len(), 0, "sibling subscription untouched");

    session.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_twice_emits_one_notification() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let client = test_client(&gateway.url());
    let session = client.connect().await.unwrap();

    let mut disconnects = EventRecorder::subscribe(&client.events(), Topic::Disconnected);
    session.disconnect().await;
    session.disconnect().await;

    let event = disconnects.next().await;
    assert!(matches!(event, Event::Disconnected(_)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(disconnects.drain(), 0, "second disconnect emits nothing");
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let session = Arc::new(test_client(&gateway.url()).connect().await.unwrap());

    gateway.drop_method("hang");
    let caller = {
        let session = session.clone();
        // Zero means no caller timeout; only the teardown can end this.
        tokio::spawn(async move { session.call("hang", json!({}), Some(Duration::ZERO)).await })
    };
    gateway.wait_for_request("hang").await;

    session.disconnect().await;
    let err = caller.await.unwrap().unwrap_err();
    assert!(matches!(err, TradeLinkError::ConnectionLost(_)));
}

#[tokio::test]
async fn test_server_close_tears_the_session_down() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let client = test_client(&gateway.url());
    let session = client.connect().await.unwrap();

    let mut disconnects = EventRecorder::subscribe(&client.events(), Topic::Disconnected);
    let mut stale = EventRecorder::subscribe(&client.events(), Topic::SubscriptionsStale);
    let handle = session.subscribe("quotes", json!({})).await.unwrap();

    gateway.close_connections();
    stale.next().await;
    disconnects.next().await;

    assert!(!session.is_connected());
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(handle.live().is_stale());
}

/// Subscribe, lose the session, reconnect, and resubscribe from the
/// stored params: the renewed subscription is observably equivalent.
#[tokio::test]
async fn test_resubscribe_after_reconnect() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let client = test_client(&gateway.url());

    let session = client.connect().await.unwrap();
    let original = session
        .subscribe("quotes", json!({"symbol": "EURUSD"}))
        .await
        .unwrap();
    session.disconnect().await;

    let infos = session.subscriptions();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].stale);
    let stored = infos[0].params.clone();

    let session = client.connect().await.unwrap();
    let renewed = session
        .subscribe(&stored.topic, stored.params.clone())
        .await
        .unwrap();
    assert_eq!(renewed.params(), &stored);
    assert!(!renewed.live().is_stale());
    assert!(original.live().is_stale());

    gateway.inject(ServerFrame::Update {
        subscription_id: renewed.id(),
        kind: UpdateKind::Append,
        data: json!({"bid": 1.2}),
    });
    wait_until(|| renewed.live().rows().len() == 1).await;
    assert_eq!(original.live().rows().len(), 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_strict_sync_failure_fails_connect() {
    init_logging();
    let gateway = FakeGateway::start().await;
    gateway.drop_method("positions");

    let client = TradeLinkClient::builder()
        .endpoint(gateway.url())
        .timeouts(
            TradeLinkTimeouts::builder()
                .sync_timeout(Duration::from_millis(200))
                .build(),
        )
        .connection_options(ConnectionOptions::new().with_strict_sync(true))
        .build()
        .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, TradeLinkError::SyncError(_)));
}

#[tokio::test]
async fn test_best_effort_sync_continues_past_failures() {
    init_logging();
    let gateway = FakeGateway::start().await;
    gateway.drop_method("positions");

    let client = TradeLinkClient::builder()
        .endpoint(gateway.url())
        .timeouts(
            TradeLinkTimeouts::builder()
                .sync_timeout(Duration::from_millis(200))
                .build(),
        )
        .build()
        .unwrap();

    let session = client.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.bootstrap(BOOTSTRAP_POSITIONS).is_none());
    assert!(session.bootstrap(BOOTSTRAP_ACCOUNT_STATE).is_some());

    session.disconnect().await;
}

#[tokio::test]
async fn test_read_only_skips_open_orders() {
    init_logging();
    let gateway = FakeGateway::start().await;

    let client = TradeLinkClient::builder()
        .endpoint(gateway.url())
        .connection_options(ConnectionOptions::new().with_read_only(true))
        .build()
        .unwrap();

    let session = client.connect().await.unwrap();
    assert_eq!(gateway.request_count("open_orders"), 0);
    assert_eq!(gateway.request_count("positions"), 1);
    assert_eq!(gateway.request_count("account_state"), 1);

    session.disconnect().await;
}

#[tokio::test]
async fn test_rejected_handshake_fails_connect() {
    init_logging();
    let gateway = FakeGateway::start().await;
    gateway.reject_hello("not authorized");

    let err = test_client(&gateway.url()).connect().await.unwrap_err();
    match err {
        TradeLinkError::ConnectionError(message) => {
            assert!(message.contains("not authorized"), "got: {}", message);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_broadcast_routes_to_topic_listeners() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let client = test_client(&gateway.url());
    let session = client.connect().await.unwrap();

    let mut orders = EventRecorder::subscribe(&client.events(), Topic::OrderStatus);
    let mut accounts = EventRecorder::subscribe(&client.events(), Topic::AccountUpdate);

    gateway.inject(ServerFrame::Broadcast {
        topic: "order_status".to_string(),
        data: json!({"order_id": 9, "status": "filled"}),
    });
    gateway.inject(ServerFrame::Broadcast {
        topic: "account".to_string(),
        data: json!({"equity": 100000.0}),
    });

    match orders.next().await {
        Event::OrderStatus(data) => assert_eq!(data["status"], "filled"),
        other => panic!("unexpected event: {:?}", other),
    }
    match accounts.next().await {
        Event::AccountUpdate(data) => assert_eq!(data["equity"], 100000.0),
        other => panic!("unexpected event: {:?}", other),
    }

    session.disconnect().await;
}

#[tokio::test]
async fn test_fault_fatality_is_classified() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let client = test_client(&gateway.url());
    let session = client.connect().await.unwrap();

    let mut errors = EventRecorder::subscribe(&client.events(), Topic::Error);

    gateway.inject(ServerFrame::Fault {
        code: 2104,
        message: "market data farm connection is OK".to_string(),
    });
    match errors.next().await {
        Event::Error(fault) => assert!(!fault.fatal),
        other => panic!("unexpected event: {:?}", other),
    }

    gateway.inject(ServerFrame::Fault {
        code: FAULT_GATEWAY_UNREACHABLE,
        message: "upstream gone".to_string(),
    });
    match errors.next().await {
        Event::Error(fault) => {
            assert!(fault.fatal);
            assert_eq!(fault.code, FAULT_GATEWAY_UNREACHABLE);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    session.disconnect().await;
}

#[tokio::test]
async fn test_idle_monitor_fires_once_on_silent_line() {
    init_logging();
    let gateway = FakeGateway::start().await;
    let client = test_client(&gateway.url());
    let session = client.connect().await.unwrap();

    let mut idles = EventRecorder::subscribe(&client.events(), Topic::IdleTimeout);
    session.arm_idle_monitor(Duration::from_millis(150));

    match idles.next().await {
        Event::IdleTimeout(quiet) => assert!(quiet >= Duration::from_millis(150)),
        other => panic!("unexpected event: {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(idles.drain(), 0, "monitor is one-shot until re-armed");

    session.disconnect().await;
}
