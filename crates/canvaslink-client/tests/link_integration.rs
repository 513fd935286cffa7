//! End-to-end tests running the relay in-process: one link plays the
//! executor (plugin) side of a channel, another plays the automation side.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;

use canvaslink_client::{
    CommandExecutor, ConnectionState, ExecError, Link, LinkConfig, LinkError, ManualScheduler,
    ProgressReporter,
};
use canvaslink_protocol::ProgressStatus;
use canvaslink_relay::ChannelRegistry;

async fn start_relay() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(canvaslink_relay::serve(
        listener,
        Arc::new(ChannelRegistry::new()),
    ));
    port
}

fn link_config(port: u16) -> LinkConfig {
    LinkConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..LinkConfig::default()
    }
}

async fn connected(config: LinkConfig, channel: &str) -> Link {
    let link = Link::connect(config, channel);
    link.wait_for_state(|s| *s == ConnectionState::Connected)
        .await;
    link
}

/// Joins have been sent when `Connected` is observed, but give the relay a
/// beat to register both parties before traffic flows.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn command_roundtrip_through_the_relay() {
    let port = start_relay().await;

    let mut plugin = connected(link_config(port), "roundtrip").await;
    let mut executor = CommandExecutor::new();
    executor.register("create_rectangle", |params: Value| async move {
        let width = params
            .get("width")
            .and_then(Value::as_u64)
            .ok_or_else(|| ExecError::Validation("width is required".to_string()))?;
        Ok(json!({"id": "123:456", "width": width}))
    });
    executor.register("delete_node", |_params: Value| async move {
        Err::<Value, _>(ExecError::NotFound("node 9:12".to_string()))
    });
    let requests = plugin.take_requests().unwrap();
    tokio::spawn(executor.run(requests, plugin.responder()));

    let automation = connected(link_config(port), "roundtrip").await;
    settle().await;

    let dispatcher = automation.dispatcher();
    let result = dispatcher
        .dispatch("create_rectangle", json!({"width": 100}))
        .await
        .unwrap();
    assert_eq!(result["id"], "123:456");
    assert_eq!(result["width"], 100);
    assert_eq!(dispatcher.pending_count(), 0);

    // Typed errors survive the trip through the channel.
    let err = dispatcher.dispatch("delete_node", json!({})).await.unwrap_err();
    assert!(matches!(err, LinkError::NotFound(ref what) if what == "node 9:12"));

    let err = dispatcher
        .dispatch("set_fill_color", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Remote(ref msg) if msg == "unknown command: set_fill_color"));

    automation.close().await;
    plugin.close().await;
}

#[tokio::test]
async fn dispatch_times_out_when_no_peer_answers() {
    let port = start_relay().await;
    let lonely = connected(link_config(port), "nobody-home").await;
    settle().await;

    let dispatcher = lonely.dispatcher();
    let err = dispatcher
        .dispatch_with_timeout("get_selection", json!({}), Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Timeout { ref command } if command == "get_selection"));
    assert_eq!(dispatcher.pending_count(), 0);

    lonely.close().await;
}

#[tokio::test]
async fn connection_loss_rejects_everything_in_flight() {
    // Mini-server: accepts one socket, swallows the join frame plus two
    // requests, then drops the connection.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        use futures_util::StreamExt;
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        for _ in 0..3 {
            if socket.next().await.is_none() {
                break;
            }
        }
    });

    let scheduler = ManualScheduler::new();
    let link = Link::connect_with_scheduler(link_config(port), "doomed", scheduler.clone());
    link.wait_for_state(|s| *s == ConnectionState::Connected)
        .await;

    let dispatcher = link.dispatcher();
    let first = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch_with_timeout("get_selection", json!({}), Duration::from_secs(30))
                .await
        })
    };
    let second = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch_with_timeout("get_document_info", json!({}), Duration::from_secs(30))
                .await
        })
    };

    assert!(matches!(
        first.await.unwrap().unwrap_err(),
        LinkError::ConnectionLost
    ));
    assert!(matches!(
        second.await.unwrap().unwrap_err(),
        LinkError::ConnectionLost
    ));
    assert_eq!(dispatcher.pending_count(), 0);

    // The loss schedules a first reconnect attempt.
    let state = link
        .wait_for_state(|s| matches!(s, ConnectionState::ReconnectScheduled { .. }))
        .await;
    assert_eq!(state, ConnectionState::ReconnectScheduled { attempt: 1 });

    link.close().await;
}

#[tokio::test]
async fn progress_events_reach_the_peer() {
    let port = start_relay().await;

    let plugin = connected(link_config(port), "bulk-scan").await;
    let mut automation = connected(link_config(port), "bulk-scan").await;
    settle().await;

    let mut progress = automation.take_progress().unwrap();
    let reporter = ProgressReporter::new("scan_text_nodes", plugin.progress_sink());

    let items: Vec<u32> = (0..23).collect();
    let results = reporter
        .scan_in_chunks(items, 10, |chunk| async move {
            Ok::<_, LinkError>(chunk)
        })
        .await
        .unwrap();
    assert_eq!(results.len(), 23);

    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), progress.recv())
            .await
            .expect("progress event before timeout")
            .expect("progress stream open");
        let terminal = matches!(
            event.status,
            ProgressStatus::Completed | ProgressStatus::Error
        );
        events.push(event);
        if terminal {
            break;
        }
    }

    assert_eq!(events.len(), 5);
    assert_eq!(events[0].status, ProgressStatus::Started);
    for window in events.windows(2) {
        assert!(window[1].progress >= window[0].progress);
        assert_eq!(window[0].command_id, window[1].command_id);
    }
    let last = events.last().unwrap();
    assert_eq!(last.status, ProgressStatus::Completed);
    assert_eq!(last.progress, 100);
    assert_eq!(last.processed_items, 23);

    automation.close().await;
    plugin.close().await;
}
