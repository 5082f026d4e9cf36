//! Integration tests against the real `echo-provider` subprocess.
//!
//! Every test spawns its own provider processes, so they can run in
//! parallel without sharing state.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;

use toolmesh_core::events::{ClientEvent, ManagerEvent};
use toolmesh_core::manager::ProviderStatus;
use toolmesh_core::protocol::discovery::{BatchConfig, DiscoveryBatch, DiscoveryCache, ToolFilter};
use toolmesh_core::{
    ClientConfig, ClientError, ConnectionManager, ExitReason, ManagerConfig, ManagerError,
    ProtocolClient, ProviderConfig,
};

fn echo_provider(name: &str) -> ProviderConfig {
    ProviderConfig::new(name, env!("CARGO_BIN_EXE_echo-provider"))
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 5_000,
        handshake_timeout_ms: 5_000,
        connect_retries: 0,
        retry_delay_ms: 100,
        ..Default::default()
    }
}

fn text(result: &Value) -> &str {
    result["content"][0]["text"].as_str().unwrap_or_default()
}

async fn wait_for<T, F>(rx: &mut broadcast::Receiver<T>, mut matches: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_handshake_then_get_all_tools() {
    let client = ProtocolClient::new(fast_config());
    let mut events = client.subscribe();

    let tools = client.add_provider(echo_provider("beta")).await.unwrap();
    assert!(tools.iter().any(|t| t.name == "echo"));
    client.add_provider(echo_provider("alpha")).await.unwrap();

    let connected = wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert_eq!(connected.name(), "connected");

    let all = client.get_all_tools().await;
    assert_eq!(all.len(), tools.len() * 2);
    assert_eq!(all[0].provider_name, "alpha");
    assert_eq!(all.last().unwrap().provider_name, "beta");

    let caps = client.capabilities("alpha").await.unwrap();
    assert!(caps.get("tools").is_some());
    assert!(client.is_connected("alpha").await);

    let echo = tools.iter().find(|t| t.name == "echo").unwrap();
    assert_eq!(echo.input_schema.as_ref().unwrap()["required"], json!(["text"]));

    client.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_provider_rejected() {
    let client = ProtocolClient::new(fast_config());
    client.add_provider(echo_provider("dup")).await.unwrap();
    assert!(matches!(
        client.add_provider(echo_provider("dup")).await,
        Err(ClientError::ProviderExists(_))
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn test_call_tool_round_trip_and_errors() {
    let client = ProtocolClient::new(fast_config());
    client.add_provider(echo_provider("p")).await.unwrap();

    let result = client
        .call_tool("echo", "p", json!({ "text": "hello" }))
        .await
        .unwrap();
    assert_eq!(text(&result), "hello");

    let sum = client
        .call_tool("add", "p", json!({ "a": 2, "b": 3 }))
        .await
        .unwrap();
    assert_eq!(text(&sum), "5");

    match client.call_tool("fail", "p", Value::Null).await {
        Err(ClientError::Remote { code, message }) => {
            assert_eq!(code, -32000);
            assert_eq!(message, "requested failure");
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    // Tool-level errors come back as results; interpreting them is the caller's job.
    let flagged = client.call_tool("error", "p", json!({})).await.unwrap();
    assert_eq!(flagged["isError"], true);

    assert!(matches!(
        client.call_tool("echo", "nobody", json!({})).await,
        Err(ClientError::NotConnected(_))
    ));

    client.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_resolve_by_id() {
    let client = ProtocolClient::new(fast_config());
    client.add_provider(echo_provider("p")).await.unwrap();

    let slow = client.call_tool("sleep", "p", json!({ "ms": 300 }));
    let fast = client.call_tool("sleep", "p", json!({ "ms": 10 }));
    let echo = client.call_tool("echo", "p", json!({ "text": "x" }));
    let (slow, fast, echo) = tokio::join!(slow, fast, echo);

    assert_eq!(text(&slow.unwrap()), "slept 300ms");
    assert_eq!(text(&fast.unwrap()), "slept 10ms");
    assert_eq!(text(&echo.unwrap()), "x");

    client.shutdown().await;
}

#[tokio::test]
async fn test_request_timeout_keeps_connection() {
    let client = ProtocolClient::new(ClientConfig {
        request_timeout_ms: 200,
        ..fast_config()
    });
    client.add_provider(echo_provider("p")).await.unwrap();

    match client.call_tool("silent", "p", json!({})).await {
        Err(ClientError::Timeout { method, timeout_ms, .. }) => {
            assert_eq!(method, "tools/call");
            assert_eq!(timeout_ms, 200);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(client.is_connected("p").await);

    let result = client
        .call_tool("echo", "p", json!({ "text": "still here" }))
        .await
        .unwrap();
    assert_eq!(text(&result), "still here");

    client.shutdown().await;
}

#[tokio::test]
async fn test_noise_before_replies_is_ignored() {
    let client = ProtocolClient::new(fast_config());
    let provider = echo_provider("noisy").with_env("ECHO_PROVIDER_NOISE", "1");
    let tools = client.add_provider(provider).await.unwrap();
    assert!(!tools.is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn test_crash_triggers_restart() {
    let client = ProtocolClient::new(ClientConfig {
        restart_on_exit: true,
        max_restarts: 3,
        ..fast_config()
    });
    client.add_provider(echo_provider("p")).await.unwrap();
    let mut events = client.subscribe();

    let _ = client.call_tool("crash", "p", json!({ "code": 1 })).await;

    match wait_for(&mut events, |e| matches!(e, ClientEvent::Reconnecting { .. })).await {
        ClientEvent::Reconnecting { attempt, delay_ms, .. } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay_ms, 100);
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;

    assert!(client.is_connected("p").await);
    let result = client
        .call_tool("echo", "p", json!({ "text": "back" }))
        .await
        .unwrap();
    assert_eq!(text(&result), "back");

    client.shutdown().await;
}

#[tokio::test]
async fn test_crash_without_restart_disconnects() {
    let client = ProtocolClient::new(ClientConfig {
        restart_on_exit: false,
        ..fast_config()
    });
    client.add_provider(echo_provider("p")).await.unwrap();
    let mut events = client.subscribe();

    let _ = client.call_tool("crash", "p", json!({ "code": 3 })).await;

    match wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await {
        ClientEvent::Disconnected { reason, .. } => {
            assert_eq!(
                reason,
                ExitReason::Crashed {
                    code: Some(3),
                    signal: None
                }
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!client.is_connected("p").await);
    assert!(matches!(
        client.call_tool("echo", "p", json!({})).await,
        Err(ClientError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_remove_provider_is_requested_exit() {
    let client = ProtocolClient::new(fast_config());
    client.add_provider(echo_provider("p")).await.unwrap();
    let mut events = client.subscribe();

    client.remove_provider("p").await.unwrap();
    match wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await {
        ClientEvent::Disconnected { reason, .. } => assert_eq!(reason, ExitReason::Requested),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(client.providers().await.is_empty());
    assert!(matches!(
        client.remove_provider("p").await,
        Err(ClientError::UnknownProvider(_))
    ));
}

#[tokio::test]
async fn test_manager_supervises_real_provider() {
    let manager = ConnectionManager::with_client(
        ManagerConfig {
            base_delay_ms: 50,
            health_check_interval_ms: 0,
            ..Default::default()
        },
        fast_config(),
        None,
        Default::default(),
    );
    manager.start();
    manager.register_provider(echo_provider("p")).await.unwrap();
    let mut events = manager.subscribe();

    manager.connect("p").await.unwrap();
    assert_eq!(manager.status("p").await.unwrap().status, ProviderStatus::Connected);

    let result = manager
        .call_tool("echo", "p", json!({ "text": "via manager" }))
        .await
        .unwrap();
    assert_eq!(text(&result), "via manager");
    assert!(matches!(
        manager.call_tool("nope", "p", json!({})).await,
        Err(ManagerError::UnknownTool { .. })
    ));

    // A crash is noticed and the manager reconnects on its own.
    let _ = manager.call_tool("crash", "p", json!({})).await;
    wait_for(&mut events, |e| {
        matches!(e, ManagerEvent::ServerDisconnected { unexpected: true, .. })
    })
    .await;
    wait_for(&mut events, |e| matches!(e, ManagerEvent::ServerConnected { .. })).await;
    assert_eq!(manager.status("p").await.unwrap().status, ProviderStatus::Connected);

    let reports = manager.run_health_check().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_healthy());

    manager.disconnect("p").await.unwrap();
    assert_eq!(
        manager.status("p").await.unwrap().status,
        ProviderStatus::Disconnected
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_discovered_tools_are_readable_from_cache() {
    let cache = DiscoveryCache::new(Duration::from_secs(60));
    let client = ProtocolClient::with_discovery(fast_config(), Some(cache.clone()), ToolFilter::default());
    assert!(client.cached_tools("p").is_none());

    let discovered = client.add_provider(echo_provider("p")).await.unwrap();
    assert_eq!(client.cached_tools("p"), Some(discovered.clone()));
    assert_eq!(client.cached_tools("p"), Some(client.list_tools("p").await.unwrap()));
    assert_eq!(client.fetch_tools("p").await.unwrap(), discovered);

    // A later run reads the same set back without starting the provider.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("discovery.json");
    cache.save(&path).unwrap();
    client.shutdown().await;

    let reloaded = DiscoveryCache::load(&path, Duration::from_secs(60)).unwrap();
    let offline = ProtocolClient::with_discovery(fast_config(), Some(reloaded), ToolFilter::default());
    assert_eq!(offline.cached_tools("p"), Some(discovered));
    assert!(!offline.is_connected("p").await);
}

#[tokio::test]
async fn test_discover_batched_streams_every_tool() {
    let client = ProtocolClient::new(fast_config());
    client.add_provider(echo_provider("a")).await.unwrap();
    client.add_provider(echo_provider("b")).await.unwrap();
    let all = client.get_all_tools().await;

    let batches: Vec<DiscoveryBatch> = client
        .discover_batched(BatchConfig {
            batch_size: 4,
            max_concurrent_batches: 1,
            batch_delay_ms: 0,
            priority_keywords: vec!["numbers".into()],
        })
        .await
        .collect()
        .await;

    let total = all.len().div_ceil(4);
    assert_eq!(batches.len(), total);
    for (i, batch) in batches.iter().enumerate() {
        assert_eq!(batch.index, i);
        assert_eq!(batch.total, total);
        assert!(batch.tools.len() <= 4);
    }
    let streamed: Vec<_> = batches.iter().flat_map(|b| b.tools.iter()).collect();
    assert_eq!(streamed.len(), all.len());
    // "Add two numbers" matches the keyword, so both `add` tools lead.
    assert_eq!(streamed[0].tool.name, "add");
    assert_eq!(streamed[1].tool.name, "add");

    client.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_provider_is_replaced() {
    let manager = ConnectionManager::with_client(
        ManagerConfig {
            base_delay_ms: 50,
            health_check_interval_ms: 0,
            ..Default::default()
        },
        ClientConfig {
            request_timeout_ms: 300,
            ..fast_config()
        },
        None,
        Default::default(),
    );
    manager
        .register_provider(echo_provider("p").with_env("ECHO_PROVIDER_MUTE_AFTER_HANDSHAKE", "1"))
        .await
        .unwrap();
    manager.connect("p").await.unwrap();
    let mut events = manager.subscribe();

    // The handshake succeeded but tools/list now goes unanswered.
    let reports = manager.run_health_check().await;
    assert!(!reports[0].is_healthy());

    wait_for(&mut events, |e| matches!(e, ManagerEvent::ServerConnected { .. })).await;
    let status = manager.status("p").await.unwrap();
    assert_eq!(status.status, ProviderStatus::Connected);
    assert_eq!(status.retry_count, 0);
    assert!(!manager.available_tools().await.is_empty());

    manager.shutdown().await;
}
