use flowsync_core::{DocumentEvent, FlowSession, SessionError, SyncState};
use flowsync_model::{Entity, EntityId, EntityKind, Group, Node, PositionUpdate};
use flowsync_test_utils::{
    converged, eventually, fields, inject_node, ready_session, ready_sessions, subflow, tab,
    test_config, SYNC_TIMEOUT,
};
use flowsync_transport::{FaultConfig, MemoryHub, RelayServer, TcpConnector};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn id(s: &str) -> EntityId {
    EntityId::from(s)
}

#[tokio::test]
async fn test_node_add_reaches_other_replica() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    a.add_node(tab("ws1", "Flow 1").into()).unwrap();
    let node = Entity::from_fields(fields(json!({
        "id": "n1",
        "type": "inject",
        "name": "test-sync-node",
        "x": 200,
        "y": 200,
        "z": "ws1"
    })))
    .unwrap();
    a.add_node(node).unwrap();

    eventually("node visible on b", || b.get(&id("n1")).is_some()).await;
    let seen = b.get(&id("n1")).unwrap();
    assert_eq!(seen.name(), Some("test-sync-node"));
    assert_eq!(seen.type_name(), "inject");

    let doc = b.get_document().unwrap();
    let n = &doc.nodes[&id("n1")];
    assert_eq!((n.x, n.y), (200.0, 200.0));
}

#[tokio::test]
async fn test_workspace_add_then_remove() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    let workspace = Entity::from_fields(fields(json!({
        "id": "tab1",
        "type": "tab",
        "label": "Sync Test Tab"
    })))
    .unwrap();
    a.add_node(workspace).unwrap();
    eventually("tab visible on b", || {
        b.get_document().is_some_and(|doc| {
            doc.workspaces
                .get(&id("tab1"))
                .is_some_and(|w| w.label == "Sync Test Tab")
        })
    })
    .await;

    a.remove_node(&id("tab1"), Some(EntityKind::Workspace)).unwrap();
    eventually("tab gone on b", || b.get(&id("tab1")).is_none()).await;
    assert!(b.get_document().unwrap().workspace_order.is_empty());
}

#[tokio::test]
async fn test_node_update_and_position() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    a.add_node(tab("ws1", "Flow 1").into()).unwrap();
    a.add_node(inject_node("n1", "before", "ws1").into()).unwrap();
    a.add_node(inject_node("n2", "other", "ws1").into()).unwrap();
    eventually("nodes on b", || b.get(&id("n2")).is_some()).await;

    assert!(b.update_node(&id("n1"), fields(json!({"name": "after"}))).unwrap());
    let moved = b
        .batch_position_update(&[
            PositionUpdate::new("n1", 10.0, 20.0),
            PositionUpdate::new("n2", 30.0, 40.0),
            PositionUpdate::new("ghost", 0.0, 0.0),
        ])
        .unwrap();
    assert_eq!(moved, 2);

    eventually("update visible on a", || {
        a.get_document().is_some_and(|doc| {
            let n1 = &doc.nodes[&id("n1")];
            let n2 = &doc.nodes[&id("n2")];
            n1.name.as_deref() == Some("after")
                && (n1.x, n1.y) == (10.0, 20.0)
                && (n2.x, n2.y) == (30.0, 40.0)
        })
    })
    .await;
}

#[tokio::test]
async fn test_rename_then_disable_composes() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    a.add_node(tab("ws1", "Flow 1").into()).unwrap();
    eventually("tab on b", || b.get(&id("ws1")).is_some()).await;

    a.update_node(&id("ws1"), fields(json!({"label": "Renamed"}))).unwrap();
    b.update_node(&id("ws1"), fields(json!({"disabled": true}))).unwrap();

    let composed = |s: &FlowSession| {
        s.get_document().is_some_and(|doc| {
            let ws = &doc.workspaces[&id("ws1")];
            ws.label == "Renamed" && ws.disabled
        })
    };
    eventually("both fields on a", || composed(&a)).await;
    eventually("both fields on b", || composed(&b)).await;
}

#[tokio::test]
async fn test_concurrent_adds_both_survive() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    a.add_node(tab("ws-a", "From A").into()).unwrap();
    b.add_node(tab("ws-b", "From B").into()).unwrap();
    a.add_node(inject_node("na", "a", "ws-a").into()).unwrap();
    b.add_node(inject_node("nb", "b", "ws-b").into()).unwrap();

    let sessions = [a, b];
    eventually("replicas converge", || converged(&sessions)).await;
    let doc = sessions[0].get_document().unwrap();
    assert_eq!(doc.nodes.len(), 2);
    assert_eq!(doc.workspaces.len(), 2);
}

#[tokio::test]
async fn test_concurrent_rename_keeps_siblings() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    a.add_node(tab("ws1", "Flow 1").into()).unwrap();
    eventually("tab on b", || b.get(&id("ws1")).is_some()).await;

    // Cut both off so the renames are concurrent
    hub.set_online(false);
    eventually("a degraded", || !a.sync_state().is_synced()).await;
    eventually("b degraded", || !b.sync_state().is_synced()).await;
    a.update_node(&id("ws1"), fields(json!({"label": "Left"}))).unwrap();
    b.update_node(&id("ws1"), fields(json!({"label": "Right"}))).unwrap();
    hub.set_online(true);

    let sessions = [a, b];
    eventually("replicas converge", || {
        converged(&sessions) && sessions[0].conflicts(&id("ws1"), "label").len() == 2
    })
    .await;

    let label = sessions[0].get_document().unwrap().workspaces[&id("ws1")].label.clone();
    let siblings = sessions[1].conflicts(&id("ws1"), "label");
    assert_eq!(siblings.last(), Some(&json!(label)));
    assert!(siblings.contains(&json!("Left")));
    assert!(siblings.contains(&json!("Right")));
}

#[tokio::test]
async fn test_subflow_add_and_remove() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    a.add_node(subflow("sf1", "Reusable").into()).unwrap();
    a.add_node(Node::new("inner", "function").on("sf1").into()).unwrap();
    eventually("subflow on b", || b.get(&id("inner")).is_some()).await;
    assert_eq!(b.get(&id("sf1")).map(|e| e.kind()), Some(EntityKind::Subflow));

    // Kind hint is advisory
    b.remove_node(&id("sf1"), None).unwrap();
    eventually("subflow gone on a", || {
        a.get(&id("sf1")).is_none() && a.get(&id("inner")).is_none()
    })
    .await;
}

#[tokio::test]
async fn test_workspace_removal_takes_children() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    a.add_node(tab("ws1", "Flow 1").into()).unwrap();
    a.add_node(inject_node("n1", "x", "ws1").into()).unwrap();
    a.add_node(Group::new("g1", "ws1").into()).unwrap();
    eventually("children on b", || b.get(&id("g1")).is_some()).await;

    b.remove_node(&id("ws1"), Some(EntityKind::Workspace)).unwrap();
    assert!(b.get(&id("n1")).is_none());

    eventually("children gone on a", || {
        a.get_document().is_some_and(|doc| {
            doc.nodes.is_empty() && doc.groups.is_empty() && doc.workspaces.is_empty()
        })
    })
    .await;

    // Tombstoned ids cannot come back
    assert!(matches!(
        a.add_node(tab("ws1", "Again").into()),
        Err(SessionError::Merge(_))
    ));
}

#[tokio::test]
async fn test_workspace_order_last_writer() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    a.add_node(tab("ws1", "One").into()).unwrap();
    a.add_node(tab("ws2", "Two").into()).unwrap();
    a.set_workspace_order(vec![id("ws1"), id("ws2")]).unwrap();
    eventually("order on b", || {
        b.get_document().is_some_and(|doc| doc.workspace_order == vec![id("ws1"), id("ws2")])
    })
    .await;

    b.add_node(tab("ws3", "Three").into()).unwrap();
    b.set_workspace_order(vec![id("ws3"), id("ws2"), id("ws1")]).unwrap();

    let sessions = [a, b];
    eventually("order converges", || converged(&sessions)).await;
    assert_eq!(
        sessions[0].get_document().unwrap().workspace_order,
        vec![id("ws3"), id("ws2"), id("ws1")]
    );
}

#[tokio::test]
async fn test_remote_events_are_published() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();
    let mut events = b.subscribe();

    a.add_node(tab("ws1", "Flow 1").into()).unwrap();

    let event = tokio::time::timeout(SYNC_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        DocumentEvent::RemoteChange { changes, touched } => {
            assert_eq!(changes.len(), 1);
            assert!(touched.contains(&id("ws1")));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_edits_while_offline_arrive_after_reconnect() {
    let hub = MemoryHub::new();
    let [a, b]: [FlowSession; 2] = ready_sessions(&hub, 2).await.try_into().unwrap();

    hub.set_online(false);
    eventually("a degraded", || matches!(a.sync_state(), SyncState::Degraded { .. })).await;

    // Still editable once ready, even without a relay
    a.add_node(tab("ws1", "Offline").into()).unwrap();
    a.add_node(inject_node("n1", "queued", "ws1").into()).unwrap();
    assert!(b.get(&id("n1")).is_none());

    hub.set_online(true);
    eventually("queued edits reach b", || b.get(&id("n1")).is_some()).await;
    eventually("a synced again", || a.sync_state().is_synced()).await;
}

#[tokio::test]
async fn test_late_joiner_gets_full_document() {
    let hub = MemoryHub::new();
    let a = ready_session(&hub).await;
    a.add_node(tab("ws1", "Flow 1").into()).unwrap();
    for i in 0..10 {
        a.add_node(inject_node(&format!("n{i}"), "n", "ws1").into()).unwrap();
    }
    eventually("relay has everything", || hub.stats().changes_stored == 11).await;

    let late = ready_session(&hub).await;
    assert_eq!(late.get_document(), a.get_document());
}

#[tokio::test]
async fn test_lossy_hub_converges() {
    let hub = MemoryHub::new();
    let sessions = ready_sessions(&hub, 3).await;
    hub.set_faults(
        FaultConfig::none()
            .with_drop_rate(0.3)
            .with_duplicate_rate(0.2)
            .with_max_delay(Duration::from_millis(20))
            .with_seed(7),
    );

    for (i, s) in sessions.iter().enumerate() {
        let ws = format!("ws{i}");
        s.add_node(tab(&ws, "Flow").into()).unwrap();
        for n in 0..5 {
            s.add_node(inject_node(&format!("{ws}-n{n}"), "n", &ws).into())
                .unwrap();
        }
    }

    eventually("lossy replicas converge", || {
        converged(&sessions) && sessions[0].get_document().is_some_and(|d| d.nodes.len() == 15)
    })
    .await;
}

#[tokio::test]
async fn test_sessions_over_tcp_relay() {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(server.run(std::future::pending()));

    let start = || {
        let config = test_config().with_relay_addr(addr.clone());
        let connector = Arc::new(TcpConnector::new(config.relay_addr.clone()));
        FlowSession::start(config, connector).unwrap()
    };
    let a = start();
    let b = start();
    a.wait_ready(SYNC_TIMEOUT).await.unwrap();
    b.wait_ready(SYNC_TIMEOUT).await.unwrap();

    a.add_node(tab("ws1", "Sync Test Tab").into()).unwrap();
    a.add_node(inject_node("n1", "test-sync-node", "ws1").into()).unwrap();
    eventually("node over tcp", || {
        b.get(&id("n1")).is_some_and(|n| n.name() == Some("test-sync-node"))
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
    assert_eq!(a.sync_state(), SyncState::Stopped);
}
