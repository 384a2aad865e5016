//! End-to-end tests: two communicators on one machine sharing a loopback
//! discovery registry and real TCP sockets.
//!
//! Run with: cargo test -p communicate-wire --test end_to_end

use communicate_types::{
    ActivityState, CommunicatorConfig, ConnectionState, DataKind, ErrorCode, ServiceDescriptor,
    TxtRecordSet,
};
use communicate_wire::{Communicator, CommunicatorEvent, LoopbackDiscovery, Payload};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn node(name: &str, discovery: &LoopbackDiscovery) -> Communicator {
    let config = CommunicatorConfig {
        name: name.into(),
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        resolve_timeout_secs: 1,
        ..Default::default()
    };
    Communicator::new(config, Arc::new(discovery.clone())).unwrap()
}

async fn next_matching<T>(
    events: &mut broadcast::Receiver<CommunicatorEvent>,
    mut pick: impl FnMut(CommunicatorEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(found) = pick(events.recv().await.unwrap()) {
                return found;
            }
        }
    })
    .await
    .expect("event not received in time")
}

#[tokio::test]
async fn test_publish_search_connect_and_send() {
    let discovery = LoopbackDiscovery::new();
    let server = node("Test", &discovery);
    let client = node("Client", &discovery);
    let mut server_events = server.subscribe();
    let mut client_events = client.subscribe();

    server.start_listening().await.unwrap();
    let txt: TxtRecordSet = [("v", "1")].into_iter().collect();
    server.publish_self(txt).await.unwrap();
    let advertised = server.advertised().unwrap();

    client.start_searching().await.unwrap();
    let services = next_matching(&mut client_events, |e| match e {
        CommunicatorEvent::ServicesUpdated(services) if !services.is_empty() => Some(services),
        _ => None,
    })
    .await;
    assert_eq!(services, vec![advertised.clone()]);

    let outbound = client.connect_to(&services[0]);
    outbound.wait_connected().await.unwrap();

    let inbound = next_matching(&mut server_events, |e| match e {
        CommunicatorEvent::IncomingConnection(c) => Some(c),
        _ => None,
    })
    .await;
    assert_eq!(inbound.state(), ConnectionState::Connected);

    // The server's TXT records reach the client through the monitor.
    let records = next_matching(&mut client_events, |e| match e {
        CommunicatorEvent::TxtRecordsUpdated { records, .. } => Some(records),
        _ => None,
    })
    .await;
    assert_eq!(records.get("v"), Some("1"));

    outbound.send_text("0123456789").await.unwrap();
    let received = inbound.recv().await.unwrap().unwrap();
    assert_eq!(received.kind, DataKind::TEXT);
    assert_eq!(received.length(), 10);
    assert_eq!(received.payload, Payload::text("0123456789"));

    // Connecting again reuses the live connection.
    assert_eq!(client.connect_to(&services[0]).id(), outbound.id());

    inbound
        .send_object(&serde_json::json!({"reply": true}))
        .await
        .unwrap();
    let reply = outbound.recv().await.unwrap().unwrap();
    assert_eq!(reply.kind, DataKind::JSON_OBJECT);
    assert_eq!(reply.payload, Payload::Object(serde_json::json!({"reply": true})));
}

#[tokio::test]
async fn test_send_to_all_reaches_every_peer() {
    let discovery = LoopbackDiscovery::new();
    let hub = node("Hub", &discovery);
    let mut hub_events = hub.subscribe();
    let port = hub.start_listening().await.unwrap().port();
    hub.publish_self(TxtRecordSet::new()).await.unwrap();

    let spokes = [node("One", &discovery), node("Two", &discovery)];
    let mut outbound = Vec::new();
    for spoke in &spokes {
        let connection = spoke.connect_to(&ServiceDescriptor::new("Hub", "communicate", "local", port));
        connection.wait_connected().await.unwrap();
        outbound.push(connection);
    }
    for _ in 0..2 {
        next_matching(&mut hub_events, |e| match e {
            CommunicatorEvent::IncomingConnection(c) => Some(c),
            _ => None,
        })
        .await;
    }

    let failures = hub.send_to_all(DataKind::TEXT, &Payload::text("hello")).await;
    assert!(failures.is_empty());
    for connection in &outbound {
        let data = connection.recv().await.unwrap().unwrap();
        assert_eq!(data.payload, Payload::text("hello"));
    }
}

#[tokio::test]
async fn test_unknown_service_times_out() {
    let discovery = LoopbackDiscovery::new();
    let client = node("Client", &discovery);
    let mut events = client.subscribe();

    let missing = ServiceDescriptor::new("Ghost", "communicate", "local", 4000);
    let connection = client.connect_to(&missing);
    assert!(connection.wait_connected().await.is_err());
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert_eq!(connection.last_error(), Some(ErrorCode::ResolvingTimedOut));

    let error = next_matching(&mut events, |e| match e {
        CommunicatorEvent::ConnectionStateChanged {
            state: ConnectionState::Failed,
            error,
            ..
        } => Some(error),
        _ => None,
    })
    .await;
    assert_eq!(error, Some(ErrorCode::ResolvingTimedOut));
}

#[tokio::test]
async fn test_search_orders_and_tracks_removal() {
    let discovery = LoopbackDiscovery::new();
    let a = node("A", &discovery);
    let b = node("B", &discovery);
    let observer = node("Observer", &discovery);

    a.publish(
        ServiceDescriptor::new("A", "communicate", "local", 5000),
        TxtRecordSet::new(),
    )
    .await
    .unwrap();
    let mut events = observer.subscribe();
    observer.start_searching().await.unwrap();
    b.publish(
        ServiceDescriptor::new("B", "communicate", "local", 5001),
        TxtRecordSet::new(),
    )
    .await
    .unwrap();
    // Publishing again while published adds nothing.
    a.publish(
        ServiceDescriptor::new("A", "communicate", "local", 5000),
        TxtRecordSet::new(),
    )
    .await
    .unwrap();

    next_matching(&mut events, |e| match e {
        CommunicatorEvent::ServicesUpdated(s) if s.len() == 2 => Some(()),
        _ => None,
    })
    .await;
    let names: Vec<String> = observer
        .discovered_services()
        .iter()
        .map(|d| d.name().to_string())
        .collect();
    assert_eq!(names, vec!["A", "B"]);

    a.unpublish().await;
    let remaining = next_matching(&mut events, |e| match e {
        CommunicatorEvent::ServicesUpdated(s) if s.len() == 1 => Some(s),
        _ => None,
    })
    .await;
    assert_eq!(remaining[0].name(), "B");
}

#[tokio::test]
async fn test_stop_closes_everything() {
    let discovery = LoopbackDiscovery::new();
    let server = node("Server", &discovery);
    let client = node("Client", &discovery);
    let mut server_events = server.subscribe();

    server.start_listening().await.unwrap();
    server.publish_self(TxtRecordSet::new()).await.unwrap();
    client.start_searching().await.unwrap();

    let outbound = client.connect_to(&server.advertised().unwrap());
    outbound.wait_connected().await.unwrap();
    let inbound = next_matching(&mut server_events, |e| match e {
        CommunicatorEvent::IncomingConnection(c) => Some(c),
        _ => None,
    })
    .await;

    server.stop().await;
    assert_eq!(server.publishing_state().0, ActivityState::Stopped);
    assert_eq!(server.listening_state().0, ActivityState::Stopped);
    assert!(server.connections().is_empty());
    assert_eq!(inbound.state(), ConnectionState::Closed);
    assert!(discovery.published().is_empty());

    // The client notices the peer went away.
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        outbound.wait_for(|s| s.is_terminal()),
    )
    .await
    .unwrap();
    assert_eq!(state, ConnectionState::Closed);
    assert_eq!(outbound.last_error(), Some(ErrorCode::ConnectionClosed));

    client.stop().await;
    assert_eq!(client.searching_state().0, ActivityState::Stopped);
}
