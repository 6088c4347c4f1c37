//! At-least-once, ordered event delivery across reconnects

mod common;

use std::sync::Arc;
use std::time::Duration;

use hub_sync::database::subscribe_changes_task;
use hub_sync::websocket::{connect_client, serve_host};
use hub_sync::{
    ChangeKind, ClientEvents, ClientIdentity, EventDelivery, EventPayload, HubConfig,
    ProtocolMessage, SyncRequest, SyncTask, TaskResult, UdpClient, UdpServer,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{memory_hub, ChannelOutbound};

fn raw_request(req_id: i64, client_id: &str, event_ack: Option<i64>, tasks: Vec<SyncTask>) -> Vec<u8> {
    serde_json::to_vec(&ProtocolMessage::Request(SyncRequest {
        req_id: Some(req_id),
        user_id: Some(client_id.to_lowercase()),
        client_id: Some(client_id.to_string()),
        event_ack,
        tasks,
        ..Default::default()
    }))
    .unwrap()
}

fn upsert(id: &str) -> SyncTask {
    SyncTask::new(
        "upsert",
        json!({ "container": "articles", "entities": [{ "id": id, "title": id }] }),
    )
}

#[tokio::test]
async fn test_upsert_response_and_event_to_subscriber() {
    let hub = memory_hub();

    let subscriber_out = ChannelOutbound::new();
    let subscriber = hub.connect(subscriber_out.clone());
    subscriber.on_receive(&raw_request(
        1,
        "B",
        None,
        vec![subscribe_changes_task("articles", &ChangeKind::ALL)],
    ));
    assert!(matches!(subscriber_out.next().await, ProtocolMessage::Response(_)));

    let writer_out = ChannelOutbound::new();
    let writer = hub.connect(writer_out.clone());
    writer.on_receive(&raw_request(7, "A", None, vec![upsert("A")]));

    match writer_out.next().await {
        ProtocolMessage::Response(response) => {
            assert_eq!(response.req_id, Some(7));
            assert_eq!(response.results.len(), 1);
            assert!(response.results[0].is_ok());
        }
        other => panic!("unexpected {other:?}"),
    }

    let event = match subscriber_out.next().await {
        ProtocolMessage::Event(event) => event,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(event.seq, 1);
    assert_eq!(event.src_user_id.as_deref(), Some("a"));
    assert!(matches!(
        &event.payload[..],
        [EventPayload::Upsert { entities, .. }] if entities.len() == 1
    ));

    let events = ClientEvents::new(EventDelivery::Immediate);
    let calls = Arc::new(Mutex::new(Vec::new()));
    events.set_handler({
        let calls = Arc::clone(&calls);
        move |_, changes| calls.lock().push(changes.upserts)
    });
    events.on_event(event);
    assert_eq!(*calls.lock(), vec![1]);
}

#[tokio::test]
async fn test_reconnect_resends_only_unacknowledged_events() {
    let hub = memory_hub();

    let first_out = ChannelOutbound::new();
    let first = hub.connect(first_out.clone());
    first.on_receive(&raw_request(
        1,
        "B",
        None,
        vec![subscribe_changes_task("articles", &ChangeKind::ALL)],
    ));
    first_out.next().await;

    let writer_out = ChannelOutbound::new();
    let writer = hub.connect(writer_out.clone());
    for (i, id) in ["a1", "a2", "a3", "a4", "a5"].iter().enumerate() {
        writer.on_receive(&raw_request(i as i64 + 1, "A", None, vec![upsert(id)]));
        writer_out.next().await;
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        match first_out.next().await {
            ProtocolMessage::Event(event) => received.push(event.seq),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(received, vec![1, 2, 3, 4, 5]);

    // connection drops, client comes back having acknowledged only 3
    first.close();
    let second_out = ChannelOutbound::new();
    let second = hub.connect(second_out.clone());
    second.on_receive(&raw_request(2, "B", Some(3), vec![]));

    let mut resent = Vec::new();
    loop {
        match second_out.next().await {
            ProtocolMessage::Event(event) => resent.push(event.seq),
            ProtocolMessage::Response(response) => {
                assert_eq!(response.req_id, Some(2));
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(resent, vec![4, 5]);
    assert!(second_out.drain().await.is_empty());
    assert_eq!(hub.events().retained("B"), 2);

    // acknowledging everything empties the queue and stops resends
    second.on_receive(&raw_request(3, "B", Some(5), vec![]));
    assert!(matches!(second_out.next().await, ProtocolMessage::Response(_)));
    assert_eq!(hub.events().retained("B"), 0);
}

#[tokio::test]
async fn test_client_events_survive_reconnect_over_websocket() {
    let hub = memory_hub();
    let config = HubConfig::default();
    let events = Arc::new(ClientEvents::new(EventDelivery::Immediate));
    let applied = Arc::new(Mutex::new(Vec::new()));
    events.set_handler({
        let applied = Arc::clone(&applied);
        move |event, _| applied.lock().push(event.seq)
    });

    // subscriber on its first connection
    let (client_io, server_io) = tokio::io::duplex(8192);
    tokio::spawn(serve_host(server_io, Arc::clone(&hub), CancellationToken::new()));
    let (subscriber, driver) = connect_client(
        client_io,
        ClientIdentity::new("bob"),
        Arc::clone(&events),
        &config,
    );
    let response = subscriber
        .execute(vec![subscribe_changes_task("articles", &ChangeKind::ALL)])
        .await
        .unwrap();
    let client_id = response.client_id.expect("hub assigns a client id");

    // writer on its own connection
    let (writer_io, server_io) = tokio::io::duplex(8192);
    tokio::spawn(serve_host(server_io, Arc::clone(&hub), CancellationToken::new()));
    let (writer, _writer_driver) = connect_client(
        writer_io,
        ClientIdentity::new("alice"),
        Arc::new(ClientEvents::new(EventDelivery::Immediate)),
        &config,
    );
    for id in ["a1", "a2", "a3"] {
        let response = writer.execute(vec![upsert(id)]).await.unwrap();
        assert_eq!(response.results, vec![TaskResult::with_value(json!({ "count": 1 }))]);
    }
    assert!(common::eventually(|| events.last_seq() == 3).await);

    subscriber.close();
    driver.await.unwrap().unwrap();

    // two more changes while the subscriber is away
    for id in ["a4", "a5"] {
        writer.execute(vec![upsert(id)]).await.unwrap();
    }

    let (client_io, server_io) = tokio::io::duplex(8192);
    tokio::spawn(serve_host(server_io, Arc::clone(&hub), CancellationToken::new()));
    let (subscriber, _driver) = connect_client(
        client_io,
        ClientIdentity::new("bob").with_client_id(client_id),
        Arc::clone(&events),
        &config,
    );
    subscriber.execute(vec![]).await.unwrap();

    assert!(common::eventually(|| events.last_seq() == 5).await);
    assert_eq!(*applied.lock(), vec![1, 2, 3, 4, 5]);
    assert_eq!(events.stats().duplicates, 0);
    assert_eq!(events.with_store(|s| s.len("articles")), 5);
}

#[tokio::test]
async fn test_events_after_unsubscribe_and_resubscribe_are_applied() {
    let hub = memory_hub();
    let events = ClientEvents::new(EventDelivery::Immediate);

    let first_out = ChannelOutbound::new();
    let first = hub.connect(first_out.clone());
    first.on_receive(&raw_request(
        1,
        "B",
        None,
        vec![subscribe_changes_task("articles", &ChangeKind::ALL)],
    ));
    first_out.next().await;

    let writer_out = ChannelOutbound::new();
    let writer = hub.connect(writer_out.clone());
    for (i, id) in ["a1", "a2"].iter().enumerate() {
        writer.on_receive(&raw_request(i as i64 + 1, "A", None, vec![upsert(id)]));
        writer_out.next().await;
    }
    for _ in 0..2 {
        match first_out.next().await {
            ProtocolMessage::Event(event) => events.on_event(event),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(events.last_seq(), 2);

    // unsubscribe while acknowledging everything, then drop the connection
    first.on_receive(&raw_request(
        2,
        "B",
        Some(events.last_seq()),
        vec![subscribe_changes_task("articles", &[])],
    ));
    assert!(matches!(first_out.next().await, ProtocolMessage::Response(_)));
    first.close();
    assert_eq!(hub.events().retained("B"), 0);

    let second_out = ChannelOutbound::new();
    let second = hub.connect(second_out.clone());
    second.on_receive(&raw_request(
        3,
        "B",
        Some(events.last_seq()),
        vec![subscribe_changes_task("articles", &ChangeKind::ALL)],
    ));
    assert!(matches!(second_out.next().await, ProtocolMessage::Response(_)));

    for (i, id) in ["a3", "a4"].iter().enumerate() {
        writer.on_receive(&raw_request(i as i64 + 10, "A", None, vec![upsert(id)]));
        writer_out.next().await;
    }
    for _ in 0..2 {
        match second_out.next().await {
            ProtocolMessage::Event(event) => events.on_event(event),
            other => panic!("unexpected {other:?}"),
        }
    }

    let stats = events.stats();
    assert_eq!(stats.last_seq, 4);
    assert_eq!(stats.applied, 4);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(events.with_store(|s| s.len("articles")), 4);
}

#[tokio::test]
async fn test_events_after_udp_idle_eviction_are_applied() {
    let cancel = CancellationToken::new();
    let server = UdpServer::bind("127.0.0.1:0".parse().unwrap(), memory_hub(), cancel.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).run());
    let config = HubConfig::default();

    let events = Arc::new(ClientEvents::new(EventDelivery::Immediate));
    let subscriber = UdpClient::connect(
        addr,
        None,
        ClientIdentity::new("bob"),
        Arc::clone(&events),
        &config,
    )
    .await
    .unwrap();
    let writer = UdpClient::connect(
        addr,
        None,
        ClientIdentity::new("alice"),
        Arc::new(ClientEvents::new(EventDelivery::Immediate)),
        &config,
    )
    .await
    .unwrap();

    subscriber
        .hub()
        .execute(vec![subscribe_changes_task("articles", &ChangeKind::ALL)])
        .await
        .unwrap();
    writer.hub().execute(vec![upsert("a1")]).await.unwrap();
    assert!(common::eventually(|| events.last_seq() == 1).await);

    // acknowledge and unsubscribe, then let the session expire
    subscriber
        .hub()
        .execute(vec![subscribe_changes_task("articles", &[])])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.evict_idle(Duration::from_millis(10)), 2);

    subscriber
        .hub()
        .execute(vec![subscribe_changes_task("articles", &ChangeKind::ALL)])
        .await
        .unwrap();
    writer.hub().execute(vec![upsert("a2")]).await.unwrap();

    assert!(common::eventually(|| events.last_seq() == 2).await);
    assert_eq!(events.stats().duplicates, 0);
    assert!(events.with_store(|s| s.get("articles", "a2").is_some()));

    writer.close().await;
    subscriber.close().await;
    cancel.cancel();
}
