// End-to-end tests for the gateway over real WebSocket connections

mod test_utils;

use hermes::gateway::address;
use hermes::gateway::model::TimeRange;
use hermes::gateway::{Command, Frame, Repository};
use serde_json::json;
use std::time::Duration;
use test_utils::*;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_direct_message_end_to_end() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");
    let bob = gw.user("bob");

    let mut bob_client = gw.connect(&bob).await;
    assert!(bob_client.subscribe(&address::private_queue(bob.id)).await);

    let mut alice_client = gw.connect(&alice).await;
    assert!(alice_client.subscribe(&address::direct_ack(alice.id)).await);

    alice_client
        .send_json(
            address::SEND_DIRECT,
            json!({"content": "hi", "senderId": alice.id.0, "receiverId": bob.id.0, "correlationToken": 42}),
        )
        .await;

    let delivered = bob_client
        .recv_json(&address::private_queue(bob.id))
        .await
        .expect("bob got nothing");
    assert_eq!(delivered["content"], "hi");
    assert_eq!(delivered["senderId"], alice.id.0);
    assert_eq!(delivered["receiverId"], bob.id.0);
    assert_eq!(delivered["correlationToken"], 42);

    let ack = alice_client
        .recv_json(&address::direct_ack(alice.id))
        .await
        .expect("alice got no ack");
    assert_eq!(ack, json!({"correlationToken": 42, "outcome": "sent"}));

    let history = gw
        .store
        .messages_between(alice.id, bob.id, TimeRange::last_hours(1))
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "hi");
}

#[tokio::test]
async fn test_handshake_without_token_is_refused() {
    let gw = TestGateway::start().await;

    assert!(StompClient::open(&gw.url(None)).await.is_err());
    assert!(StompClient::open(&gw.url(Some("not-a-token"))).await.is_err());
    assert!(gw.gateway.sessions().is_empty());
}

#[tokio::test]
async fn test_connect_without_header_is_refused() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");
    let bob = gw.user("bob");
    let token = gw.token(&alice);

    let mut client = StompClient::open(&gw.url(Some(&token))).await.unwrap();
    client.send(connect_frame(None)).await;

    let reply = client.recv().await.expect("no reply to CONNECT");
    assert_eq!(reply.command, Command::Error);

    // Nothing after the refusal is processed
    client
        .send_json(
            address::SEND_DIRECT,
            json!({"content": "sneaky", "senderId": alice.id.0, "receiverId": bob.id.0}),
        )
        .await;
    assert!(client.recv().await.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gw.gateway.sessions().is_empty());
    assert!(gw
        .store
        .messages_between(alice.id, bob.id, TimeRange::last_hours(1))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_connect_with_other_identity_is_refused() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");
    let mallory = gw.user("mallory");

    let mut client = StompClient::open(&gw.url(Some(&gw.token(&alice)))).await.unwrap();
    client.send(connect_frame(Some(&gw.token(&mallory)))).await;

    let reply = client.recv().await.expect("no reply to CONNECT");
    assert_eq!(reply.command, Command::Error);
    assert!(gw.gateway.sessions().is_empty());
}

#[tokio::test]
async fn test_connect_deadline() {
    let gw = TestGateway::start_with(|config| config.auth.connect_timeout_ms = 200).await;
    let alice = gw.user("alice");

    let mut client = StompClient::open(&gw.url(Some(&gw.token(&alice)))).await.unwrap();

    let reply = client.recv().await.expect("connection closed without ERROR");
    assert_eq!(reply.command, Command::Error);
    assert_eq!(reply.get("message"), Some("connect timeout"));
}

#[tokio::test]
async fn test_cannot_subscribe_to_another_private_queue() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");
    let bob = gw.user("bob");

    let mut client = gw.connect(&alice).await;
    assert!(!client.subscribe(&address::private_queue(bob.id)).await);
    assert_eq!(gw.gateway.hub().subscriber_count(&address::private_queue(bob.id)), 0);
}

#[tokio::test]
async fn test_cannot_subscribe_to_another_group_ack() {
    let gw = TestGateway::start().await;
    let erin = gw.user("erin");
    let mallory = gw.user("mallory");

    let mut client = gw.connect(&mallory).await;
    assert!(!client.subscribe(&address::group_ack(erin.id)).await);
    assert_eq!(gw.gateway.hub().subscriber_count(&address::group_ack(erin.id)), 0);
}

#[tokio::test]
async fn test_presence_notices() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");
    let bob = gw.user("bob");

    let mut watcher = gw.connect(&bob).await;
    assert!(watcher.subscribe(address::STATUS).await);

    let client = gw.connect(&alice).await;
    let online = watcher.recv_message(address::STATUS).await.expect("no online notice");
    assert_eq!(online.body, "alice is online");
    assert!(gw.store.is_online(alice.id).unwrap());

    client.disconnect().await;
    let offline = watcher.recv_message(address::STATUS).await.expect("no offline notice");
    assert_eq!(offline.body, "alice is offline");

    let store = gw.store.clone();
    assert!(wait_for(|| !store.is_online(alice.id).unwrap(), 2).await);
    assert!(gw.gateway.sessions().connections_of(alice.id).is_empty());
}

#[tokio::test]
async fn test_second_device_keeps_identity_online() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");

    let phone = gw.connect(&alice).await;
    let laptop = gw.connect(&alice).await;

    let sessions = gw.gateway.sessions();
    assert!(wait_for(|| sessions.connections_of(alice.id).len() == 2, 2).await);

    phone.disconnect().await;
    assert!(wait_for(|| sessions.connections_of(alice.id).len() == 1, 2).await);
    assert!(gw.store.is_online(alice.id).unwrap());

    laptop.disconnect().await;
    let store = gw.store.clone();
    assert!(wait_for(|| !store.is_online(alice.id).unwrap(), 2).await);
}

#[tokio::test]
async fn test_group_message_end_to_end() {
    let gw = TestGateway::start().await;
    let erin = gw.user("erin");
    let bob = gw.user("bob");
    let group = gw.store.create_group("team", erin.id, &[bob.id]).unwrap();

    let mut member = gw.connect(&bob).await;
    assert!(member.subscribe(&address::group_topic(group.id)).await);

    let mut sender = gw.connect(&erin).await;
    assert!(sender.subscribe(&address::group_ack(erin.id)).await);

    sender
        .send_json(
            address::SEND_GROUP,
            json!({"content": "standup", "senderId": erin.id.0, "groupId": group.id.0, "tempId": "g-1"}),
        )
        .await;

    let broadcast = member
        .recv_json(&address::group_topic(group.id))
        .await
        .expect("member got nothing");
    assert_eq!(broadcast["content"], "standup");
    assert_eq!(broadcast["groupId"], group.id.0);
    assert_eq!(broadcast["senderName"], "erin");

    let ack = sender
        .recv_json(&address::group_ack(erin.id))
        .await
        .expect("sender got no ack");
    assert_eq!(ack, json!({"correlationToken": "g-1", "outcome": "sent"}));
}

#[tokio::test]
async fn test_forged_sender_is_rejected() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");
    let bob = gw.user("bob");

    let mut client = gw.connect(&alice).await;
    assert!(client.subscribe(&address::direct_ack(alice.id)).await);

    client
        .send_json(
            address::SEND_DIRECT,
            json!({"content": "as bob", "senderId": bob.id.0, "receiverId": alice.id.0, "correlationToken": 1}),
        )
        .await;
    let honest = client
        .send_json_receipted(
            address::SEND_DIRECT,
            json!({"content": "as alice", "senderId": alice.id.0, "receiverId": bob.id.0, "correlationToken": 2}),
        )
        .await;

    // Sends are handled in order, so an ack for the forged one would come first
    let ack = client
        .recv_json(&address::direct_ack(alice.id))
        .await
        .expect("no ack for the honest send");
    assert_eq!(ack["correlationToken"], 2);
    assert!(client.await_receipt(&honest).await);

    let history = gw
        .store
        .messages_between(alice.id, bob.id, TimeRange::last_hours(1))
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender_id, alice.id);
}

#[tokio::test]
async fn test_rejected_send_keeps_connection() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");
    let bob = gw.user("bob");

    let mut client = gw.connect(&alice).await;
    assert!(client.subscribe(&address::direct_ack(alice.id)).await);

    // Blank content is a validation failure: no ack and the connection stays open
    client
        .send_json(
            address::SEND_DIRECT,
            json!({"content": "  ", "senderId": alice.id.0, "receiverId": bob.id.0, "correlationToken": 1}),
        )
        .await;
    client.send_json(address::SEND_DIRECT, json!({"content": "no receiver", "senderId": alice.id.0})).await;

    let ok = client
        .send_json_receipted(
            address::SEND_DIRECT,
            json!({"content": "real", "senderId": alice.id.0, "receiverId": bob.id.0, "correlationToken": 3}),
        )
        .await;

    let ack = client
        .recv_json(&address::direct_ack(alice.id))
        .await
        .expect("no ack for the valid send");
    assert_eq!(ack, json!({"correlationToken": 3, "outcome": "sent"}));
    assert!(client.await_receipt(&ok).await);

    let history = gw
        .store
        .messages_between(alice.id, bob.id, TimeRange::last_hours(1))
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_attachment_end_to_end() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");
    let bob = gw.user("bob");

    let mut receiver = gw.connect(&bob).await;
    assert!(receiver.subscribe(&address::private_queue(bob.id)).await);

    let mut sender = gw.connect(&alice).await;
    assert!(sender.subscribe(&address::direct_ack(alice.id)).await);

    // "hello" in base64
    sender
        .send_json(
            address::SEND_IMAGE,
            json!({
                "file": "data:text/plain;base64,aGVsbG8=",
                "fileName": "note.txt",
                "fileType": "text/plain",
                "fileSize": 5,
                "senderId": alice.id.0,
                "receiverId": bob.id.0,
                "tempId": "f-1",
                "isGroup": "false",
            }),
        )
        .await;

    let delivered = receiver
        .recv_json(&address::private_queue(bob.id))
        .await
        .expect("receiver got nothing");
    let stored_name = delivered["fileName"].as_str().unwrap().to_string();
    assert!(stored_name.ends_with("_note.txt"));

    let ack = sender
        .recv_json(&address::direct_ack(alice.id))
        .await
        .expect("sender got no ack");
    assert_eq!(ack["correlationToken"], "f-1");
    assert_eq!(ack["outcome"], "sent");
    assert_eq!(ack["fileName"], stored_name.as_str());
    assert_eq!(ack["isGroup"], false);

    let files = gw
        .store
        .attachments_between(alice.id, bob.id, TimeRange::last_hours(1))
        .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].byte_size, 5);
    assert_eq!(files[0].stored_name, stored_name);

    let on_disk = gw.dir.path().join("uploads").join(&files[0].stored_name);
    assert_eq!(std::fs::read(on_disk).unwrap(), b"hello");
}

#[tokio::test]
async fn test_unknown_destination_is_ignored() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");

    let mut client = gw.connect(&alice).await;
    let receipt = client
        .send_json_receipted("/app/nowhere", json!({"content": "?"}))
        .await;
    assert!(client.await_receipt(&receipt).await);

    client.send(Frame::new(Command::Disconnect)).await;
}

#[tokio::test]
async fn test_binary_frame_with_invalid_utf8() {
    let gw = TestGateway::start().await;
    let alice = gw.user("alice");

    let mut client = gw.connect(&alice).await;
    client.send_raw(Message::Binary(vec![0xff, 0xfe, 0x00])).await;

    let reply = client.recv().await.expect("no ERROR for undecodable frame");
    assert_eq!(reply.command, Command::Error);
    assert_eq!(reply.get("message"), Some("malformed frame"));
    assert_eq!(reply.body, "frame is not valid UTF-8");
    assert!(client.recv().await.is_none());
}
