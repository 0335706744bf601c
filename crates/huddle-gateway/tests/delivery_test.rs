use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use huddle_db::Database;
use huddle_db::models::{ChatRecord, NewChat, NewMessage, UserRow};
use huddle_gateway::delivery::DeliveryError;
use huddle_gateway::{Gateway, GatewayConfig};
use huddle_types::events::ServerEvent;
use huddle_types::models::MessageView;

fn gateway() -> Gateway {
    let db = Arc::new(Database::open_in_memory().unwrap());
    Gateway::new(
        db,
        GatewayConfig {
            jwt_secret: "test-secret".into(),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(60),
            server_push: false,
        },
    )
}

fn pair(gw: &Gateway) -> (UserRow, UserRow, ChatRecord) {
    let a = gw.db.create_user("alice", "alice@example.com").unwrap();
    let b = gw.db.create_user("bob", "bob@example.com").unwrap();
    let chat = gw.db.create_chat(&NewChat::one_to_one(a.id, b.id)).unwrap();
    (a, b, chat)
}

fn received(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<MessageView> {
    let mut out = vec![];
    while let Ok(event) = rx.try_recv() {
        if let ServerEvent::MessageReceived(view) = event {
            out.push(view);
        }
    }
    out
}

#[tokio::test]
async fn first_message_bumps_recipient_only() {
    let gw = gateway();
    let (a, b, chat) = pair(&gw);

    let msg = gw.db.create_message(a.id, chat.id, "hi").unwrap();
    let delivery = gw.delivery.deliver(&msg, None).await.unwrap();

    assert_eq!(gw.db.unread_count(chat.id, b.id).unwrap(), Some(1));
    assert_eq!(gw.db.unread_count(chat.id, a.id).unwrap(), Some(0));

    let latest = delivery.message.chat.latest_message.unwrap();
    assert_eq!(latest.content, "hi");
    assert_eq!(latest.sender.id, a.id);
    assert_eq!(delivery.message.chat.unread_count[&b.id], 1);
    assert_eq!(delivery.pushed, 0);
}

#[tokio::test]
async fn every_member_but_the_sender_is_bumped() {
    let gw = gateway();
    let users: Vec<UserRow> = (0..4)
        .map(|i| gw.db.create_user(&format!("u{}", i), &format!("u{}@example.com", i)).unwrap())
        .collect();
    let ids: Vec<Uuid> = users.iter().map(|u| u.id).collect();
    let chat = gw.db.create_chat(&NewChat::group("crew", ids[0], ids.clone())).unwrap();

    gw.db.increment_unread(chat.id, &[ids[2]]).unwrap();
    let before: Vec<u32> = ids
        .iter()
        .map(|id| gw.db.unread_count(chat.id, *id).unwrap().unwrap())
        .collect();

    let msg = gw.db.create_message(ids[1], chat.id, "standup in 5").unwrap();
    gw.delivery.deliver(&msg, None).await.unwrap();

    for (i, id) in ids.iter().enumerate() {
        let after = gw.db.unread_count(chat.id, *id).unwrap().unwrap();
        let expected = if i == 1 { before[i] } else { before[i] + 1 };
        assert_eq!(after, expected, "member {}", i);
    }
}

#[tokio::test]
async fn in_room_recipient_gets_exactly_one_copy() {
    let gw = gateway();
    let (a, b, chat) = pair(&gw);

    let (conn_a, mut rx_a) = gw.presence.connect();
    let (conn_b, mut rx_b) = gw.presence.connect();
    gw.presence.register(a.id, conn_a);
    gw.presence.register(b.id, conn_b);
    gw.presence.join_room(chat.id, conn_b);

    // HTTP path commits, socket path fans out
    let msg = gw.db.create_message(a.id, chat.id, "hello").unwrap();
    gw.delivery.commit(&msg).await.unwrap();
    gw.delivery.fan_out(msg.id, a.id, Some(conn_a)).await.unwrap();

    let got = received(&mut rx_b);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].content, "hello");
    assert_eq!(got[0].chat.latest_message.as_ref().unwrap().id, msg.id);
    assert!(received(&mut rx_a).is_empty());
}

#[tokio::test]
async fn rapid_messages_to_offline_user_all_count() {
    let gw = gateway();
    let (a, b, chat) = pair(&gw);

    let mut tasks = vec![];
    for text in ["one", "two", "three"] {
        let gw = gw.clone();
        let (sender, chat_id) = (a.id, chat.id);
        tasks.push(tokio::spawn(async move {
            let msg = gw.db.create_message(sender, chat_id, text).unwrap();
            gw.delivery.deliver(&msg, None).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(gw.db.unread_count(chat.id, b.id).unwrap(), Some(3));
    assert_eq!(gw.db.unread_count(chat.id, a.id).unwrap(), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_do_not_lose_increments() {
    let gw = gateway();
    let users: Vec<UserRow> = (0..3)
        .map(|i| gw.db.create_user(&format!("u{}", i), &format!("u{}@example.com", i)).unwrap())
        .collect();
    let ids: Vec<Uuid> = users.iter().map(|u| u.id).collect();
    let chat = gw.db.create_chat(&NewChat::group("busy", ids[0], ids.clone())).unwrap();

    let mut tasks = vec![];
    for round in 0..30 {
        let gw = gw.clone();
        let sender = ids[round % 2];
        let chat_id = chat.id;
        tasks.push(tokio::spawn(async move {
            let msg = gw.db.create_message(sender, chat_id, "spam").unwrap();
            gw.delivery.deliver(&msg, None).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // ids[0] and ids[1] each sent 15; ids[2] received all 30
    assert_eq!(gw.db.unread_count(chat.id, ids[0]).unwrap(), Some(15));
    assert_eq!(gw.db.unread_count(chat.id, ids[1]).unwrap(), Some(15));
    assert_eq!(gw.db.unread_count(chat.id, ids[2]).unwrap(), Some(30));
}

#[tokio::test]
async fn missing_chat_aborts_before_any_push() {
    let gw = gateway();
    let (a, b, chat) = pair(&gw);

    let (conn_b, mut rx_b) = gw.presence.connect();
    gw.presence.register(b.id, conn_b);
    gw.presence.join_room(chat.id, conn_b);

    let ghost = huddle_db::models::MessageRow {
        id: Uuid::new_v4(),
        chat_id: Uuid::new_v4(),
        sender_id: a.id,
        content: "into the void".into(),
        read_by: vec![],
        created_at: Utc::now(),
    };

    let err = gw.delivery.deliver(&ghost, None).await.unwrap_err();
    assert!(matches!(err, DeliveryError::ChatNotFound(id) if id == ghost.chat_id));
    assert!(received(&mut rx_b).is_empty());
    assert_eq!(gw.db.unread_count(chat.id, b.id).unwrap(), Some(0));
}

#[tokio::test]
async fn sender_devices_only_see_room_broadcast() {
    let gw = gateway();
    let (a, b, chat) = pair(&gw);

    let (origin, mut rx_origin) = gw.presence.connect();
    let (a_in_room, mut rx_a_in_room) = gw.presence.connect();
    let (a_elsewhere, mut rx_a_elsewhere) = gw.presence.connect();
    let (b_in_room, mut rx_b_in_room) = gw.presence.connect();
    let (b_elsewhere, mut rx_b_elsewhere) = gw.presence.connect();

    for conn in [origin, a_in_room, a_elsewhere] {
        gw.presence.register(a.id, conn);
    }
    for conn in [b_in_room, b_elsewhere] {
        gw.presence.register(b.id, conn);
    }
    for conn in [origin, a_in_room, b_in_room] {
        gw.presence.join_room(chat.id, conn);
    }

    let msg = gw.db.create_message(a.id, chat.id, "sync").unwrap();
    let delivery = gw.delivery.deliver(&msg, Some(origin)).await.unwrap();

    assert_eq!(delivery.pushed, 3);
    assert!(received(&mut rx_origin).is_empty());
    assert_eq!(received(&mut rx_a_in_room).len(), 1);
    assert!(received(&mut rx_a_elsewhere).is_empty());
    assert_eq!(received(&mut rx_b_in_room).len(), 1);
    assert_eq!(received(&mut rx_b_elsewhere).len(), 1);
}

#[tokio::test]
async fn fan_out_checks_the_sender() {
    let gw = gateway();
    let (a, b, chat) = pair(&gw);

    let msg = gw.db.create_message(a.id, chat.id, "mine").unwrap();
    let err = gw.delivery.fan_out(msg.id, b.id, None).await.unwrap_err();
    assert!(matches!(err, DeliveryError::NotSender { .. }));

    let err = gw.delivery.fan_out(Uuid::new_v4(), a.id, None).await.unwrap_err();
    assert!(matches!(err, DeliveryError::MessageNotFound(_)));
}

#[tokio::test]
async fn history_order_follows_timestamps_not_delivery_order() {
    let gw = gateway();
    let (a, b, chat) = pair(&gw);
    let base = Utc::now();

    let mut rows = vec![];
    for i in 0..4 {
        rows.push(
            gw.db
                .insert_message(&NewMessage {
                    id: Uuid::new_v4(),
                    chat_id: chat.id,
                    sender_id: if i % 2 == 0 { a.id } else { b.id },
                    content: format!("m{}", i),
                    created_at: base + chrono::Duration::milliseconds(i),
                })
                .unwrap(),
        );
    }

    for row in rows.iter().rev() {
        gw.delivery.deliver(row, None).await.unwrap();
    }

    let history: Vec<String> = gw
        .db
        .find_messages(chat.id)
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(history, vec!["m0", "m1", "m2", "m3"]);

    // Latest still points at the newest message despite arriving first
    let view = gw.db.chat_view(chat.id).unwrap().unwrap();
    assert_eq!(view.latest_message.unwrap().content, "m3");
}

#[tokio::test]
async fn deliver_on_create_skips_every_sender_connection() {
    let gw = gateway();
    let (a, b, chat) = pair(&gw);

    let (a_in_room, mut rx_a_in_room) = gw.presence.connect();
    let (a_elsewhere, mut rx_a_elsewhere) = gw.presence.connect();
    let (b_in_room, mut rx_b_in_room) = gw.presence.connect();
    let (b_elsewhere, mut rx_b_elsewhere) = gw.presence.connect();
    for conn in [a_in_room, a_elsewhere] {
        gw.presence.register(a.id, conn);
    }
    for conn in [b_in_room, b_elsewhere] {
        gw.presence.register(b.id, conn);
    }
    gw.presence.join_room(chat.id, a_in_room);
    gw.presence.join_room(chat.id, b_in_room);

    let msg = gw.db.create_message(a.id, chat.id, "posted").unwrap();
    let delivery = gw.delivery.deliver_on_create(&msg).await.unwrap();

    assert_eq!(delivery.pushed, 2);
    assert!(received(&mut rx_a_in_room).is_empty());
    assert!(received(&mut rx_a_elsewhere).is_empty());
    assert_eq!(received(&mut rx_b_in_room).len(), 1);
    assert_eq!(received(&mut rx_b_elsewhere).len(), 1);
    assert_eq!(gw.db.unread_count(chat.id, b.id).unwrap(), Some(1));
}
