#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use relaydesk_client::{Delivery, Participant, SessionEvent, Source};
use relaydesk_shared::{Channel, DurableStore, MemoryStore, Message, ParticipantId, Role};

use common::{open, texts, wait_until, FlakyStore, LoopbackRelay};

#[tokio::test]
async fn test_user_and_operator_see_each_message_once() {
    let (_relay, manager) = LoopbackRelay::start();
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let user_id = ParticipantId::new();
    let operator_id = ParticipantId::new();

    let (user, _) = open(&manager, store.clone(), Participant::user(user_id), Channel::Operator).await;
    let (operator, _) = open(
        &manager,
        store.clone(),
        Participant::joining(user_id, operator_id, Role::Operator),
        Channel::Operator,
    )
    .await;

    user.send_text("my order is late").await.unwrap();
    wait_until(&operator, |m| m.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    operator.send_text("looking into it").await.unwrap();
    user.send_text("thanks").await.unwrap();

    let expected = vec!["my order is late", "looking into it", "thanks"];
    let seen_by_user = wait_until(&user, |m| texts(m) == expected).await;
    let seen_by_operator = wait_until(&operator, |m| texts(m) == expected).await;
    assert_eq!(
        seen_by_user.iter().map(|m| m.id).collect::<Vec<_>>(),
        seen_by_operator.iter().map(|m| m.id).collect::<Vec<_>>()
    );

    // Everything ends up store-backed and the sender's copies confirmed
    let view = user.view().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let view_after = user.view().await;
    assert_eq!(view.len(), view_after.len());
    assert!(view_after.iter().all(|e| e.source == Source::Store));
    assert!(view_after
        .iter()
        .filter(|e| e.message.sender_id == user_id)
        .all(|e| e.delivery == Some(Delivery::Confirmed)));

    user.close().await;
    operator.close().await;
}

#[tokio::test]
async fn test_streaming_reply_collapses_to_one_message() {
    let (_relay, manager) = LoopbackRelay::start();
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let user_id = ParticipantId::new();
    let assistant_id = ParticipantId::new();

    let (user, _) = open(&manager, store.clone(), Participant::user(user_id), Channel::Assistant).await;
    let (assistant, _) = open(
        &manager,
        store.clone(),
        Participant::joining(user_id, assistant_id, Role::Assistant),
        Channel::Assistant,
    )
    .await;

    let mut reply = Message::new(user_id, Channel::Assistant, assistant_id, Role::Assistant, "");
    for chunk in ["Hel", "Hello", "Hello there"] {
        reply.text = chunk.to_string();
        assistant.publish(reply.clone()).await.unwrap();
    }

    let seen = wait_until(&user, |m| texts(m) == vec!["Hello there"]).await;
    assert_eq!(seen[0].id, reply.id);
    // Still exactly one once the store has caught up
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(texts(&user.messages().await), vec!["Hello there"]);

    user.close().await;
    assistant.close().await;
}

#[tokio::test]
async fn test_store_fills_transport_gaps() {
    let (relay, manager) = LoopbackRelay::start();
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let user_id = ParticipantId::new();
    let operator_id = ParticipantId::new();

    let (user, _) = open(&manager, store.clone(), Participant::user(user_id), Channel::Operator).await;
    let (operator, _) = open(
        &manager,
        store.clone(),
        Participant::joining(user_id, operator_id, Role::Operator),
        Channel::Operator,
    )
    .await;

    relay.drop_messages.store(true, Ordering::SeqCst);
    operator.send_text("did you try turning it off").await.unwrap();

    let seen = wait_until(&user, |m| m.len() == 1).await;
    assert_eq!(seen[0].sender_id, operator_id);
    assert_eq!(user.view().await[0].source, Source::Store);

    user.close().await;
    operator.close().await;
}

#[tokio::test]
async fn test_late_joiner_gets_snapshot_in_order() {
    let (_relay, manager) = LoopbackRelay::start();
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let user_id = ParticipantId::new();

    let (user, _) = open(&manager, store.clone(), Participant::user(user_id), Channel::Operator).await;
    for text in ["one", "two", "three"] {
        user.send_text(text).await.unwrap();
    }

    let (operator, _) = open(
        &manager,
        store.clone(),
        Participant::joining(user_id, ParticipantId::new(), Role::Operator),
        Channel::Operator,
    )
    .await;
    let seen = wait_until(&operator, |m| m.len() == 3).await;
    assert_eq!(texts(&seen), vec!["one", "two", "three"]);

    user.close().await;
    operator.close().await;
}

#[tokio::test]
async fn test_channel_switch_isolates_conversations() {
    let (_relay, manager) = LoopbackRelay::start();
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let user_id = ParticipantId::new();

    let (mut user, _) = open(&manager, store.clone(), Participant::user(user_id), Channel::Assistant).await;
    user.send_text("bot question").await.unwrap();
    wait_until(&user, |m| m.len() == 1).await;

    // Same channel: nothing changes
    user.route(Channel::Assistant).await.unwrap();
    assert_eq!(texts(&user.messages().await), vec!["bot question"]);

    user.route(Channel::Operator).await.unwrap();
    assert_eq!(user.channel(), Channel::Operator);
    assert!(user.messages().await.is_empty());
    let sent = user.send_text("human please").await.unwrap();
    assert_eq!(sent.channel, Channel::Operator);
    wait_until(&user, |m| texts(m) == vec!["human please"]).await;

    // Switching back replays the assistant conversation from the store
    user.route(Channel::Assistant).await.unwrap();
    let seen = wait_until(&user, |m| m.len() == 1).await;
    assert_eq!(texts(&seen), vec!["bot question"]);
    assert!(seen.iter().all(|m| m.channel == Channel::Assistant));

    user.close().await;
}

#[tokio::test]
async fn test_append_is_retried_once_then_fails() {
    let (_relay, manager) = LoopbackRelay::start();
    let user_id = ParticipantId::new();

    // One failure: the retry succeeds
    let flaky: Arc<dyn DurableStore> = Arc::new(FlakyStore::new(1));
    let (user, _) = open(&manager, flaky, Participant::user(user_id), Channel::Operator).await;
    user.send_text("first try").await.unwrap();
    user.close().await;

    // Two failures: surfaced, optimistic copy kept and flagged
    let broken: Arc<dyn DurableStore> = Arc::new(FlakyStore::new(2));
    let (user, _) = open(&manager, broken, Participant::user(user_id), Channel::Operator).await;
    let err = user.send_text("will not stick").await.unwrap_err();
    assert_eq!(err.message.text, "will not stick");

    let view = user.view().await;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].message.id, err.message.id);
    assert_eq!(view[0].delivery, Some(Delivery::Failed));
    user.close().await;
}

#[tokio::test]
async fn test_typing_indicator_reaches_peer() {
    let (_relay, manager) = LoopbackRelay::start();
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let user_id = ParticipantId::new();

    let (user, mut user_events) =
        open(&manager, store.clone(), Participant::user(user_id), Channel::Operator).await;
    let (operator, _) = open(
        &manager,
        store.clone(),
        Participant::joining(user_id, ParticipantId::new(), Role::Operator),
        Channel::Operator,
    )
    .await;

    operator.send_typing().unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3), user_events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, SessionEvent::ViewChanged(_)) && user.typing_indicator().await {
            break;
        }
    }

    operator.send_text("here is the answer").await.unwrap();
    wait_until(&user, |m| m.len() == 1).await;
    assert!(!user.typing_indicator().await);

    user.close().await;
    operator.close().await;
}
