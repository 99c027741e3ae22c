//! Integration tests for support chat: bot turns, escalation, the join race.

mod common;

use serde_json::{json, Value};
use std::time::Duration;

use rideline_server::auth::Role;
use rideline_server::chat::{ChatMessage, ChatSession, ChatStatus, SenderRole};
use rideline_server::ws::events::{
    ClientEvent, RoomPayload, SendMessagePayload, ServerEvent, TypingPayload,
};

use common::{barrier, expect_event, next_named, TestServer};

async fn open_session(server: &TestServer, customer: &str) -> ChatSession {
    let resp = server.post(customer, "/api/chat/sessions", None).await;
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

async fn say(
    server: &TestServer,
    token: &str,
    session_id: &str,
    role: &str,
    text: &str,
) -> reqwest::Response {
    server
        .post(
            token,
            &format!("/api/chat/sessions/{}/messages", session_id),
            Some(json!({ "senderRole": role, "message": text })),
        )
        .await
}

async fn escalated_session(server: &TestServer, customer: &str) -> ChatSession {
    let session = open_session(server, customer).await;
    assert_eq!(say(server, customer, &session.id, "user", "I need an agent").await.status(), 201);
    server
        .get(customer, &format!("/api/chat/sessions/{}", session.id))
        .await
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn bot_answers_then_escalates_on_request() {
    let server = common::start().await;
    let customer = server.token("cust-1", "Cleo", Role::Customer);
    let admin = server.token("adm-1", "Ada", Role::Admin);
    let mut admin_ws = server.connect(&admin).await;
    common::send(&mut admin_ws, &ClientEvent::JoinAdminRoom).await;
    barrier(&mut admin_ws).await;

    let session = open_session(&server, &customer).await;
    assert_eq!(session.status, ChatStatus::Bot);
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.messages[0].sender_role, SenderRole::Bot);

    // Reopening returns the same session.
    let again = server.post(&customer, "/api/chat/sessions", None).await;
    assert_eq!(again.status(), 200);
    let again: ChatSession = again.json().await.unwrap();
    assert_eq!(again.id, session.id);

    let resp = say(&server, &customer, &session.id, "user", "What is the price per day?").await;
    let posted: ChatMessage = resp.json().await.unwrap();
    assert_eq!(posted.sender_role, SenderRole::User);

    say(&server, &customer, &session.id, "user", "please get me a human").await;
    match expect_event(&mut admin_ws, "newSupportRequest").await {
        ServerEvent::NewSupportRequest(e) => {
            assert_eq!(e.session_id, session.id);
            assert_eq!(e.session.status, ChatStatus::Waiting);
        }
        other => panic!("unexpected {:?}", other),
    }

    let current: ChatSession = server
        .get(&customer, &format!("/api/chat/sessions/{}", session.id))
        .await
        .json()
        .await
        .unwrap();
    let roles: Vec<SenderRole> = current.messages.iter().map(|m| m.sender_role).collect();
    assert_eq!(
        roles,
        vec![
            SenderRole::Bot,
            SenderRole::User,
            SenderRole::Bot,
            SenderRole::User,
            SenderRole::Bot
        ]
    );
    // Waiting sessions get no bot replies.
    say(&server, &customer, &session.id, "user", "hello?").await;
    let after: ChatSession = server
        .get(&customer, &format!("/api/chat/sessions/{}", session.id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(after.messages.len(), current.messages.len() + 1);
}

#[tokio::test]
async fn repeated_misses_escalate() {
    let server = common::start().await;
    let customer = server.token("cust-1", "Cleo", Role::Customer);
    let session = open_session(&server, &customer).await;

    say(&server, &customer, &session.id, "user", "zxqv").await;
    let one: ChatSession = server
        .get(&customer, &format!("/api/chat/sessions/{}", session.id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(one.status, ChatStatus::Bot);

    say(&server, &customer, &session.id, "user", "qwpz").await;
    let two: ChatSession = server
        .get(&customer, &format!("/api/chat/sessions/{}", session.id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(two.status, ChatStatus::Waiting);
}

#[tokio::test]
async fn two_admins_join_and_exactly_one_wins() {
    let server = common::start().await;
    let customer = server.token("cust-1", "Cleo", Role::Customer);
    let session = escalated_session(&server, &customer).await;
    assert_eq!(session.status, ChatStatus::Waiting);

    let mut customer_ws = server.connect(&customer).await;
    common::send(
        &mut customer_ws,
        &ClientEvent::JoinRoom(RoomPayload {
            session_id: session.id.clone(),
        }),
    )
    .await;
    barrier(&mut customer_ws).await;

    let path = format!("/api/chat/sessions/{}/join", session.id);
    let a = server.token("adm-a", "Ada", Role::Admin);
    let b = server.token("adm-b", "Bo", Role::Admin);
    let (ra, rb) = tokio::join!(server.post(&a, &path, None), server.post(&b, &path, None));

    let mut statuses = vec![ra.status().as_u16(), rb.status().as_u16()];
    statuses.sort();
    assert_eq!(statuses, vec![200, 409]);
    let loser = if ra.status() == 409 { ra } else { rb };
    let body: Value = loser.json().await.unwrap();
    assert_eq!(body["code"], "session_already_active");

    let joined = match expect_event(&mut customer_ws, "adminJoined").await {
        ServerEvent::AdminJoined(e) => e,
        other => panic!("unexpected {:?}", other),
    };
    assert!(joined.admin_id == "adm-a" || joined.admin_id == "adm-b");
    assert!(next_named(&mut customer_ws, "adminJoined", Duration::from_millis(300))
        .await
        .is_none());

    let current: ChatSession = server
        .get(&customer, &format!("/api/chat/sessions/{}", session.id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(current.status, ChatStatus::Active);
    assert_eq!(current.assigned_admin_id.as_deref(), Some(joined.admin_id.as_str()));
}

#[tokio::test]
async fn only_assigned_admin_posts_and_closes() {
    let server = common::start().await;
    let customer = server.token("cust-1", "Cleo", Role::Customer);
    let session = escalated_session(&server, &customer).await;
    let a = server.token("adm-a", "Ada", Role::Admin);
    let b = server.token("adm-b", "Bo", Role::Admin);
    server
        .post(&a, &format!("/api/chat/sessions/{}/join", session.id), None)
        .await;

    assert_eq!(say(&server, &b, &session.id, "admin", "hi").await.status(), 403);
    assert_eq!(say(&server, &a, &session.id, "admin", "Hi, Ada here").await.status(), 201);
    // customers cannot post as the bot
    assert_eq!(say(&server, &customer, &session.id, "bot", "fake").await.status(), 403);

    let close = format!("/api/chat/sessions/{}/close", session.id);
    assert_eq!(server.post(&b, &close, None).await.status(), 403);
    let closed: ChatSession = server.post(&a, &close, None).await.json().await.unwrap();
    assert_eq!(closed.status, ChatStatus::Closed);
    assert!(closed.closed_at.is_some());
    assert_eq!(server.post(&a, &close, None).await.status(), 200);

    let resp = say(&server, &customer, &session.id, "user", "one more thing").await;
    assert_eq!(resp.status(), 410);
}

#[tokio::test]
async fn handoff_moves_assignment() {
    let server = common::start().await;
    let customer = server.token("cust-1", "Cleo", Role::Customer);
    let session = escalated_session(&server, &customer).await;
    let a = server.token("adm-a", "Ada", Role::Admin);
    let b = server.token("adm-b", "Bo", Role::Admin);
    server
        .post(&a, &format!("/api/chat/sessions/{}/join", session.id), None)
        .await;

    let path = format!("/api/chat/sessions/{}/handoff", session.id);
    let to_self = server
        .post(&a, &path, Some(json!({ "toAdminId": "adm-a" })))
        .await;
    assert_eq!(to_self.status(), 400);

    // Only a connected admin can take the session over.
    let mut customer_ws = server.connect(&customer).await;
    barrier(&mut customer_ws).await;
    for target in ["cust-1", "adm-b", "nobody"] {
        let resp = server
            .post(&a, &path, Some(json!({ "toAdminId": target })))
            .await;
        assert_eq!(resp.status(), 400, "handoff to {}", target);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "invalid");
    }
    let still: ChatSession = server
        .get(&a, &format!("/api/chat/sessions/{}", session.id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(still.assigned_admin_id.as_deref(), Some("adm-a"));

    let mut b_ws = server.connect(&b).await;
    barrier(&mut b_ws).await;

    let moved: ChatSession = server
        .post(&a, &path, Some(json!({ "toAdminId": "adm-b" })))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(moved.status, ChatStatus::Active);
    assert_eq!(moved.assigned_admin_id.as_deref(), Some("adm-b"));
    assert_eq!(say(&server, &b, &session.id, "admin", "Bo here").await.status(), 201);
    assert_eq!(say(&server, &a, &session.id, "admin", "still me?").await.status(), 403);
}

#[tokio::test]
async fn socket_messages_and_typing_reach_the_room() {
    let server = common::start().await;
    let customer = server.token("cust-1", "Cleo", Role::Customer);
    let session = escalated_session(&server, &customer).await;
    let admin = server.token("adm-a", "Ada", Role::Admin);
    server
        .post(&admin, &format!("/api/chat/sessions/{}/join", session.id), None)
        .await;

    let mut customer_ws = server.connect(&customer).await;
    let mut admin_ws = server.connect(&admin).await;
    for ws in [&mut customer_ws, &mut admin_ws] {
        common::send(
            ws,
            &ClientEvent::JoinRoom(RoomPayload {
                session_id: session.id.clone(),
            }),
        )
        .await;
        barrier(ws).await;
    }

    common::send(
        &mut customer_ws,
        &ClientEvent::Typing(TypingPayload {
            session_id: session.id.clone(),
            is_typing: true,
        }),
    )
    .await;
    match expect_event(&mut admin_ws, "userTyping").await {
        ServerEvent::UserTyping(e) => {
            assert_eq!(e.user_id, "cust-1");
            assert!(e.is_typing);
        }
        other => panic!("unexpected {:?}", other),
    }

    common::send(
        &mut customer_ws,
        &ClientEvent::SendMessage(SendMessagePayload {
            session_id: session.id.clone(),
            sender_role: SenderRole::User,
            message: "Is the car ready?".into(),
        }),
    )
    .await;
    // Posting clears the sender's typing flag before the message lands.
    match expect_event(&mut admin_ws, "userTyping").await {
        ServerEvent::UserTyping(e) => assert!(!e.is_typing),
        other => panic!("unexpected {:?}", other),
    }
    match expect_event(&mut admin_ws, "newMessage").await {
        ServerEvent::NewMessage(e) => assert_eq!(e.message, "Is the car ready?"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn customers_cannot_see_other_sessions() {
    let server = common::start().await;
    let owner = server.token("cust-1", "Cleo", Role::Customer);
    let other = server.token("cust-2", "Mo", Role::Customer);
    let session = open_session(&server, &owner).await;

    let resp = server
        .get(&other, &format!("/api/chat/sessions/{}", session.id))
        .await;
    assert_eq!(resp.status(), 404);

    let mut ws = server.connect(&other).await;
    common::send(
        &mut ws,
        &ClientEvent::JoinRoom(RoomPayload {
            session_id: session.id.clone(),
        }),
    )
    .await;
    expect_event(&mut ws, "error").await;
}

#[tokio::test]
async fn idle_active_session_is_closed_by_server() {
    let server = common::start().await;
    let customer = server.token("cust-1", "Cleo", Role::Customer);
    let session = escalated_session(&server, &customer).await;
    let admin = server.token("adm-a", "Ada", Role::Admin);
    server
        .post(&admin, &format!("/api/chat/sessions/{}/join", session.id), None)
        .await;

    let idle_ms = server.state.chat.idle_close_secs as i64 * 1000;
    let later = rideline_server::now_millis() + idle_ms + 1_000;
    let closed = rideline_server::chat::idle::close_idle(&server.state, later)
        .await
        .unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].status, ChatStatus::Closed);

    let logs: Vec<Value> = server
        .get(&admin, "/api/activity-logs?limit=10")
        .await
        .json()
        .await
        .unwrap();
    assert!(logs.iter().any(|l| l["action"] == "chat.closed"));
}

#[tokio::test]
async fn activity_log_requires_an_admin_token() {
    let server = common::start().await;

    let anonymous = server
        .http
        .get(server.url("/api/activity-logs"))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 401);
    let body: Value = anonymous.json().await.unwrap();
    assert_eq!(body["code"], "missing_token");
    assert_eq!(body["category"], "authorization");

    let garbage = server.get("not-a-jwt", "/api/activity-logs").await;
    assert_eq!(garbage.status(), 401);
    let body: Value = garbage.json().await.unwrap();
    assert_eq!(body["code"], "token_invalid");

    let customer = server.token("cust-1", "Cleo", Role::Customer);
    let resp = server.get(&customer, "/api/activity-logs").await;
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "forbidden");
}
