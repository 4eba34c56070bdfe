use std::collections::HashMap;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use relay_core::{InboundStatus, Session, SessionStatus, generate_pairing_code, new_id};
use relay_server::{AppState, RelayConfig, build_router, webhook::EVENT_ID_HEADER};
use serde_json::{Value, json};
use sha2::Sha256;
use tower::ServiceExt;

struct TestApp {
    state: AppState,
    router: Router,
}

async fn app_with(vars: &[(&str, &str)]) -> TestApp {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let config = RelayConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
    let state = AppState::in_memory(config).await.unwrap();
    let router = build_router(state.clone());
    TestApp { state, router }
}

async fn app() -> TestApp {
    app_with(&[]).await
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> Response {
        self.router.clone().oneshot(req).await.unwrap()
    }

    async fn json(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self.send(req).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    /// Creates a session and pairs it to `conversation`; returns the bearer token and tenant id.
    async fn paired(&self, conversation: &str) -> (String, String) {
        let (status, created) = self.json(post_json("/v1/sessions", json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let token = created["token"].as_str().unwrap().to_string();
        let code = created["pairingCode"].as_str().unwrap().to_string();

        let (status, reply) = self
            .json(webhook(conversation, &format!("/pair {code}"), None))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(reply_text(&reply).starts_with("Connected"));

        let (_, session) = self
            .json(get(&format!("/v1/sessions/{token}/status"), None))
            .await;
        assert_eq!(session["status"], "paired");
        let account_id = session["accountId"].as_str().unwrap().to_string();
        (token, account_id)
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "198.51.100.20")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn with_bearer(mut req: Request<Body>, token: &str) -> Request<Body> {
    req.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    req
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let req = Request::builder()
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.20")
        .body(Body::empty())
        .unwrap();
    match token {
        Some(token) => with_bearer(req, token),
        None => req,
    }
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn webhook_body(conversation: &str, utterance: &str, callback: Option<&str>) -> Value {
    let mut request = json!({
        "user": { "id": conversation },
        "utterance": utterance,
    });
    if let Some(callback) = callback {
        request["callbackUrl"] = json!(callback);
    }
    json!({ "userRequest": request })
}

fn webhook(conversation: &str, utterance: &str, callback: Option<&str>) -> Request<Body> {
    post_json("/webhook", webhook_body(conversation, utterance, callback))
}

fn reply_text(body: &Value) -> &str {
    body["template"]["outputs"][0]["simpleText"]["text"]
        .as_str()
        .unwrap_or_default()
}

#[tokio::test]
async fn healthz_reports_broker_state() {
    let app = app().await;
    let (status, body) = app.json(get("/healthz", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["broker"], "online");

    app.state.broker.close().await;
    let (status, body) = app.json(get("/healthz", None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["broker"], "closed");
}

#[tokio::test]
async fn pairing_flow_binds_conversation() {
    let app = app().await;
    let (status, created) = app.json(post_json("/v1/sessions", json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending_pairing");
    let code = created["pairingCode"].as_str().unwrap().to_string();
    let token = created["token"].as_str().unwrap().to_string();

    let (_, pending) = app.json(get(&format!("/v1/sessions/{token}/status"), None)).await;
    assert_eq!(pending["status"], "pending_pairing");

    let (_, reply) = app
        .json(webhook("conv-42", &format!("/pair {}", code.to_lowercase()), None))
        .await;
    assert!(reply_text(&reply).starts_with("Connected"));

    let (_, again) = app.json(webhook("conv-43", &format!("/pair {code}"), None)).await;
    assert_eq!(reply_text(&again), "That code has already been used.");

    let (_, unknown) = app.json(webhook("conv-44", "/pair ZZZZ-0000", None)).await;
    assert_eq!(reply_text(&unknown), "Unknown pairing code.");

    let (_, paired) = app.json(get(&format!("/v1/sessions/{token}/status"), None)).await;
    assert_eq!(paired["status"], "paired");
    assert_eq!(paired["conversationKey"], "conv-42");
}

#[tokio::test]
async fn unknown_session_token_is_not_found() {
    let app = app().await;
    let (status, body) = app.json(get("/v1/sessions/nope/status", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn session_creation_is_limited_per_ip() {
    let app = app().await;
    for _ in 0..10 {
        let response = app.send(post_json("/v1/sessions", json!({}))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    let response = app.send(post_json("/v1/sessions", json!({}))).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn unpaired_chat_gets_instructions() {
    let app = app().await;
    let (status, body) = app.json(webhook("stranger", "hello", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(reply_text(&body).contains("/pair"));
}

#[tokio::test]
async fn reply_within_wait_is_returned_inline() {
    let app = app().await;
    let (token, account_id) = app.paired("conv-1").await;
    let mut stream = app.state.broker.subscribe(&account_id).unwrap();

    let pending = {
        let router = app.router.clone();
        tokio::spawn(async move { router.oneshot(webhook("conv-1", "ping", None)).await })
    };
    let event = stream.recv().await.unwrap();
    assert_eq!(event.event, "message");
    assert_eq!(event.data["normalized_payload"]["text"], "ping");

    let answer = json!({"version": "2.0", "template": {"outputs": [{"simpleText": {"text": "pong"}}]}});
    let (status, created) = app
        .json(with_bearer(
            post_json(
                "/v1/replies",
                json!({"conversationKey": "conv-1", "payload": answer}),
            ),
            &token,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["delivery"], "inline");

    let response = pending.await.unwrap().unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, answer);

    let inbound_id = event.id.unwrap();
    let inbound = app.state.messages.get_inbound(&inbound_id).await.unwrap();
    assert_eq!(inbound.status, InboundStatus::Acked);
}

#[tokio::test]
async fn late_reply_waits_for_pickup() {
    let app = app_with(&[("REPLY_WAIT_MS", "20")]).await;
    let (token, _) = app.paired("conv-2").await;

    let (_, body) = app.json(webhook("conv-2", "slow question", None)).await;
    assert_eq!(body, json!({"queued": true}));

    let (status, created) = app
        .json(with_bearer(
            post_json(
                "/v1/replies",
                json!({"conversationKey": "conv-2", "payload": {"text": "later"}}),
            ),
            &token,
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(created["delivery"], "pending");

    let (status, pending) = app
        .json(get("/v1/replies/pending?conversationKey=conv-2", Some(&token)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.as_array().unwrap().len(), 1);
    assert_eq!(pending[0]["payload"]["text"], "later");
    assert_eq!(pending[0]["status"], "pending");
}

#[tokio::test]
async fn callback_events_switch_to_callback_and_record_failures() {
    let app = app_with(&[("REPLY_WAIT_MS", "20")]).await;
    let (token, account_id) = app.paired("conv-3").await;

    let (_, body) = app
        .json(webhook("conv-3", "question", Some("http://127.0.0.1:9/callback")))
        .await;
    assert_eq!(body["useCallback"], true);

    let queued = app.state.messages.queued_for(&account_id, 10).await.unwrap();
    assert_eq!(queued.len(), 1);
    let inbound_id = queued[0].id.clone();

    let (status, created) = app
        .json(with_bearer(
            post_json(
                "/v1/replies",
                json!({
                    "conversationKey": "conv-3",
                    "inboundId": inbound_id,
                    "payload": {"text": "answer"},
                }),
            ),
            &token,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["delivery"], "failed");
    let stats = app.state.messages.get_quick_stats(&account_id).await.unwrap();
    assert_eq!(stats.outbound_failed, 1);
}

#[tokio::test]
async fn ack_is_idempotent_and_scoped_to_tenant() {
    let app = app_with(&[("REPLY_WAIT_MS", "10")]).await;
    let (token, account_id) = app.paired("conv-4").await;
    let (other_token, _) = app.paired("conv-5").await;
    app.json(webhook("conv-4", "hello", None)).await;
    let id = app.state.messages.queued_for(&account_id, 1).await.unwrap()[0]
        .id
        .clone();

    let uri = format!("/v1/messages/{id}/ack");
    let foreign = app.send(with_bearer(post_json(&uri, json!({})), &other_token)).await;
    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
    for _ in 0..2 {
        let response = app.send(with_bearer(post_json(&uri, json!({})), &token)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
    let stored = app.state.messages.get_inbound(&id).await.unwrap();
    assert_eq!(stored.status, InboundStatus::Acked);
}

#[tokio::test]
async fn redelivered_settled_event_is_answered_without_waiting() {
    let app = app_with(&[("REPLY_WAIT_MS", "30000")]).await;
    let (token, account_id) = app.paired("conv-redeliver").await;
    let mut stream = app.state.broker.subscribe(&account_id).unwrap();

    let first = {
        let router = app.router.clone();
        let mut req = webhook("conv-redeliver", "hello", None);
        req.headers_mut()
            .insert(EVENT_ID_HEADER, "evt-77".parse().unwrap());
        tokio::spawn(async move { router.oneshot(req).await })
    };
    let inbound_id = stream.recv().await.unwrap().id.unwrap();
    let (status, created) = app
        .json(with_bearer(
            post_json(
                "/v1/replies",
                json!({"conversationKey": "conv-redeliver", "payload": {"text": "hi"}}),
            ),
            &token,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["inboundId"], inbound_id.as_str());
    first.await.unwrap().unwrap();

    let mut again = webhook("conv-redeliver", "hello", None);
    again
        .headers_mut()
        .insert(EVENT_ID_HEADER, "evt-77".parse().unwrap());
    let (status, body) =
        tokio::time::timeout(std::time::Duration::from_secs(2), app.json(again))
            .await
            .expect("redelivery waited for a reply");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"queued": true}));

    let (status, created) = app
        .json(with_bearer(
            post_json(
                "/v1/replies",
                json!({"conversationKey": "conv-redeliver", "payload": {"text": "unrelated"}}),
            ),
            &token,
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(created["delivery"], "pending");
}

#[tokio::test]
async fn reply_inbound_must_belong_to_the_named_conversation() {
    let app = app_with(&[("REPLY_WAIT_MS", "10")]).await;
    let (token, account_id) = app.paired("conv-home").await;

    let now = time::OffsetDateTime::now_utc();
    let second = Session {
        id: new_id(),
        token_hash: new_id(),
        pairing_code: generate_pairing_code(),
        status: SessionStatus::PendingPairing,
        account_id: Some(account_id.clone()),
        conversation_key: None,
        metadata: None,
        client_ip: None,
        created_at: now,
        expires_at: now + time::Duration::minutes(10),
        paired_at: None,
    };
    app.state.repos.sessions.insert(second.clone()).await.unwrap();
    app.state
        .sessions
        .pair(&second.pairing_code, "conv-away")
        .await
        .unwrap();

    app.json(webhook("conv-away", "question elsewhere", None)).await;
    let queued = app.state.messages.queued_for(&account_id, 10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].conversation_key, "conv-away");

    let response = app
        .send(with_bearer(
            post_json(
                "/v1/replies",
                json!({
                    "conversationKey": "conv-home",
                    "inboundId": queued[0].id,
                    "payload": {"text": "wrong chat"},
                }),
            ),
            &token,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let stats = app.state.messages.get_quick_stats(&account_id).await.unwrap();
    assert_eq!(stats.outbound_total, 0);
}

#[tokio::test]
async fn tenant_routes_require_a_paired_credential() {
    let app = app().await;
    let body = json!({"conversationKey": "c", "payload": {}});
    let response = app.send(post_json("/v1/replies", body.clone())).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .send(with_bearer(post_json("/v1/replies", body.clone()), "garbage"))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (_, created) = app.json(post_json("/v1/sessions", json!({}))).await;
    let pending_token = created["token"].as_str().unwrap();
    let response = app
        .send(with_bearer(post_json("/v1/replies", body), pending_token))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn replies_to_foreign_conversations_are_rejected() {
    let app = app().await;
    let (token, _) = app.paired("conv-6").await;
    app.paired("conv-7").await;
    let response = app
        .send(with_bearer(
            post_json(
                "/v1/replies",
                json!({"conversationKey": "conv-7", "payload": {"text": "x"}}),
            ),
            &token,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn event_stream_replays_queued_backlog() {
    let app = app_with(&[("REPLY_WAIT_MS", "10")]).await;
    let (token, account_id) = app.paired("conv-8").await;
    app.json(webhook("conv-8", "while you were away", None)).await;

    let response = app.send(get("/v1/events", Some(&token))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let chunk = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(chunk.contains("event: message"));
    assert!(chunk.contains("while you were away"));
    assert_eq!(app.state.broker.client_count(&account_id), 1);
}

#[tokio::test]
async fn unpair_and_status_commands() {
    let app = app_with(&[("REPLY_WAIT_MS", "10")]).await;
    app.paired("conv-9").await;
    app.json(webhook("conv-9", "one", None)).await;

    let (_, status) = app.json(webhook("conv-9", "/status", None)).await;
    assert!(reply_text(&status).contains("Today: 1 received"));

    let (_, unpaired) = app.json(webhook("conv-9", "/unpair", None)).await;
    assert!(reply_text(&unpaired).starts_with("Disconnected"));
    let (_, after) = app.json(webhook("conv-9", "/status", None)).await;
    assert!(reply_text(&after).contains("not connected"));
}

#[tokio::test]
async fn webhook_signature_is_enforced_when_configured() {
    let app = app_with(&[("WEBHOOK_SIGNATURE_SECRET", "hook-secret")]).await;
    let body = webhook_body("conv-s", "hello", None).to_string();

    let unsigned = app.send(post_json("/webhook", serde_json::from_str(&body).unwrap())).await;
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let mut mac = Hmac::<Sha256>::new_from_slice(b"hook-secret").unwrap();
    mac.update(body.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    let signed = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-relay-signature", signature)
        .body(Body::from(body))
        .unwrap();
    assert_eq!(app.send(signed).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_routes_honour_admin_token() {
    let app = app_with(&[("ADMIN_TOKEN", "root"), ("REPLY_WAIT_MS", "10")]).await;
    let (_, account_id) = app.paired("conv-a").await;
    app.json(webhook("conv-a", "hi", None)).await;

    let response = app.send(get("/admin/overview", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (status, overview) = app.json(get("/admin/overview", Some("root"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(overview["accounts"], 1);
    assert_eq!(overview["sessions_paired"], 1);
    assert_eq!(overview["inbound_queued"], 1);

    let (status, stats) = app
        .json(get(&format!("/admin/accounts/{account_id}/stats"), Some("root")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["inbound_total"], 1);

    let (status, sessions) = app.json(get("/admin/sessions", Some("root"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sessions.as_array().unwrap().len(), 1);
    assert!(sessions[0].get("token_hash").is_none());
}

#[tokio::test]
async fn rotated_token_replaces_session_token() {
    let app = app().await;
    let (token, account_id) = app.paired("conv-r").await;
    let (status, rotated) = app
        .json(post_json(&format!("/admin/accounts/{account_id}/token"), json!({})))
        .await;
    assert_eq!(status, StatusCode::OK);
    let fresh = rotated["token"].as_str().unwrap();

    let old = app
        .send(get("/v1/replies/pending?conversationKey=conv-r", Some(&token)))
        .await;
    assert_eq!(old.status(), StatusCode::UNAUTHORIZED);
    let new = app
        .send(get("/v1/replies/pending?conversationKey=conv-r", Some(fresh)))
        .await;
    assert_eq!(new.status(), StatusCode::OK);
}

#[tokio::test]
async fn disconnect_stops_relaying() {
    let app = app().await;
    app.paired("conv-d").await;
    let (_, sessions) = app.json(get("/admin/sessions", None)).await;
    let id = sessions[0]["id"].as_str().unwrap();

    let response = app
        .send(post_json(&format!("/admin/sessions/{id}/disconnect"), json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app
        .send(post_json(&format!("/admin/sessions/{id}/disconnect"), json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let (_, body) = app.json(webhook("conv-d", "anyone?", None)).await;
    assert!(reply_text(&body).contains("not connected"));
}

#[tokio::test]
async fn admin_pages_tenant_history_newest_first() {
    let app = app_with(&[("REPLY_WAIT_MS", "10")]).await;
    let (token, account_id) = app.paired("conv-h").await;
    app.json(webhook("conv-h", "first", None)).await;
    app.json(webhook("conv-h", "second", None)).await;
    let (status, _) = app
        .json(with_bearer(
            post_json(
                "/v1/replies",
                json!({"conversationKey": "conv-h", "payload": {"text": "later"}}),
            ),
            &token,
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, accounts) = app.json(get("/admin/accounts", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accounts.as_array().unwrap().len(), 1);
    assert_eq!(accounts[0]["id"], account_id.as_str());
    assert_eq!(accounts[0]["inbound_total"], 2);
    assert_eq!(accounts[0]["outbound_total"], 1);
    assert!(accounts[0].get("relay_token_hash").is_none());

    let base = format!("/admin/accounts/{account_id}");
    let (status, conversations) = app.json(get(&format!("{base}/conversations"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conversations.as_array().unwrap().len(), 1);
    assert_eq!(conversations[0]["conversation_key"], "conv-h");

    let (_, inbound) = app.json(get(&format!("{base}/messages"), None)).await;
    let utterances: Vec<&str> = inbound
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["platform_payload"]["userRequest"]["utterance"].as_str().unwrap())
        .collect();
    assert_eq!(utterances, ["second", "first"]);

    let (_, page) = app
        .json(get(&format!("{base}/messages?limit=1&offset=1"), None))
        .await;
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["platform_payload"]["userRequest"]["utterance"], "first");

    let (status, outbound) = app
        .json(get(&format!("{base}/messages?type=outbound"), None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outbound.as_array().unwrap().len(), 1);
    assert_eq!(outbound[0]["payload"]["text"], "later");

    let response = app
        .send(get(&format!("{base}/messages?type=sideways"), None))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, missing) = app
        .json(get("/admin/accounts/nobody/messages", None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(missing.get("error").is_some());
}

#[tokio::test]
async fn admin_lists_failed_replies() {
    let app = app_with(&[("REPLY_WAIT_MS", "10")]).await;
    let (token, account_id) = app.paired("conv-f").await;
    let failed_uri = format!("/admin/accounts/{account_id}/failed-messages");

    let (status, failed) = app.json(get(&failed_uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(failed.as_array().unwrap().is_empty());

    app.json(webhook("conv-f", "question", Some("http://127.0.0.1:9/callback")))
        .await;
    let queued = app.state.messages.queued_for(&account_id, 10).await.unwrap();
    let (_, created) = app
        .json(with_bearer(
            post_json(
                "/v1/replies",
                json!({
                    "conversationKey": "conv-f",
                    "inboundId": queued[0].id,
                    "payload": {"text": "lost"},
                }),
            ),
            &token,
        ))
        .await;
    assert_eq!(created["delivery"], "failed");

    let (_, failed) = app.json(get(&failed_uri, None)).await;
    assert_eq!(failed.as_array().unwrap().len(), 1);
    assert_eq!(failed[0]["status"], "failed");
    assert_eq!(failed[0]["payload"]["text"], "lost");
}

#[tokio::test]
async fn deleting_a_conversation_stops_relaying_it() {
    let app = app_with(&[("ADMIN_TOKEN", "root")]).await;
    let (_, account_id) = app.paired("conv-x").await;
    let uri = format!("/admin/accounts/{account_id}/conversations/conv-x");

    assert_eq!(app.send(delete(&uri)).await.status(), StatusCode::UNAUTHORIZED);
    let response = app.send(with_bearer(delete(&uri), "root")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app.send(with_bearer(delete(&uri), "root")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let (_, conversations) = app
        .json(get(
            &format!("/admin/accounts/{account_id}/conversations"),
            Some("root"),
        ))
        .await;
    assert!(conversations.as_array().unwrap().is_empty());

    let (_, body) = app.json(webhook("conv-x", "still there?", None)).await;
    assert!(reply_text(&body).contains("not connected"));
}
