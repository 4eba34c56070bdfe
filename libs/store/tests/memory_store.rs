use std::sync::Arc;

use relay_core::{
    InboundMessage, InboundStatus, MappingState, OutboundMessage, OutboundStatus, Session,
    SessionStatus, new_id,
};
use relay_store::{MemoryStore, PairingClaim, Repositories};
use serde_json::json;
use time::{Duration, OffsetDateTime, macros::datetime};

const NOW: OffsetDateTime = datetime!(2024-05-01 10:00 UTC);

fn pending(code: &str) -> Session {
    Session {
        id: new_id(),
        token_hash: new_id(),
        pairing_code: code.into(),
        status: SessionStatus::PendingPairing,
        account_id: None,
        conversation_key: None,
        metadata: None,
        client_ip: None,
        created_at: NOW,
        expires_at: NOW + Duration::minutes(10),
        paired_at: None,
    }
}

fn claim(code: &str, conversation: &str, now: OffsetDateTime) -> PairingClaim {
    PairingClaim {
        pairing_code: code.into(),
        conversation_key: conversation.into(),
        default_rate_limit_per_minute: 30,
        now,
    }
}

fn inbound(account: &str, expires_at: OffsetDateTime) -> InboundMessage {
    InboundMessage {
        id: new_id(),
        account_id: account.into(),
        conversation_key: "conv".into(),
        platform_payload: json!({}),
        normalized_payload: json!({"text": "hello"}),
        callback_url: None,
        callback_expires_at: None,
        source_event_id: None,
        status: InboundStatus::Queued,
        created_at: NOW,
        expires_at,
        delivered_at: None,
        acked_at: None,
    }
}

#[tokio::test]
async fn expired_code_never_claims() {
    let repos = Repositories::memory();
    repos.sessions.insert(pending("WXYZ-0001")).await.unwrap();
    let later = NOW + Duration::minutes(11);
    assert!(
        repos
            .sessions
            .claim_pairing(claim("WXYZ-0001", "conv", later))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let repos = Repositories::from_store(store);
    repos.sessions.insert(pending("ABCD-1234")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let sessions = repos.sessions.clone();
        handles.push(tokio::spawn(async move {
            sessions
                .claim_pairing(claim("ABCD-1234", &format!("conv-{i}"), NOW))
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(repos.accounts.count().await.unwrap(), 1);
}

#[tokio::test]
async fn repairing_a_conversation_disconnects_the_previous_session() {
    let repos = Repositories::memory();
    repos.sessions.insert(pending("AAAA-1111")).await.unwrap();
    repos.sessions.insert(pending("BBBB-2222")).await.unwrap();
    let first = repos
        .sessions
        .claim_pairing(claim("AAAA-1111", "conv", NOW))
        .await
        .unwrap()
        .unwrap();
    let second = repos
        .sessions
        .claim_pairing(claim("BBBB-2222", "conv", NOW + Duration::seconds(1)))
        .await
        .unwrap()
        .unwrap();

    let old = repos.sessions.get(&first.id).await.unwrap().unwrap();
    assert_eq!(old.status, SessionStatus::Disconnected);
    let mapping = repos.conversations.get("conv").await.unwrap().unwrap();
    assert_eq!(mapping.account_id, second.account_id.unwrap());
    let current = repos
        .sessions
        .find_by_conversation("conv")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.id, second.id);
}

#[tokio::test]
async fn disconnect_unpairs_mapping_and_is_guarded() {
    let repos = Repositories::memory();
    let session = pending("CCCC-3333");
    repos.sessions.insert(session.clone()).await.unwrap();
    assert!(!repos.sessions.mark_disconnected(&session.id, NOW).await.unwrap());

    repos
        .sessions
        .claim_pairing(claim("CCCC-3333", "conv", NOW))
        .await
        .unwrap();
    assert!(repos.sessions.mark_disconnected(&session.id, NOW).await.unwrap());
    assert!(!repos.sessions.mark_disconnected(&session.id, NOW).await.unwrap());
    let mapping = repos.conversations.get("conv").await.unwrap().unwrap();
    assert_eq!(mapping.state, MappingState::Unpaired);
}

#[tokio::test]
async fn sweeps_only_touch_expired_rows() {
    let repos = Repositories::memory();
    repos.sessions.insert(pending("DDDD-4444")).await.unwrap();
    let fresh = inbound("acc", NOW + Duration::minutes(15));
    let stale = inbound("acc", NOW - Duration::seconds(1));
    let mut delivered = inbound("acc", NOW - Duration::seconds(1));
    delivered.status = InboundStatus::Delivered;
    let mut callback_gone = inbound("acc", NOW + Duration::minutes(15));
    callback_gone.callback_url = Some("https://cb".into());
    callback_gone.callback_expires_at = Some(NOW - Duration::seconds(1));
    for msg in [&fresh, &stale, &delivered, &callback_gone] {
        repos.inbound.insert(msg.clone()).await.unwrap();
    }

    assert_eq!(repos.inbound.expire_stale(NOW).await.unwrap(), 2);
    let status = |id: &str| {
        let inbound = repos.inbound.clone();
        let id = id.to_string();
        async move { inbound.get(&id).await.unwrap().unwrap().status }
    };
    assert_eq!(status(&fresh.id).await, InboundStatus::Queued);
    assert_eq!(status(&stale.id).await, InboundStatus::Expired);
    assert_eq!(status(&delivered.id).await, InboundStatus::Delivered);
    assert_eq!(status(&callback_gone.id).await, InboundStatus::Expired);

    assert_eq!(repos.sessions.expire_pending(NOW).await.unwrap(), 0);
    assert_eq!(
        repos
            .sessions
            .expire_pending(NOW + Duration::minutes(10))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn ack_is_idempotent() {
    let repos = Repositories::memory();
    let msg = inbound("acc", NOW + Duration::minutes(15));
    repos.inbound.insert(msg.clone()).await.unwrap();
    assert!(repos.inbound.mark_delivered(&msg.id, NOW).await.unwrap());
    assert!(repos.inbound.mark_acked(&msg.id, NOW).await.unwrap());
    assert!(!repos.inbound.mark_acked(&msg.id, NOW).await.unwrap());
    assert!(!repos.inbound.mark_delivered(&msg.id, NOW).await.unwrap());
}

#[tokio::test]
async fn outbound_failures_are_counted_per_account() {
    let repos = Repositories::memory();
    for account in ["a", "a", "b"] {
        let msg = OutboundMessage {
            id: new_id(),
            account_id: account.into(),
            conversation_key: "conv".into(),
            inbound_id: None,
            payload: json!({"text": "hi"}),
            status: OutboundStatus::Pending,
            error_message: None,
            created_at: NOW,
            sent_at: None,
        };
        repos.outbound.insert(msg.clone()).await.unwrap();
        assert!(repos.outbound.mark_failed(&msg.id, "boom").await.unwrap());
    }
    assert_eq!(repos.outbound.count_failed(Some("a")).await.unwrap(), 2);
    assert_eq!(repos.outbound.count_failed(None).await.unwrap(), 3);
    assert!(
        repos
            .outbound
            .find_pending("a", "conv", 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn deleting_an_account_cascades() {
    let repos = Repositories::memory();
    repos.sessions.insert(pending("EEEE-5555")).await.unwrap();
    let paired = repos
        .sessions
        .claim_pairing(claim("EEEE-5555", "conv", NOW))
        .await
        .unwrap()
        .unwrap();
    let account_id = paired.account_id.unwrap();
    repos
        .inbound
        .insert(inbound(&account_id, NOW + Duration::minutes(1)))
        .await
        .unwrap();

    assert!(repos.accounts.delete(&account_id).await.unwrap());
    assert!(repos.sessions.get(&paired.id).await.unwrap().is_none());
    assert!(repos.conversations.get("conv").await.unwrap().is_none());
    assert_eq!(
        repos
            .inbound
            .count_for_account(&account_id, None)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn tenant_message_history_is_paged_newest_first() {
    let repos = Repositories::memory();
    let mut ids = Vec::new();
    for n in 0..5 {
        let mut msg = inbound("acc", NOW + Duration::minutes(30));
        msg.created_at = NOW + Duration::seconds(n);
        ids.push(msg.id.clone());
        repos.inbound.insert(msg).await.unwrap();
    }
    repos
        .inbound
        .insert(inbound("other", NOW + Duration::minutes(30)))
        .await
        .unwrap();

    let first = repos.inbound.list_for_account("acc", 2, 0).await.unwrap();
    let second = repos.inbound.list_for_account("acc", 2, 2).await.unwrap();
    let last = repos.inbound.list_for_account("acc", 2, 4).await.unwrap();
    let seen: Vec<_> = first
        .iter()
        .chain(&second)
        .chain(&last)
        .map(|m| m.id.clone())
        .collect();
    ids.reverse();
    assert_eq!(seen, ids);
    assert!(repos.inbound.list_for_account("acc", 2, 5).await.unwrap().is_empty());
}
