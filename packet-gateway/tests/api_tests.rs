//! HTTP integration tests driving the router in-process

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use packet_core::{Config, PacketEngine, PacketId, PacketStatus, PaymentStatus, SplitPolicy};
use packet_gateway::{
    api::{
        account, invitation, ops, packet, payment, ClaimPacketRequest, CreatePacketRequest,
        CreatePacketResponse, Endpoint, PaymentCallbackRequest, RegisterInvitationRequest,
    },
    router, AppState,
};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn create_test_app() -> (Router, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.rocksdb.sync_writes = false;
    config.sweeper.enabled = false;
    let engine = PacketEngine::open(config).unwrap();
    (router(AppState::new(Arc::new(engine))), temp_dir)
}

async fn send_raw(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

async fn send<E: Endpoint>(app: &Router, endpoint: &E) -> (StatusCode, Value) {
    send_raw(app, endpoint.build_request().unwrap()).await
}

/// Call an endpoint that must succeed and decode its typed response
async fn call<E: Endpoint>(app: &Router, endpoint: &E) -> E::Response {
    let (status, body) = send(app, endpoint).await;
    assert!(status.is_success(), "unexpected {}: {}", status, body);
    serde_json::from_value(body).unwrap()
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap()
}

async fn create(app: &Router, total: u64, shares: u32, policy: SplitPolicy) -> CreatePacketResponse {
    call(
        app,
        &packet::CreatePacket(CreatePacketRequest {
            owner_id: "owner".into(),
            total_amount: total,
            share_count: shares,
            policy,
            greeting: Some("Happy new year".into()),
        }),
    )
    .await
}

fn callback(packet_id: PacketId, tx: &str, amount: u64) -> payment::PaymentCallback {
    payment::PaymentCallback(PaymentCallbackRequest {
        gateway_tx_id: tx.into(),
        packet_id,
        amount,
        raw_payload: format!(r#"{{"tx":"{}","amount":{}}}"#, tx, amount),
        signature: Some("verified-upstream".into()),
        outcome: None,
    })
}

fn claim(packet_id: PacketId, account: &str, key: &str) -> packet::ClaimPacket {
    packet::ClaimPacket {
        packet_id,
        request: ClaimPacketRequest {
            account_id: account.into(),
            idempotency_key: key.into(),
        },
    }
}

async fn funded(app: &Router, total: u64, shares: u32, policy: SplitPolicy) -> PacketId {
    let created = create(app, total, shares, policy).await;
    let ack = call(app, &callback(created.packet_id, &format!("tx-{}", created.packet_id), total)).await;
    assert_eq!(ack.status, Some(PaymentStatus::Confirmed));
    created.packet_id
}

#[tokio::test]
async fn test_create_returns_pending_packet() {
    let (app, _temp) = create_test_app();

    let (status, body) = send(
        &app,
        &packet::CreatePacket(CreatePacketRequest {
            owner_id: "owner".into(),
            total_amount: 500,
            share_count: 5,
            policy: SplitPolicy::Random,
            greeting: None,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");

    let created: CreatePacketResponse = serde_json::from_value(body).unwrap();
    let view = call(&app, &packet::GetPacket { packet_id: created.packet_id }).await;
    assert_eq!(view.status, PacketStatus::Pending);
    assert_eq!(view.total_amount, 500);
    assert_eq!(view.claimed_count, 0);
}

#[tokio::test]
async fn test_full_claim_flow() {
    let (app, _temp) = create_test_app();
    let packet_id = funded(&app, 1000, 3, SplitPolicy::Even).await;

    let mut total = 0;
    for name in ["alice", "bob", "carol"] {
        let receipt = call(&app, &claim(packet_id, name, &format!("key-{}", name))).await;
        assert!(!receipt.replayed);
        assert!(receipt.share_amount == 333 || receipt.share_amount == 334);
        total += receipt.share_amount;

        let balance = call(
            &app,
            &account::GetBalance {
                account_id: name.into(),
            },
        )
        .await;
        assert_eq!(balance.balance, receipt.share_amount);
    }
    assert_eq!(total, 1000);

    let view = call(&app, &packet::GetPacket { packet_id }).await;
    assert_eq!(view.status, PacketStatus::Exhausted);
    assert_eq!(view.claimed_amount, 1000);
    assert_eq!(view.participants.len(), 3);

    let (status, body) = send(&app, &claim(packet_id, "dave", "key-dave")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "NO_SHARES_REMAINING");
    assert_eq!(body["error"]["category"], "conflict");

    let ledger = call(
        &app,
        &account::GetLedger {
            account_id: "alice".into(),
        },
    )
    .await;
    assert_eq!(ledger.len(), 1);

    let notifications = call(
        &app,
        &account::GetNotifications {
            account_id: "owner".into(),
        },
    )
    .await;
    // funded + one per claimed share
    assert_eq!(notifications.len(), 4);
}

#[tokio::test]
async fn test_claim_retry_replays_receipt() {
    let (app, _temp) = create_test_app();
    let packet_id = funded(&app, 500, 5, SplitPolicy::Random).await;

    let first = call(&app, &claim(packet_id, "alice", "k-1")).await;
    let second = call(&app, &claim(packet_id, "alice", "k-1")).await;
    assert!(second.replayed);
    assert_eq!(first.claim_id, second.claim_id);
    assert_eq!(first.share_amount, second.share_amount);

    let (status, body) = send(&app, &claim(packet_id, "alice", "k-2")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "ALREADY_CLAIMED");

    let (status, body) = send(&app, &claim(packet_id, "bob", "k-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "IDEMPOTENCY_CONFLICT");

    let balance = call(
        &app,
        &account::GetBalance {
            account_id: "alice".into(),
        },
    )
    .await;
    assert_eq!(balance.balance, first.share_amount);
    assert_eq!(balance.entry_count, 1);
}

#[tokio::test]
async fn test_claim_on_pending_packet_conflicts() {
    let (app, _temp) = create_test_app();
    let created = create(&app, 100, 2, SplitPolicy::Even).await;

    let (status, body) = send(&app, &claim(created.packet_id, "alice", "k")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "PACKET_NOT_ACTIVE");
}

#[tokio::test]
async fn test_duplicate_callback_is_acknowledged() {
    let (app, _temp) = create_test_app();
    let created = create(&app, 700, 7, SplitPolicy::Random).await;

    let first = call(&app, &callback(created.packet_id, "tx-dup", 700)).await;
    assert_eq!(first.result, "applied");
    assert_eq!(first.status, Some(PaymentStatus::Confirmed));

    let second = call(&app, &callback(created.packet_id, "tx-dup", 700)).await;
    assert_eq!(second.result, "duplicate");
    assert_eq!(second.status, None);

    let notifications = call(
        &app,
        &account::GetNotifications {
            account_id: "owner".into(),
        },
    )
    .await;
    assert_eq!(notifications.len(), 1);
}

#[tokio::test]
async fn test_amount_mismatch_is_reported() {
    let (app, _temp) = create_test_app();
    let created = create(&app, 1000, 4, SplitPolicy::Even).await;

    let (status, body) = send(&app, &callback(created.packet_id, "tx-short", 999)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "AMOUNT_MISMATCH");
    assert_eq!(body["error"]["category"], "anomaly");

    let view = call(&app, &packet::GetPacket { packet_id: created.packet_id }).await;
    assert_eq!(view.status, PacketStatus::Pending);

    let anomalies = call(&app, &ops::ListAnomalies { limit: Some(10) }).await;
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].gateway_tx_id, "tx-short");
    assert_eq!(anomalies[0].packet_id, created.packet_id);

    // Redelivery of the recorded transaction is a no-op
    let ack = call(&app, &callback(created.packet_id, "tx-short", 999)).await;
    assert_eq!(ack.result, "duplicate");
}

#[tokio::test]
async fn test_callback_for_unknown_packet() {
    let (app, _temp) = create_test_app();

    let ghost = callback(PacketId::new(), "tx-ghost", 100);
    let (status, body) = send(&app, &ghost).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "PACKET_NOT_FOUND");

    let anomalies = call(&app, &ops::ListAnomalies { limit: None }).await;
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].gateway_tx_id, "tx-ghost");

    // The gateway's redelivery gets a success acknowledgement
    let ack = call(&app, &ghost).await;
    assert_eq!(ack.result, "duplicate");
}

#[tokio::test]
async fn test_request_validation() {
    let (app, _temp) = create_test_app();

    let (status, body) = send(
        &app,
        &packet::CreatePacket(CreatePacketRequest {
            owner_id: "owner".into(),
            total_amount: 2,
            share_count: 3,
            policy: SplitPolicy::Even,
            greeting: None,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_ALLOCATION");

    let request = Request::builder()
        .method(Method::GET)
        .uri("/packets/not-a-uuid")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_raw(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "VALIDATION_ERROR");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/packets")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send_raw(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "BAD_REQUEST");

    let (status, body) = send(&app, &packet::GetPacket { packet_id: PacketId::new() }).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "PACKET_NOT_FOUND");
}

#[tokio::test]
async fn test_invitation_rewards() {
    let (app, _temp) = create_test_app();

    let registered = call(
        &app,
        &invitation::RegisterInvitation(RegisterInvitationRequest {
            inviter_id: "alice".into(),
            invitee_id: "bob".into(),
        }),
    )
    .await;
    assert_eq!(registered.inviter_id.as_str(), "alice");

    let (status, body) = send(
        &app,
        &invitation::RegisterInvitation(RegisterInvitationRequest {
            inviter_id: "carol".into(),
            invitee_id: "bob".into(),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "ALREADY_INVITED");

    let (status, _) = send(
        &app,
        &invitation::RegisterInvitation(RegisterInvitationRequest {
            inviter_id: "dave".into(),
            invitee_id: "dave".into(),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let packet_id = funded(&app, 1000, 2, SplitPolicy::Even).await;
    call(&app, &claim(packet_id, "bob", "bob-1")).await;
    // Replay must not credit twice
    call(&app, &claim(packet_id, "bob", "bob-1")).await;

    let credits = call(
        &app,
        &account::GetInvitationCredits {
            account_id: "alice".into(),
        },
    )
    .await;
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].invitee_id.as_str(), "bob");

    let coupons = call(
        &app,
        &account::GetCoupons {
            account_id: "bob".into(),
        },
    )
    .await;
    assert_eq!(coupons.len(), 1);
    assert_eq!(coupons[0].packet_id, packet_id);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let (app, _temp) = create_test_app();

    let health = call(&app, &ops::Health).await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.service, "packet-engine");
    assert!(health.last_sweep.is_none());

    let packet_id = funded(&app, 300, 3, SplitPolicy::Even).await;
    call(&app, &claim(packet_id, "alice", "a")).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_raw(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("packet_created_total 1"));
    assert!(text.contains("packet_claims_total{outcome=\"granted\"} 1"));
}
