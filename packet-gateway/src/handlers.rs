//! Route handlers

use crate::{
    api::{
        AnomalyQuery, CallbackResponse, ClaimPacketRequest, CreatePacketRequest,
        CreatePacketResponse, HealthResponse, PaymentCallbackRequest, RegisterInvitationRequest,
    },
    error::ApiError,
    AppState,
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use packet_core::{
    AccountBalance, AccountId, Anomaly, CallbackAck, ClaimReceipt, ClaimRequest, CouponGrant,
    CreatePacket, Error, Invitation, InvitationCredit, LedgerEntry, Notification, PacketId,
    PacketView, PaymentCallback,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Default page size for `GET /anomalies`
pub const DEFAULT_ANOMALY_LIMIT: usize = 50;

/// Largest page size for `GET /anomalies`
pub const MAX_ANOMALY_LIMIT: usize = 500;

type ApiResult<T> = Result<T, ApiError>;

fn parse_packet_id(raw: &str) -> ApiResult<PacketId> {
    Uuid::parse_str(raw)
        .map(PacketId::from_uuid)
        .map_err(|_| Error::Validation(format!("invalid packet id: {}", raw)).into())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = state.engine.config();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: config.service_name.clone(),
        version: config.service_version.clone(),
        last_sweep: state.engine.last_sweep(),
    })
}

/// `GET /metrics` in Prometheus text format
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let body = state.engine.metrics().export().map_err(Error::from)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

/// `POST /packets`
pub async fn create_packet(
    State(state): State<AppState>,
    payload: Result<Json<CreatePacketRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreatePacketResponse>)> {
    let Json(request) = payload?;

    let packet = state
        .engine
        .create_packet(CreatePacket {
            owner_id: AccountId::new(request.owner_id),
            total_amount: request.total_amount,
            share_count: request.share_count,
            policy: request.policy,
            greeting: request.greeting,
        })
        .await?;

    info!(packet_id = %packet.packet_id, "Packet created via API");

    Ok((
        StatusCode::CREATED,
        Json(CreatePacketResponse {
            packet_id: packet.packet_id,
            status: packet.status,
            total_amount: packet.total_amount,
            share_count: packet.share_count,
            expires_at: packet.expires_at,
            funding_deadline: packet.funding_deadline,
        }),
    ))
}

/// `GET /packets/{id}`
pub async fn get_packet(
    State(state): State<AppState>,
    Path(packet_id): Path<String>,
) -> ApiResult<Json<PacketView>> {
    let packet_id = parse_packet_id(&packet_id)?;
    Ok(Json(state.engine.packet(packet_id)?))
}

/// `POST /packets/{id}/claims`
pub async fn claim_packet(
    State(state): State<AppState>,
    Path(packet_id): Path<String>,
    payload: Result<Json<ClaimPacketRequest>, JsonRejection>,
) -> ApiResult<Json<ClaimReceipt>> {
    let packet_id = parse_packet_id(&packet_id)?;
    let Json(request) = payload?;

    let receipt = state
        .engine
        .claim(ClaimRequest {
            packet_id,
            account_id: AccountId::new(request.account_id),
            idempotency_key: request.idempotency_key,
        })
        .await?;
    Ok(Json(receipt))
}

/// `POST /payments/callback`
///
/// Signatures are verified before requests reach this service.
pub async fn payment_callback(
    State(state): State<AppState>,
    payload: Result<Json<PaymentCallbackRequest>, JsonRejection>,
) -> ApiResult<Json<CallbackResponse>> {
    let Json(request) = payload?;
    if request.signature.is_some() {
        debug!(gateway_tx_id = %request.gateway_tx_id, "Callback carries a signature");
    }

    let ack = state
        .engine
        .handle_callback(PaymentCallback {
            gateway_tx_id: request.gateway_tx_id,
            packet_id: request.packet_id,
            amount: request.amount,
            raw_payload: request.raw_payload,
            outcome: request.outcome.unwrap_or_default(),
        })
        .await?;

    let response = match ack {
        CallbackAck::Applied(status) => CallbackResponse {
            result: "applied".to_string(),
            status: Some(status),
        },
        CallbackAck::Duplicate => CallbackResponse {
            result: "duplicate".to_string(),
            status: None,
        },
    };
    Ok(Json(response))
}

/// `GET /accounts/{id}/balance`
pub async fn get_balance(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult<Json<AccountBalance>> {
    Ok(Json(state.engine.balance(&AccountId::new(account_id))?))
}

/// `GET /accounts/{id}/ledger`
pub async fn get_ledger(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult<Json<Vec<LedgerEntry>>> {
    Ok(Json(state.engine.ledger_entries(&AccountId::new(account_id))?))
}

/// `GET /accounts/{id}/coupons`
pub async fn get_coupons(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult<Json<Vec<CouponGrant>>> {
    Ok(Json(state.engine.coupons(&AccountId::new(account_id))?))
}

/// `GET /accounts/{id}/invitations`
pub async fn get_invitation_credits(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult<Json<Vec<InvitationCredit>>> {
    Ok(Json(
        state
            .engine
            .invitation_credits(&AccountId::new(account_id))?,
    ))
}

/// `GET /accounts/{id}/notifications`
pub async fn get_notifications(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult<Json<Vec<Notification>>> {
    Ok(Json(state.engine.notifications(&AccountId::new(account_id))?))
}

/// `POST /invitations`
pub async fn register_invitation(
    State(state): State<AppState>,
    payload: Result<Json<RegisterInvitationRequest>, JsonRejection>,
) -> ApiResult<Json<Invitation>> {
    let Json(request) = payload?;
    let invitation = state
        .engine
        .register_invitation(
            &AccountId::new(request.inviter_id),
            &AccountId::new(request.invitee_id),
        )
        .await?;
    Ok(Json(invitation))
}

/// `GET /anomalies?limit=N`, newest first
pub async fn list_anomalies(
    State(state): State<AppState>,
    query: Result<Query<AnomalyQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Anomaly>>> {
    let Query(query) = query?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ANOMALY_LIMIT)
        .clamp(1, MAX_ANOMALY_LIMIT);
    Ok(Json(state.engine.anomalies(limit)?))
}
