//! Wire types and typed endpoint definitions
//!
//! Every route has an [`Endpoint`] struct naming its method, path, body and
//! response type, so clients and tests build requests without hand-written
//! URLs.

use axum::{
    body::Body,
    http::{header, Method, Request},
};
use chrono::{DateTime, Utc};
use packet_core::{PacketId, PacketStatus, PaymentStatus, SplitPolicy, SweepReport};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A route of the HTTP API
pub trait Endpoint {
    /// JSON body of a successful response
    type Response: DeserializeOwned;

    /// HTTP method
    const METHOD: Method;

    /// Path including query string
    fn path(&self) -> String;

    /// JSON request body
    fn body(&self) -> Option<serde_json::Value> {
        None
    }

    /// Build the HTTP request
    fn build_request(&self) -> axum::http::Result<Request<Body>> {
        let builder = Request::builder().method(Self::METHOD).uri(self.path());
        match self.body() {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
    }
}

/// `POST /packets` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePacketRequest {
    pub owner_id: String,
    pub total_amount: u64,
    pub share_count: u32,
    pub policy: SplitPolicy,
    #[serde(default)]
    pub greeting: Option<String>,
}

/// `POST /packets` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePacketResponse {
    pub packet_id: PacketId,
    pub status: PacketStatus,
    pub total_amount: u64,
    pub share_count: u32,
    pub expires_at: DateTime<Utc>,
    pub funding_deadline: DateTime<Utc>,
}

/// `POST /packets/{id}/claims` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimPacketRequest {
    pub account_id: String,
    pub idempotency_key: String,
}

/// `POST /payments/callback` body, after signature verification upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCallbackRequest {
    pub gateway_tx_id: String,
    pub packet_id: PacketId,
    pub amount: u64,
    pub raw_payload: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub outcome: Option<packet_core::CallbackOutcome>,
}

/// Callback acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    /// `applied` or `duplicate`
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PaymentStatus>,
}

/// `POST /invitations` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInvitationRequest {
    pub inviter_id: String,
    pub invitee_id: String,
}

/// `GET /anomalies` query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyQuery {
    pub limit: Option<usize>,
}

/// `GET /health` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub last_sweep: Option<SweepReport>,
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub category: String,
}

pub mod packet {
    use super::*;
    use packet_core::{ClaimReceipt, PacketView};

    pub struct CreatePacket(pub CreatePacketRequest);

    impl Endpoint for CreatePacket {
        type Response = CreatePacketResponse;
        const METHOD: Method = Method::POST;

        fn path(&self) -> String {
            "/packets".to_string()
        }

        fn body(&self) -> Option<serde_json::Value> {
            serde_json::to_value(&self.0).ok()
        }
    }

    pub struct GetPacket {
        pub packet_id: PacketId,
    }

    impl Endpoint for GetPacket {
        type Response = PacketView;
        const METHOD: Method = Method::GET;

        fn path(&self) -> String {
            format!("/packets/{}", self.packet_id)
        }
    }

    pub struct ClaimPacket {
        pub packet_id: PacketId,
        pub request: ClaimPacketRequest,
    }

    impl Endpoint for ClaimPacket {
        type Response = ClaimReceipt;
        const METHOD: Method = Method::POST;

        fn path(&self) -> String {
            format!("/packets/{}/claims", self.packet_id)
        }

        fn body(&self) -> Option<serde_json::Value> {
            serde_json::to_value(&self.request).ok()
        }
    }
}

pub mod payment {
    use super::*;

    pub struct PaymentCallback(pub PaymentCallbackRequest);

    impl Endpoint for PaymentCallback {
        type Response = CallbackResponse;
        const METHOD: Method = Method::POST;

        fn path(&self) -> String {
            "/payments/callback".to_string()
        }

        fn body(&self) -> Option<serde_json::Value> {
            serde_json::to_value(&self.0).ok()
        }
    }
}

pub mod account {
    use super::*;
    use packet_core::{AccountBalance, CouponGrant, InvitationCredit, LedgerEntry, Notification};

    macro_rules! account_endpoint {
        ($name:ident, $suffix:literal, $response:ty) => {
            pub struct $name {
                pub account_id: String,
            }

            impl Endpoint for $name {
                type Response = $response;
                const METHOD: Method = Method::GET;

                fn path(&self) -> String {
                    format!("/accounts/{}/{}", self.account_id, $suffix)
                }
            }
        };
    }

    account_endpoint!(GetBalance, "balance", AccountBalance);
    account_endpoint!(GetLedger, "ledger", Vec<LedgerEntry>);
    account_endpoint!(GetCoupons, "coupons", Vec<CouponGrant>);
    account_endpoint!(GetInvitationCredits, "invitations", Vec<InvitationCredit>);
    account_endpoint!(GetNotifications, "notifications", Vec<Notification>);
}

pub mod invitation {
    use super::*;
    use packet_core::Invitation;

    pub struct RegisterInvitation(pub RegisterInvitationRequest);

    impl Endpoint for RegisterInvitation {
        type Response = Invitation;
        const METHOD: Method = Method::POST;

        fn path(&self) -> String {
            "/invitations".to_string()
        }

        fn body(&self) -> Option<serde_json::Value> {
            serde_json::to_value(&self.0).ok()
        }
    }
}

pub mod ops {
    use super::*;
    use packet_core::Anomaly;

    pub struct Health;

    impl Endpoint for Health {
        type Response = HealthResponse;
        const METHOD: Method = Method::GET;

        fn path(&self) -> String {
            "/health".to_string()
        }
    }

    pub struct ListAnomalies {
        pub limit: Option<usize>,
    }

    impl Endpoint for ListAnomalies {
        type Response = Vec<Anomaly>;
        const METHOD: Method = Method::GET;

        fn path(&self) -> String {
            match self.limit {
                Some(limit) => format!("/anomalies?limit={}", limit),
                None => "/anomalies".to_string(),
            }
        }
    }
}
