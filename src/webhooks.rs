//! Inbound PSP webhook surface (spec §6): `payment_intent.succeeded`,
//! `transfer.created`, `charge.refunded`. This is not the product API — it
//! is the one HTTP surface the money engine itself depends on to learn that
//! an async PSP side-effect landed, so it stays in this crate rather than
//! the outer application.

use crate::error::MoneyError;
use crate::fee::FeeSchedule;
use crate::money_state_machine::{self, ActorContext, HandleRequest};
use crate::psp_bridge::PspClient;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

pub struct WebhookState<C: PspClient> {
    pub pool: PgPool,
    pub psp_bridge: Arc<crate::psp_bridge::PspBridge<C>>,
    pub fees: Box<dyn FeeSchedule>,
}

type SharedWebhookState<C> = Arc<WebhookState<C>>;

#[derive(Debug, Deserialize)]
pub struct PspWebhookPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub task_id: Uuid,
}

pub fn router<C: PspClient + 'static>(state: SharedWebhookState<C>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/psp", post(psp_webhook::<C>))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn error_response(err: MoneyError) -> (StatusCode, Json<Value>) {
    let status = match err.code() {
        crate::error::ErrorCode::NotFound => StatusCode::NOT_FOUND,
        crate::error::ErrorCode::InvalidTransition
        | crate::error::ErrorCode::InvariantViolation
        | crate::error::ErrorCode::PspApiError => StatusCode::UNPROCESSABLE_ENTITY,
        crate::error::ErrorCode::IdempotentReplay => StatusCode::OK,
        crate::error::ErrorCode::BlockedByKillSwitch => StatusCode::SERVICE_UNAVAILABLE,
        crate::error::ErrorCode::Conflict => StatusCode::CONFLICT,
        crate::error::ErrorCode::PspTimeout => StatusCode::GATEWAY_TIMEOUT,
        crate::error::ErrorCode::LedgerDrift => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(error = %err, "webhook: money engine rejected event");
    (status, Json(json!({ "error": err.to_string() })))
}

async fn psp_webhook<C: PspClient>(
    State(state): State<SharedWebhookState<C>>,
    Json(payload): Json<PspWebhookPayload>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let event = match payload.event_type.as_str() {
        "payment_intent.succeeded" => crate::models::MoneyEventType::HoldEscrow,
        "transfer.created" => crate::models::MoneyEventType::ReleasePayout,
        "charge.refunded" => crate::models::MoneyEventType::RefundEscrow,
        other => {
            tracing::warn!(event_type = other, "webhook: unrecognized PSP event type");
            return Ok(Json(json!({ "status": "ignored" })));
        }
    };

    let result = money_state_machine::handle(
        &state.pool,
        HandleRequest {
            task_id: payload.task_id,
            event,
            event_id: Uuid::new_v4(),
            external_event_id: Some(payload.id.clone()),
            actor: ActorContext::default(),
            psp_bridge: state.psp_bridge.as_ref(),
            fees: state.fees.as_ref(),
        },
    )
    .await;

    match result {
        Ok(outcome) => Ok(Json(json!({
            "status": "processed",
            "new_money_state": format!("{:?}", outcome.new_money_state),
        }))),
        Err(MoneyError::IdempotentReplay { .. }) => Ok(Json(json!({ "status": "duplicate" }))),
        Err(e) => Err(error_response(e)),
    }
}
