//! PSP Bridge (spec §4.3): idempotent outbound calls to the external payment
//! processor, a mirror log of every successful call, and split-brain
//! recovery when the process dies between the PSP call and the local
//! commit.
//!
//! The mirror insert (`psp_outbound_log`) is deliberately issued outside the
//! enclosing ledger transaction (spec §9): it is the only durable evidence
//! that the external call already happened, so a crash after the mirror
//! write but before the ledger commit is recoverable by the Reaper using
//! the mirrored `psp_id` as authoritative.

use crate::error::{MoneyError, MoneyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlx::{PgPool, Row};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "psp_call_type", rename_all = "snake_case")]
pub enum PspCallType {
    CapturePaymentIntent,
    CreateTransfer,
    CreateRefund,
    CreateReversal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub payment_intent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub destination: String,
    pub transfer_group: Option<String>,
    pub metadata: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub payment_intent_id: String,
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalRequest {
    pub transfer_id: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PspObject {
    pub psp_id: String,
    pub status: String,
    pub charge_id: Option<String>,
    pub raw: Json,
}

/// Classification of a failed PSP call. `Timeout` means "unknown outcome,
/// safe to retry with the same key"; `ApiError` means "the PSP deterministically
/// rejected this, do not retry automatically" (spec §4.3 steps 4-5).
#[derive(Debug, Clone)]
pub enum PspFailure {
    Timeout(String),
    ApiError(String),
}

impl From<PspFailure> for MoneyError {
    fn from(f: PspFailure) -> Self {
        match f {
            PspFailure::Timeout(msg) => MoneyError::PspTimeout(msg),
            PspFailure::ApiError(msg) => MoneyError::PspApiError(msg),
        }
    }
}

fn validate_amount(amount_cents: i64) -> Result<(), PspFailure> {
    if amount_cents <= 0 {
        return Err(PspFailure::ApiError(
            "amount must be a positive integer number of cents".into(),
        ));
    }
    Ok(())
}

/// The external PSP surface the bridge consumes (spec §6). Implementations
/// must accept and forward the idempotency key on every mutating call; the
/// bridge itself refuses to call without one.
#[async_trait]
pub trait PspClient: Send + Sync {
    async fn capture_payment_intent(
        &self,
        req: &CaptureRequest,
        idempotency_key: &str,
    ) -> Result<PspObject, PspFailure>;

    async fn create_transfer(
        &self,
        req: &TransferRequest,
        idempotency_key: &str,
    ) -> Result<PspObject, PspFailure>;

    async fn create_refund(
        &self,
        req: &RefundRequest,
        idempotency_key: &str,
    ) -> Result<PspObject, PspFailure>;

    async fn create_reversal(
        &self,
        req: &ReversalRequest,
        idempotency_key: &str,
    ) -> Result<PspObject, PspFailure>;

    async fn retrieve_balance(&self) -> anyhow::Result<PspBalance>;
    async fn list_balance_transactions(&self, since: chrono::DateTime<chrono::Utc>)
        -> anyhow::Result<Vec<PspBalanceTransaction>>;
}

#[derive(Debug, Clone)]
pub struct PspBalance {
    pub available_cents: i64,
    pub pending_cents: i64,
}

#[derive(Debug, Clone)]
pub struct PspBalanceTransaction {
    pub id: String,
    pub amount_cents: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The bridge itself: looks up the mirror before calling out, never calls
/// the PSP twice for the same key, and writes the mirror row on success.
pub struct PspBridge<C: PspClient> {
    client: C,
    call_timeout: Duration,
}

impl<C: PspClient> PspBridge<C> {
    pub fn new(client: C, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    async fn mirrored(pool: &PgPool, idempotency_key: &str) -> MoneyResult<Option<PspObject>> {
        let row = sqlx::query(
            "SELECT psp_id, payload FROM psp_outbound_log WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|r| {
            let payload: Json = r.get("payload");
            PspObject {
                psp_id: r.get("psp_id"),
                status: payload
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                charge_id: payload
                    .get("charge_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                raw: payload,
            }
        }))
    }

    async fn record_mirror(
        pool: &PgPool,
        idempotency_key: &str,
        call_type: PspCallType,
        obj: &PspObject,
    ) -> MoneyResult<()> {
        sqlx::query(
            "INSERT INTO psp_outbound_log (idempotency_key, psp_id, type, payload)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(idempotency_key)
        .bind(call_type)
        .bind(&obj.psp_id)
        .bind(&obj.raw)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Capture a payment intent (HOLD_ESCROW's PSP leg).
    pub async fn capture_payment_intent(
        &self,
        pool: &PgPool,
        req: CaptureRequest,
        idempotency_key: &str,
    ) -> MoneyResult<PspObject> {
        if idempotency_key.is_empty() {
            return Err(MoneyError::InvariantViolation(
                "PSP bridge refuses calls without an idempotency key".into(),
            ));
        }
        if let Some(mirrored) = Self::mirrored(pool, idempotency_key).await? {
            tracing::debug!(idempotency_key, "psp bridge: mirror hit, skipping call");
            return Ok(mirrored);
        }
        let result = tokio::time::timeout(
            self.call_timeout,
            self.client.capture_payment_intent(&req, idempotency_key),
        )
        .await;
        let obj = match result {
            Ok(Ok(obj)) => obj,
            Ok(Err(failure)) => {
                tracing::warn!(idempotency_key, ?failure, "psp capture failed");
                return Err(failure.into());
            }
            Err(_) => return Err(MoneyError::PspTimeout("capture_payment_intent".into())),
        };
        Self::record_mirror(pool, idempotency_key, PspCallType::CapturePaymentIntent, &obj)
            .await?;
        Ok(obj)
    }

    pub async fn create_transfer(
        &self,
        pool: &PgPool,
        req: TransferRequest,
        idempotency_key: &str,
    ) -> MoneyResult<PspObject> {
        if idempotency_key.is_empty() {
            return Err(MoneyError::InvariantViolation(
                "PSP bridge refuses calls without an idempotency key".into(),
            ));
        }
        validate_amount(req.amount_cents).map_err(MoneyError::from)?;
        if req.currency != "USD" {
            return Err(MoneyError::InvariantViolation(
                "only USD is supported".into(),
            ));
        }
        if req.destination.is_empty() {
            return Err(MoneyError::InvariantViolation(
                "transfer destination is required".into(),
            ));
        }
        if let Some(mirrored) = Self::mirrored(pool, idempotency_key).await? {
            tracing::debug!(idempotency_key, "psp bridge: mirror hit, skipping call");
            return Ok(mirrored);
        }
        let result = tokio::time::timeout(
            self.call_timeout,
            self.client.create_transfer(&req, idempotency_key),
        )
        .await;
        let obj = match result {
            Ok(Ok(obj)) => obj,
            Ok(Err(failure)) => return Err(failure.into()),
            Err(_) => return Err(MoneyError::PspTimeout("create_transfer".into())),
        };
        Self::record_mirror(pool, idempotency_key, PspCallType::CreateTransfer, &obj).await?;
        Ok(obj)
    }

    pub async fn create_refund(
        &self,
        pool: &PgPool,
        req: RefundRequest,
        idempotency_key: &str,
    ) -> MoneyResult<PspObject> {
        if idempotency_key.is_empty() {
            return Err(MoneyError::InvariantViolation(
                "PSP bridge refuses calls without an idempotency key".into(),
            ));
        }
        if let Some(mirrored) = Self::mirrored(pool, idempotency_key).await? {
            return Ok(mirrored);
        }
        let result = tokio::time::timeout(
            self.call_timeout,
            self.client.create_refund(&req, idempotency_key),
        )
        .await;
        let obj = match result {
            Ok(Ok(obj)) => obj,
            Ok(Err(failure)) => return Err(failure.into()),
            Err(_) => return Err(MoneyError::PspTimeout("create_refund".into())),
        };
        Self::record_mirror(pool, idempotency_key, PspCallType::CreateRefund, &obj).await?;
        Ok(obj)
    }

    pub async fn create_reversal(
        &self,
        pool: &PgPool,
        req: ReversalRequest,
        idempotency_key: &str,
    ) -> MoneyResult<PspObject> {
        if idempotency_key.is_empty() {
            return Err(MoneyError::InvariantViolation(
                "PSP bridge refuses calls without an idempotency key".into(),
            ));
        }
        validate_amount(req.amount_cents).map_err(MoneyError::from)?;
        if let Some(mirrored) = Self::mirrored(pool, idempotency_key).await? {
            return Ok(mirrored);
        }
        let result = tokio::time::timeout(
            self.call_timeout,
            self.client.create_reversal(&req, idempotency_key),
        )
        .await;
        let obj = match result {
            Ok(Ok(obj)) => obj,
            Ok(Err(failure)) => return Err(failure.into()),
            Err(_) => return Err(MoneyError::PspTimeout("create_reversal".into())),
        };
        Self::record_mirror(pool, idempotency_key, PspCallType::CreateReversal, &obj).await?;
        Ok(obj)
    }

    pub async fn retrieve_balance(&self) -> anyhow::Result<PspBalance> {
        self.client.retrieve_balance().await
    }

    pub async fn list_balance_transactions(
        &self,
        since: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<Vec<PspBalanceTransaction>> {
        self.client.list_balance_transactions(since).await
    }
}

/// Thin `reqwest`-based client against a generic PSP HTTP surface
/// (`paymentIntents.capture`, `transfers.create`, `refunds.create`,
/// `transfers.createReversal`, `balance.retrieve`) per spec §6. The wire
/// format is intentionally generic; only the `PspClient` trait boundary is
/// load-bearing for the core.
pub struct HttpPspClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpPspClient {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            secret_key: secret_key.into(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.secret_key)
    }

    fn classify_status(status: reqwest::StatusCode) -> PspFailure {
        if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            PspFailure::Timeout(format!("psp returned {status}"))
        } else {
            PspFailure::ApiError(format!("psp returned {status}"))
        }
    }
}

#[async_trait]
impl PspClient for HttpPspClient {
    async fn capture_payment_intent(
        &self,
        req: &CaptureRequest,
        idempotency_key: &str,
    ) -> Result<PspObject, PspFailure> {
        let resp = self
            .http
            .post(format!(
                "{}/payment_intents/{}/capture",
                self.base_url, req.payment_intent_id
            ))
            .header("Authorization", self.auth_header())
            .header("Idempotency-Key", idempotency_key)
            .send()
            .await
            .map_err(|e| PspFailure::Timeout(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_status(resp.status()));
        }
        let raw: Json = resp
            .json()
            .await
            .map_err(|e| PspFailure::ApiError(e.to_string()))?;
        Ok(parse_psp_object(raw))
    }

    async fn create_transfer(
        &self,
        req: &TransferRequest,
        idempotency_key: &str,
    ) -> Result<PspObject, PspFailure> {
        let resp = self
            .http
            .post(format!("{}/transfers", self.base_url))
            .header("Authorization", self.auth_header())
            .header("Idempotency-Key", idempotency_key)
            .json(req)
            .send()
            .await
            .map_err(|e| PspFailure::Timeout(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_status(resp.status()));
        }
        let raw: Json = resp
            .json()
            .await
            .map_err(|e| PspFailure::ApiError(e.to_string()))?;
        Ok(parse_psp_object(raw))
    }

    async fn create_refund(
        &self,
        req: &RefundRequest,
        idempotency_key: &str,
    ) -> Result<PspObject, PspFailure> {
        let resp = self
            .http
            .post(format!("{}/refunds", self.base_url))
            .header("Authorization", self.auth_header())
            .header("Idempotency-Key", idempotency_key)
            .json(req)
            .send()
            .await
            .map_err(|e| PspFailure::Timeout(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_status(resp.status()));
        }
        let raw: Json = resp
            .json()
            .await
            .map_err(|e| PspFailure::ApiError(e.to_string()))?;
        Ok(parse_psp_object(raw))
    }

    async fn create_reversal(
        &self,
        req: &ReversalRequest,
        idempotency_key: &str,
    ) -> Result<PspObject, PspFailure> {
        let resp = self
            .http
            .post(format!(
                "{}/transfers/{}/reversals",
                self.base_url, req.transfer_id
            ))
            .header("Authorization", self.auth_header())
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({ "amount": req.amount_cents }))
            .send()
            .await
            .map_err(|e| PspFailure::Timeout(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_status(resp.status()));
        }
        let raw: Json = resp
            .json()
            .await
            .map_err(|e| PspFailure::ApiError(e.to_string()))?;
        Ok(parse_psp_object(raw))
    }

    async fn retrieve_balance(&self) -> anyhow::Result<PspBalance> {
        let resp = self
            .http
            .get(format!("{}/balance", self.base_url))
            .header("Authorization", self.auth_header())
            .send()
            .await?
            .json::<Json>()
            .await?;
        Ok(PspBalance {
            available_cents: resp.get("available_cents").and_then(|v| v.as_i64()).unwrap_or(0),
            pending_cents: resp.get("pending_cents").and_then(|v| v.as_i64()).unwrap_or(0),
        })
    }

    async fn list_balance_transactions(
        &self,
        since: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<Vec<PspBalanceTransaction>> {
        let resp = self
            .http
            .get(format!("{}/balance_transactions", self.base_url))
            .header("Authorization", self.auth_header())
            .query(&[("since", since.timestamp().to_string())])
            .send()
            .await?
            .json::<Json>()
            .await?;
        let items = resp
            .get("data")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|item| {
                Some(PspBalanceTransaction {
                    id: item.get("id")?.as_str()?.to_string(),
                    amount_cents: item.get("amount_cents")?.as_i64()?,
                    created_at: chrono::DateTime::from_timestamp(
                        item.get("created")?.as_i64()?,
                        0,
                    )?,
                })
            })
            .collect())
    }
}

fn parse_psp_object(raw: Json) -> PspObject {
    PspObject {
        psp_id: raw
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        status: raw
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("succeeded")
            .to_string(),
        charge_id: raw
            .get("charge_id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        raw,
    }
}
