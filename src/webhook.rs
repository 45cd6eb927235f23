//! Payment webhook verification and application.
//!
//! The raw request body is authenticated with HMAC-SHA256 over the exact
//! bytes received; parsing happens only after the signature checks out.
//! Events are applied at most once: the event id lands in
//! `processed_webhooks` first, and a replayed id is acknowledged without
//! touching the account again.

use anyhow::Result;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use crate::ledger::Plan;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("malformed event payload: {0}")]
    MalformedPayload(String),
    #[error("unknown plan: {0}")]
    UnknownPlan(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A parsed payment event. `credits` and `plan` are both optional; a
/// purchase carries credits, a subscription change carries a plan.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: String,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub credits: Option<i64>,
}

/// Check the hex-encoded HMAC-SHA256 signature against the raw body.
///
/// Comparison goes through the Mac verifier, which is constant-time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> Result<(), WebhookError> {
    let signature =
        hex::decode(signature_hex.trim()).map_err(|_| WebhookError::MalformedSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| WebhookError::Other(anyhow::anyhow!("invalid HMAC key: {e}")))?;
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Outcome of handling a verified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    Replayed,
    Ignored,
}

/// Verify, parse, and apply one webhook delivery.
///
/// Any signature or parse failure leaves the database untouched.
pub async fn handle_webhook(
    pool: &SqlitePool,
    secret: &[u8],
    body: &[u8],
    signature_hex: &str,
) -> Result<WebhookOutcome, WebhookError> {
    verify_signature(secret, body, signature_hex)?;

    let event: PaymentEvent = serde_json::from_slice(body)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    apply_event(pool, &event).await
}

/// What a validated event does to the account.
enum EventAction {
    GrantCredits(i64),
    SetPlan(Plan),
    Ignore,
}

/// Apply a parsed event, with at-most-once semantics per event id.
///
/// Validation happens before the event id is claimed, and the claim shares
/// a transaction with the account mutation. A failed apply therefore rolls
/// the claim back, so the provider's retry of the same delivery can still
/// succeed; only a fully applied event id is ever recorded.
pub async fn apply_event(
    pool: &SqlitePool,
    event: &PaymentEvent,
) -> Result<WebhookOutcome, WebhookError> {
    let action = match event.event_type.as_str() {
        "payment.succeeded" | "credits.purchased" => {
            let credits = event
                .credits
                .ok_or_else(|| WebhookError::MalformedPayload("missing credits".into()))?;
            if credits < 0 {
                return Err(WebhookError::MalformedPayload("negative credits".into()));
            }
            EventAction::GrantCredits(credits)
        }
        "subscription.updated" => {
            let plan_str = event
                .plan
                .as_deref()
                .ok_or_else(|| WebhookError::MalformedPayload("missing plan".into()))?;
            let plan = Plan::parse(plan_str)
                .ok_or_else(|| WebhookError::UnknownPlan(plan_str.to_string()))?;
            EventAction::SetPlan(plan)
        }
        other => {
            // Unknown event types are acknowledged so the sender stops
            // retrying, but nothing is applied or claimed.
            warn!(event_id = %event.id, event_type = other, "ignoring unknown webhook event type");
            return Ok(WebhookOutcome::Ignored);
        }
    };

    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await.map_err(anyhow::Error::from)?;

    // Claim the event id. INSERT OR IGNORE makes the claim race-safe;
    // losing the race means another delivery already applied it.
    let claimed = sqlx::query(
        "INSERT OR IGNORE INTO processed_webhooks (event_id, received_at) VALUES (?, ?)",
    )
    .bind(&event.id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(anyhow::Error::from)?;

    if claimed.rows_affected() == 0 {
        info!(event_id = %event.id, "webhook replay acknowledged");
        return Ok(WebhookOutcome::Replayed);
    }

    let default_plan = match action {
        EventAction::SetPlan(plan) => plan,
        _ => Plan::Free,
    };
    sqlx::query(
        r#"
        INSERT INTO accounts (user_id, plan, credits, created_at, updated_at)
        VALUES (?, ?, 0, ?, ?)
        ON CONFLICT(user_id) DO NOTHING
        "#,
    )
    .bind(&event.user_id)
    .bind(default_plan.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(anyhow::Error::from)?;

    match action {
        EventAction::GrantCredits(credits) => {
            sqlx::query(
                "UPDATE accounts SET credits = credits + ?, updated_at = ? WHERE user_id = ?",
            )
            .bind(credits)
            .bind(now)
            .bind(&event.user_id)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;
            info!(event_id = %event.id, user_id = %event.user_id, credits, "credits granted");
        }
        EventAction::SetPlan(plan) => {
            sqlx::query("UPDATE accounts SET plan = ?, updated_at = ? WHERE user_id = ?")
                .bind(plan.as_str())
                .bind(now)
                .bind(&event.user_id)
                .execute(&mut *tx)
                .await
                .map_err(anyhow::Error::from)?;
            info!(event_id = %event.id, user_id = %event.user_id, plan = plan.as_str(), "plan updated");
        }
        EventAction::Ignore => unreachable!(),
    }

    tx.commit().await.map_err(anyhow::Error::from)?;
    Ok(WebhookOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::ledger;
    use crate::migrate;

    const SECRET: &[u8] = b"whsec_test";

    fn sign(body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    async fn setup() -> SqlitePool {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn valid_event_grants_credits() {
        let pool = setup().await;
        let body = br#"{"id":"evt_1","type":"credits.purchased","user_id":"u1","credits":50}"#;

        let outcome = handle_webhook(&pool, SECRET, body, &sign(body))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let account = ledger::get_account(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(account.credits, 50);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected_without_state_change() {
        let pool = setup().await;
        let body = br#"{"id":"evt_1","type":"credits.purchased","user_id":"u1","credits":50}"#;
        let signature = sign(body);
        let tampered = br#"{"id":"evt_1","type":"credits.purchased","user_id":"u1","credits":5000}"#;

        let err = handle_webhook(&pool, SECRET, tampered, &signature)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));

        assert!(ledger::get_account(&pool, "u1").await.unwrap().is_none());
        let processed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_webhooks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(processed, 0);
    }

    #[tokio::test]
    async fn garbage_signature_header_is_rejected() {
        let pool = setup().await;
        let body = br#"{"id":"evt_1","type":"credits.purchased","user_id":"u1","credits":50}"#;
        let err = handle_webhook(&pool, SECRET, body, "not-hex!")
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::MalformedSignature));
    }

    #[tokio::test]
    async fn replayed_event_applies_once() {
        let pool = setup().await;
        let body = br#"{"id":"evt_1","type":"credits.purchased","user_id":"u1","credits":50}"#;
        let signature = sign(body);

        assert_eq!(
            handle_webhook(&pool, SECRET, body, &signature).await.unwrap(),
            WebhookOutcome::Applied
        );
        assert_eq!(
            handle_webhook(&pool, SECRET, body, &signature).await.unwrap(),
            WebhookOutcome::Replayed
        );

        let account = ledger::get_account(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(account.credits, 50);
    }

    #[tokio::test]
    async fn subscription_update_switches_plan() {
        let pool = setup().await;
        let body = br#"{"id":"evt_2","type":"subscription.updated","user_id":"u1","plan":"pro"}"#;

        let outcome = handle_webhook(&pool, SECRET, body, &sign(body))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let account = ledger::get_account(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(account.plan, Plan::Pro);
    }

    #[tokio::test]
    async fn rejected_event_does_not_burn_its_id() {
        let pool = setup().await;

        // First delivery is missing the credits field and must be rejected
        // without claiming the event id.
        let bad = br#"{"id":"evt_1","type":"payment.succeeded","user_id":"u1"}"#;
        let err = handle_webhook(&pool, SECRET, bad, &sign(bad)).await.unwrap_err();
        assert!(matches!(err, WebhookError::MalformedPayload(_)));

        let claimed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_webhooks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(claimed, 0);

        // The provider's corrected redelivery of the same event id applies.
        let good = br#"{"id":"evt_1","type":"payment.succeeded","user_id":"u1","credits":50}"#;
        assert_eq!(
            handle_webhook(&pool, SECRET, good, &sign(good)).await.unwrap(),
            WebhookOutcome::Applied
        );
        let account = ledger::get_account(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(account.credits, 50);
    }

    #[tokio::test]
    async fn unknown_plan_does_not_burn_its_id() {
        let pool = setup().await;

        let bad = br#"{"id":"evt_2","type":"subscription.updated","user_id":"u1","plan":"gold"}"#;
        let err = handle_webhook(&pool, SECRET, bad, &sign(bad)).await.unwrap_err();
        assert!(matches!(err, WebhookError::UnknownPlan(_)));

        let good = br#"{"id":"evt_2","type":"subscription.updated","user_id":"u1","plan":"pro"}"#;
        assert_eq!(
            handle_webhook(&pool, SECRET, good, &sign(good)).await.unwrap(),
            WebhookOutcome::Applied
        );
        let account = ledger::get_account(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(account.plan, Plan::Pro);
    }

    #[tokio::test]
    async fn unknown_event_type_is_acknowledged_not_applied() {
        let pool = setup().await;
        let body = br#"{"id":"evt_3","type":"invoice.finalized","user_id":"u1"}"#;
        let outcome = handle_webhook(&pool, SECRET, body, &sign(body))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(ledger::get_account(&pool, "u1").await.unwrap().is_none());
    }
}
