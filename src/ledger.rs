//! Credit and usage ledger: the single quota gate for billable operations.
//!
//! Two policies sit behind one `check_and_consume` call:
//! - free/basic plans count operations in a fixed window (day or month) and
//!   reject at the plan cap;
//! - pro/elite plans (and one-off purchases) debit a credit balance.
//!
//! Both run as single conditional SQL statements, so concurrent requests
//! from the same user cannot drive a balance negative or slip past a cap.
//! The gate runs before any external provider call is made.

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::config::PlansConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Free,
    Basic,
    Pro,
    Elite,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Basic => "basic",
            Plan::Pro => "pro",
            Plan::Elite => "elite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Plan::Free),
            "basic" => Some(Plan::Basic),
            "pro" => Some(Plan::Pro),
            "elite" => Some(Plan::Elite),
            _ => None,
        }
    }

    /// Credit-metered plans debit the balance; the others use counters.
    pub fn uses_credits(&self) -> bool {
        matches!(self, Plan::Pro | Plan::Elite)
    }
}

/// A billable operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillableOp {
    Chat,
    Summary,
    OcrPage,
}

impl BillableOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillableOp::Chat => "chat",
            BillableOp::Summary => "summary",
            BillableOp::OcrPage => "ocr_page",
        }
    }

    pub fn cost(&self, plans: &PlansConfig) -> i64 {
        match self {
            BillableOp::Chat => plans.chat_cost,
            BillableOp::Summary => plans.summary_cost,
            BillableOp::OcrPage => plans.ocr_page_cost,
        }
    }
}

/// Result of the quota gate. `Allowed` means the cost was already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    Allowed,
    DailyLimitReached,
    MonthlyLimitReached,
    InsufficientCredits,
}

impl QuotaOutcome {
    /// Wire code matching the product's error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            QuotaOutcome::Allowed => "ALLOWED",
            QuotaOutcome::DailyLimitReached => "DAILY_LIMIT_REACHED",
            QuotaOutcome::MonthlyLimitReached => "MONTHLY_LIMIT_REACHED",
            QuotaOutcome::InsufficientCredits => "INSUFFICIENT_CREDITS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: String,
    pub plan: Plan,
    pub credits: i64,
}

/// Create the account if it does not exist. Existing rows are untouched.
pub async fn ensure_account(pool: &SqlitePool, user_id: &str, plan: Plan) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO accounts (user_id, plan, credits, created_at, updated_at)
        VALUES (?, ?, 0, ?, ?)
        ON CONFLICT(user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(plan.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_account(pool: &SqlitePool, user_id: &str) -> Result<Option<Account>> {
    let row = sqlx::query("SELECT user_id, plan, credits FROM accounts WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let plan_str: String = row.get("plan");
            let plan = Plan::parse(&plan_str)
                .ok_or_else(|| anyhow::anyhow!("unknown plan in accounts row: {}", plan_str))?;
            Ok(Some(Account {
                user_id: row.get("user_id"),
                plan,
                credits: row.get("credits"),
            }))
        }
        None => Ok(None),
    }
}

pub async fn resolve_token(pool: &SqlitePool, token: &str) -> Result<Option<String>> {
    let user_id: Option<String> =
        sqlx::query_scalar("SELECT user_id FROM accounts WHERE api_token = ?")
            .bind(token)
            .fetch_optional(pool)
            .await?;
    Ok(user_id)
}

pub async fn set_api_token(pool: &SqlitePool, user_id: &str, token: &str) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query("UPDATE accounts SET api_token = ?, updated_at = ? WHERE user_id = ?")
        .bind(token)
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Add credits (purchase or webhook grant). Negative amounts are rejected.
pub async fn grant_credits(pool: &SqlitePool, user_id: &str, amount: i64) -> Result<i64> {
    if amount < 0 {
        bail!("credit grants must be non-negative");
    }
    let now = Utc::now().timestamp();
    sqlx::query("UPDATE accounts SET credits = credits + ?, updated_at = ? WHERE user_id = ?")
        .bind(amount)
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await?;
    let balance: i64 = sqlx::query_scalar("SELECT credits FROM accounts WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(balance)
}

pub async fn set_plan(pool: &SqlitePool, user_id: &str, plan: Plan) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query("UPDATE accounts SET plan = ?, updated_at = ? WHERE user_id = ?")
        .bind(plan.as_str())
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Gate a billable operation of `units` events, consuming quota on success.
///
/// Counter plans count `units` events toward the window cap; credit plans
/// debit `units × cost`. Rejection consumes nothing — the balance is never
/// clamped and the counter never exceeds the cap.
pub async fn check_and_consume(
    pool: &SqlitePool,
    plans: &PlansConfig,
    user_id: &str,
    op: BillableOp,
    units: i64,
) -> Result<QuotaOutcome> {
    if units <= 0 {
        bail!("units must be > 0");
    }

    let account = get_account(pool, user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no account for user {}", user_id))?;

    if account.plan.uses_credits() {
        let cost = op.cost(plans) * units;
        return deduct_credits(pool, user_id, cost).await;
    }

    let (window, cap, limit_outcome) = match account.plan {
        Plan::Free => (
            Utc::now().format("%Y-%m-%d").to_string(),
            plans.free_daily_limit,
            QuotaOutcome::DailyLimitReached,
        ),
        Plan::Basic => (
            Utc::now().format("%Y-%m").to_string(),
            plans.basic_monthly_limit,
            QuotaOutcome::MonthlyLimitReached,
        ),
        _ => unreachable!(),
    };

    // Single upsert with a cap guard: the conflict branch only fires while
    // the incremented count stays within the cap, so concurrent requests
    // cannot overshoot.
    let result = sqlx::query(
        r#"
        INSERT INTO usage_counters (user_id, op, window_start, count)
        SELECT ?1, ?2, ?3, ?4 WHERE ?4 <= ?5
        ON CONFLICT(user_id, op, window_start) DO UPDATE SET count = count + ?4
        WHERE count + ?4 <= ?5
        "#,
    )
    .bind(user_id)
    .bind(op.as_str())
    .bind(&window)
    .bind(units)
    .bind(cap)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(limit_outcome);
    }
    Ok(QuotaOutcome::Allowed)
}

/// Atomic conditional decrement. The WHERE clause is the whole concurrency
/// story: the balance can never go below zero because an insufficient
/// balance simply matches no row.
pub async fn deduct_credits(
    pool: &SqlitePool,
    user_id: &str,
    cost: i64,
) -> Result<QuotaOutcome> {
    if cost == 0 {
        return Ok(QuotaOutcome::Allowed);
    }
    let now = Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        UPDATE accounts SET credits = credits - ?1, updated_at = ?2
        WHERE user_id = ?3 AND credits >= ?1
        "#,
    )
    .bind(cost)
    .bind(now)
    .bind(user_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(QuotaOutcome::InsufficientCredits);
    }
    Ok(QuotaOutcome::Allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    async fn setup() -> SqlitePool {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn credits_reject_when_insufficient() {
        let pool = setup().await;
        let plans = PlansConfig::default();
        ensure_account(&pool, "u1", Plan::Pro).await.unwrap();
        grant_credits(&pool, "u1", 2).await.unwrap();

        assert_eq!(
            check_and_consume(&pool, &plans, "u1", BillableOp::Chat, 1)
                .await
                .unwrap(),
            QuotaOutcome::Allowed
        );
        assert_eq!(
            check_and_consume(&pool, &plans, "u1", BillableOp::Chat, 1)
                .await
                .unwrap(),
            QuotaOutcome::Allowed
        );
        // Balance is now 0: rejected, not clamped.
        assert_eq!(
            check_and_consume(&pool, &plans, "u1", BillableOp::Chat, 1)
                .await
                .unwrap(),
            QuotaOutcome::InsufficientCredits
        );
        let account = get_account(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(account.credits, 0);
    }

    #[tokio::test]
    async fn zero_balance_rejected_before_anything_else() {
        let pool = setup().await;
        let plans = PlansConfig::default();
        ensure_account(&pool, "u1", Plan::Pro).await.unwrap();
        assert_eq!(
            check_and_consume(&pool, &plans, "u1", BillableOp::Chat, 1)
                .await
                .unwrap(),
            QuotaOutcome::InsufficientCredits
        );
    }

    #[tokio::test]
    async fn multi_unit_deduction_is_all_or_nothing() {
        let pool = setup().await;
        let plans = PlansConfig::default();
        ensure_account(&pool, "u1", Plan::Elite).await.unwrap();
        grant_credits(&pool, "u1", 2).await.unwrap();

        // 3 OCR pages cost 3; only 2 available.
        assert_eq!(
            check_and_consume(&pool, &plans, "u1", BillableOp::OcrPage, 3)
                .await
                .unwrap(),
            QuotaOutcome::InsufficientCredits
        );
        let account = get_account(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(account.credits, 2);
    }

    #[tokio::test]
    async fn concurrent_decrements_never_go_negative() {
        let pool = setup().await;
        ensure_account(&pool, "u1", Plan::Pro).await.unwrap();
        grant_credits(&pool, "u1", 5).await.unwrap();

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let pool = pool.clone();
            set.spawn(async move { deduct_credits(&pool, "u1", 1).await.unwrap() });
        }
        let mut allowed = 0;
        while let Some(outcome) = set.join_next().await {
            if outcome.unwrap() == QuotaOutcome::Allowed {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 5);
        let account = get_account(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(account.credits, 0);
    }

    #[tokio::test]
    async fn free_plan_hits_daily_cap() {
        let pool = setup().await;
        let plans = PlansConfig {
            free_daily_limit: 3,
            ..Default::default()
        };
        ensure_account(&pool, "u1", Plan::Free).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                check_and_consume(&pool, &plans, "u1", BillableOp::Chat, 1)
                    .await
                    .unwrap(),
                QuotaOutcome::Allowed
            );
        }
        assert_eq!(
            check_and_consume(&pool, &plans, "u1", BillableOp::Chat, 1)
                .await
                .unwrap(),
            QuotaOutcome::DailyLimitReached
        );
    }

    #[tokio::test]
    async fn basic_plan_reports_monthly_code() {
        let pool = setup().await;
        let plans = PlansConfig {
            basic_monthly_limit: 1,
            ..Default::default()
        };
        ensure_account(&pool, "u1", Plan::Basic).await.unwrap();

        assert_eq!(
            check_and_consume(&pool, &plans, "u1", BillableOp::Summary, 1)
                .await
                .unwrap(),
            QuotaOutcome::Allowed
        );
        let outcome = check_and_consume(&pool, &plans, "u1", BillableOp::Summary, 1)
            .await
            .unwrap();
        assert_eq!(outcome, QuotaOutcome::MonthlyLimitReached);
        assert_eq!(outcome.code(), "MONTHLY_LIMIT_REACHED");
    }

    #[tokio::test]
    async fn ops_are_counted_separately() {
        let pool = setup().await;
        let plans = PlansConfig {
            free_daily_limit: 1,
            ..Default::default()
        };
        ensure_account(&pool, "u1", Plan::Free).await.unwrap();

        assert_eq!(
            check_and_consume(&pool, &plans, "u1", BillableOp::Chat, 1)
                .await
                .unwrap(),
            QuotaOutcome::Allowed
        );
        // Chat cap reached; summaries have their own counter.
        assert_eq!(
            check_and_consume(&pool, &plans, "u1", BillableOp::Summary, 1)
                .await
                .unwrap(),
            QuotaOutcome::Allowed
        );
    }

    #[tokio::test]
    async fn token_resolution() {
        let pool = setup().await;
        ensure_account(&pool, "u1", Plan::Free).await.unwrap();
        set_api_token(&pool, "u1", "tok-abc").await.unwrap();
        assert_eq!(
            resolve_token(&pool, "tok-abc").await.unwrap().as_deref(),
            Some("u1")
        );
        assert_eq!(resolve_token(&pool, "nope").await.unwrap(), None);
    }
}
