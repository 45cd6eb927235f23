//! Chat and summarization over ingested documents.
//!
//! Both operations follow the same shape: resolve the document, choose
//! context under a named policy, gate on the quota ledger, then call the
//! completion backend. The gate always runs before the provider call, so a
//! rejected request costs nothing upstream. Summaries check the cache before
//! the gate; a cache hit is free.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{summary_key, SummaryCache};
use crate::completion::{
    complete_with_retry, CompletionError, CompletionProvider, Message, Role,
};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::ledger::{self, BillableOp, QuotaOutcome};
use crate::models::{ChatMessage, DocumentStatus, MessageRole};
use crate::retrieval::{self, ContextPolicy};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Document not found")]
    DocumentNotFound,
    #[error("Document is not ready (status: {0})")]
    DocumentNotReady(&'static str),
    #[error("Quota denied: {0:?}")]
    QuotaDenied(QuotaOutcome),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub context_chunks: usize,
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub cached: bool,
}

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions about a \
document. Answer using only the provided document excerpts. If the excerpts do not contain \
the answer, say so instead of guessing.";

const SUMMARY_SYSTEM_PROMPT: &str = "You are a helpful assistant. Write a concise summary of \
the provided document excerpts, covering the main points in order.";

/// Answer a question about a document, grounded in its most relevant chunks.
pub async fn ask(
    pool: &SqlitePool,
    config: &Config,
    embedder: &dyn Embedder,
    provider: Arc<dyn CompletionProvider>,
    user_id: &str,
    document_id: &str,
    question: &str,
) -> Result<Answer, ChatError> {
    require_ready(pool, user_id, document_id).await?;

    let outcome =
        ledger::check_and_consume(pool, &config.plans, user_id, BillableOp::Chat, 1).await?;
    if outcome != QuotaOutcome::Allowed {
        return Err(ChatError::QuotaDenied(outcome));
    }

    let (context, context_chunks) = build_context(
        pool,
        config,
        Some(embedder),
        document_id,
        ContextPolicy::Relevance,
        Some(question),
    )
    .await?;

    let mut messages = vec![Message {
        role: Role::System,
        content: format!("{CHAT_SYSTEM_PROMPT}\n\nDocument excerpts:\n{context}"),
    }];
    for prior in load_history(pool, document_id, user_id, config.completion.history_turns).await? {
        messages.push(Message {
            role: match prior.role {
                MessageRole::User => Role::User,
                MessageRole::Ai => Role::Assistant,
            },
            content: prior.content,
        });
    }
    messages.push(Message {
        role: Role::User,
        content: question.to_string(),
    });

    let completion = complete_with_retry(
        provider.as_ref(),
        &messages,
        config.completion.max_tokens,
        config.completion.temperature,
        config.completion.max_attempts,
    )
    .await?;

    save_message(pool, document_id, user_id, MessageRole::User, question).await?;
    save_message(pool, document_id, user_id, MessageRole::Ai, &completion.text).await?;

    info!(
        document_id,
        provider = provider.name(),
        input_tokens = completion.input_tokens,
        output_tokens = completion.output_tokens,
        "chat answered"
    );

    Ok(Answer {
        text: completion.text,
        input_tokens: completion.input_tokens,
        output_tokens: completion.output_tokens,
        context_chunks,
    })
}

/// Summarize a document from its leading chunks in page order.
///
/// The cache key covers the exact context text, so re-ingestion or config
/// changes naturally miss. Cache hits return before the quota gate.
pub async fn summarize(
    pool: &SqlitePool,
    config: &Config,
    provider: Arc<dyn CompletionProvider>,
    cache: &SummaryCache,
    user_id: &str,
    document_id: &str,
) -> Result<Summary, ChatError> {
    require_ready(pool, user_id, document_id).await?;

    let (context, _) = build_context(
        pool,
        config,
        None,
        document_id,
        ContextPolicy::Sequential,
        None,
    )
    .await?;

    let key = summary_key(document_id, "summary", &context);
    if let Some(text) = cache.get(&key) {
        debug!(document_id, "summary cache hit");
        return Ok(Summary { text, cached: true });
    }

    let outcome =
        ledger::check_and_consume(pool, &config.plans, user_id, BillableOp::Summary, 1).await?;
    if outcome != QuotaOutcome::Allowed {
        return Err(ChatError::QuotaDenied(outcome));
    }

    let messages = vec![
        Message {
            role: Role::System,
            content: SUMMARY_SYSTEM_PROMPT.to_string(),
        },
        Message {
            role: Role::User,
            content: format!("Document excerpts:\n{context}"),
        },
    ];

    let completion = complete_with_retry(
        provider.as_ref(),
        &messages,
        config.completion.max_tokens,
        config.completion.temperature,
        config.completion.max_attempts,
    )
    .await?;

    cache.put(key, completion.text.clone());
    info!(document_id, provider = provider.name(), "summary generated");

    Ok(Summary {
        text: completion.text,
        cached: false,
    })
}

/// Assemble the context block for one completion under the given policy.
async fn build_context(
    pool: &SqlitePool,
    config: &Config,
    embedder: Option<&dyn Embedder>,
    document_id: &str,
    policy: ContextPolicy,
    query: Option<&str>,
) -> Result<(String, usize), ChatError> {
    let chunks = match policy {
        ContextPolicy::Relevance => {
            let embedder = embedder
                .ok_or_else(|| anyhow::anyhow!("relevance policy requires an embedder"))?;
            let query =
                query.ok_or_else(|| anyhow::anyhow!("relevance policy requires a query"))?;
            retrieval::search_similar(
                pool,
                embedder,
                document_id,
                query,
                config.retrieval.top_k,
                config.retrieval.min_similarity,
            )
            .await?
        }
        ContextPolicy::Sequential => {
            retrieval::sequential_chunks(pool, document_id, config.retrieval.sequential_limit)
                .await?
        }
    };

    let count = chunks.len();
    let mut context = retrieval::format_context(&chunks);
    if policy == ContextPolicy::Sequential {
        // Keep the prompt inside the summary character budget.
        let budget = config.chunking.summary_window;
        if context.chars().count() > budget {
            context = context.chars().take(budget).collect();
        }
    }
    Ok((context, count))
}

async fn require_ready(
    pool: &SqlitePool,
    user_id: &str,
    document_id: &str,
) -> Result<(), ChatError> {
    let row = sqlx::query("SELECT user_id, status FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await
        .map_err(anyhow::Error::from)?;

    let row = row.ok_or(ChatError::DocumentNotFound)?;
    let owner: String = row.get("user_id");
    // Other users' documents are indistinguishable from missing ones.
    if owner != user_id {
        return Err(ChatError::DocumentNotFound);
    }

    let status_str: String = row.get("status");
    match DocumentStatus::parse(&status_str) {
        Some(DocumentStatus::Ready) => Ok(()),
        Some(DocumentStatus::Processing) => Err(ChatError::DocumentNotReady("processing")),
        Some(DocumentStatus::Failed) => Err(ChatError::DocumentNotReady("failed")),
        None => Err(anyhow::anyhow!("unknown document status: {}", status_str).into()),
    }
}

pub async fn save_message(
    pool: &SqlitePool,
    document_id: &str,
    user_id: &str,
    role: MessageRole,
    content: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chat_messages (id, document_id, user_id, role, content, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(document_id)
    .bind(user_id)
    .bind(role.as_str())
    .bind(content)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// The last `turns` user/ai pairs, oldest first.
pub async fn load_history(
    pool: &SqlitePool,
    document_id: &str,
    user_id: &str,
    turns: usize,
) -> Result<Vec<ChatMessage>> {
    let mut messages = list_messages(pool, document_id, user_id, turns * 2).await?;
    messages.reverse();
    Ok(messages)
}

/// The most recent `limit` messages, newest first.
pub async fn list_messages(
    pool: &SqlitePool,
    document_id: &str,
    user_id: &str,
    limit: usize,
) -> Result<Vec<ChatMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT id, document_id, user_id, role, content, created_at
        FROM chat_messages
        WHERE document_id = ? AND user_id = ?
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(document_id)
    .bind(user_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let role_str: String = row.get("role");
            let role = MessageRole::parse(&role_str)
                .ok_or_else(|| anyhow::anyhow!("unknown message role: {}", role_str))?;
            Ok(ChatMessage {
                id: row.get("id"),
                document_id: row.get("document_id"),
                user_id: row.get("user_id"),
                role,
                content: row.get("content"),
                created_at: row.get("created_at"),
            })
        })
        .collect()
}
