//! Chunk persistence and context assembly.
//!
//! Vectors are stored as little-endian f32 blobs and scored with cosine
//! similarity in-process. Result sets per document are small enough that a
//! full scan per query is fine; swap the scan for a vector index before the
//! corpus outgrows it.
//!
//! Each operation names its context policy explicitly: chat pulls the most
//! relevant chunks for the question, summaries walk the document in page
//! order. Neither ever mixes documents or users.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use crate::models::Chunk;

/// How context chunks are chosen for a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPolicy {
    /// Top-k by cosine similarity against a query embedding, floor applied.
    Relevance,
    /// First n chunks in document order, independent of any query.
    Sequential,
}

/// A retrieved chunk with its similarity score (1.0 for sequential picks).
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Persist chunks and their embeddings in one transaction.
///
/// Chunks and vectors land together or not at all, so a document is never
/// half-searchable.
pub async fn store_chunks(
    pool: &SqlitePool,
    user_id: &str,
    chunks: &[Chunk],
    embeddings: &[Vec<f32>],
    model: &str,
) -> Result<()> {
    anyhow::ensure!(
        chunks.len() == embeddings.len(),
        "chunk/embedding count mismatch: {} vs {}",
        chunks.len(),
        embeddings.len()
    );

    let mut tx = pool.begin().await?;
    for (chunk, embedding) in chunks.iter().zip(embeddings) {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, user_id, chunk_index, page_number, start_offset, text, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(user_id)
        .bind(chunk.chunk_index)
        .bind(chunk.page_number)
        .bind(chunk.start_offset)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, document_id, user_id, model, dims, embedding)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(user_id)
        .bind(model)
        .bind(embedding.len() as i64)
        .bind(vec_to_blob(embedding))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    debug!(count = chunks.len(), "stored chunks with embeddings");
    Ok(())
}

/// Persist chunks without vectors. Relevance search will find nothing for
/// the document; sequential selection still works.
pub async fn store_chunks_plain(pool: &SqlitePool, user_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, user_id, chunk_index, page_number, start_offset, text, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(user_id)
        .bind(chunk.chunk_index)
        .bind(chunk.page_number)
        .bind(chunk.start_offset)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Top-k chunks of one document by cosine similarity to the query text.
///
/// Chunks scoring below `min_similarity` are dropped even when fewer than
/// `top_k` remain. Results come back ordered best-first.
pub async fn search_similar(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    document_id: &str,
    query: &str,
    top_k: usize,
    min_similarity: f32,
) -> Result<Vec<ScoredChunk>> {
    let query_vec = crate::embedding::embed_query(embedder, query)
        .await
        .context("Failed to embed query")?;

    let rows = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.chunk_index, c.page_number, c.start_offset,
               c.text, c.hash, v.embedding
        FROM chunks c
        JOIN chunk_vectors v ON v.chunk_id = c.id
        WHERE c.document_id = ?
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    let mut scored: Vec<ScoredChunk> = rows
        .into_iter()
        .filter_map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(&query_vec, &blob_to_vec(&blob));
            if score < min_similarity {
                return None;
            }
            Some(ScoredChunk {
                chunk: row_to_chunk(&row),
                score,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);

    debug!(
        document_id,
        hits = scored.len(),
        "similarity search complete"
    );
    Ok(scored)
}

/// The first `limit` chunks of a document in chunk order.
pub async fn sequential_chunks(
    pool: &SqlitePool,
    document_id: &str,
    limit: usize,
) -> Result<Vec<ScoredChunk>> {
    let rows = sqlx::query(
        r#"
        SELECT id, document_id, chunk_index, page_number, start_offset, text, hash
        FROM chunks
        WHERE document_id = ?
        ORDER BY chunk_index
        LIMIT ?
        "#,
    )
    .bind(document_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ScoredChunk {
            chunk: row_to_chunk(row),
            score: 1.0,
        })
        .collect())
}

/// Join chunk texts into a prompt context block, page-annotated.
pub fn format_context(chunks: &[ScoredChunk]) -> String {
    let mut out = String::new();
    for scored in chunks {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!(
            "[Page {}]\n{}",
            scored.chunk.page_number, scored.chunk.text
        ));
    }
    out
}

pub async fn delete_document_data(pool: &SqlitePool, document_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chat_messages WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        page_number: row.get("page_number"),
        start_offset: row.get("start_offset"),
        text: row.get("text"),
        hash: row.get("hash"),
    }
}
