//! Document ingestion pipeline.
//!
//! Upload bytes go through format detection, text extraction, the scanned
//! heuristic with its OCR fallback, chunking, and embedding, ending in a
//! `ready` or `failed` document row. The row is written up front in
//! `processing` state so the caller can poll while the pipeline runs.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::{assign_pages, chunk_text};
use crate::config::Config;
use crate::detect::{detect_kind, DocumentKind, SUPPORTED_FORMATS};
use crate::embedding::Embedder;
use crate::extract::{
    assemble_pages, extract_docx, extract_pdf_pages, extract_plain_text, extract_pptx,
    require_min_content, ExtractError,
};
use crate::ledger::{self, BillableOp, QuotaOutcome};
use crate::models::{Document, DocumentStatus, Extraction};
use crate::ocr::{recognize_batch, OcrClient};
use crate::rasterize::{self, RenderError};
use crate::scan::is_scanned;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Unsupported format '{0}'. Supported: {SUPPORTED_FORMATS}")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("Document appears to be scanned and no OCR endpoint is configured")]
    OcrUnavailable,
    #[error("Failed to rasterize PDF: {0}")]
    Render(#[from] RenderError),
    #[error("OCR quota denied: {0:?}")]
    QuotaDenied(QuotaOutcome),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// An upload as received from the API or CLI, before any processing.
#[derive(Debug, Clone)]
pub struct Upload {
    pub user_id: String,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub struct IngestDeps {
    pub embedder: Option<Arc<dyn Embedder>>,
    pub ocr: Option<Arc<dyn OcrClient>>,
}

/// Run the full pipeline for one upload.
///
/// A `processing` row exists for the document's whole lifetime; it flips to
/// `ready` or `failed`, never back. Extraction failures are recorded on the
/// row and also returned to the caller.
pub async fn ingest_document(
    pool: &SqlitePool,
    config: &Config,
    deps: &IngestDeps,
    upload: Upload,
) -> Result<Document, IngestError> {
    let kind = detect_kind(&upload.content_type, &upload.filename);
    if kind == DocumentKind::Unknown {
        return Err(IngestError::UnsupportedFormat(upload.content_type.clone()));
    }

    let document_id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO documents (id, user_id, title, kind, content_type, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'processing', ?, ?)
        "#,
    )
    .bind(&document_id)
    .bind(&upload.user_id)
    .bind(&upload.filename)
    .bind(kind.as_str())
    .bind(&upload.content_type)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(anyhow::Error::from)?;

    match process(pool, config, deps, &document_id, kind, &upload).await {
        Ok(document) => Ok(document),
        Err(e) => {
            warn!(document_id, error = %e, "ingestion failed");
            mark_status(pool, &document_id, DocumentStatus::Failed, 0, false)
                .await
                .map_err(anyhow::Error::from)?;
            Err(e)
        }
    }
}

async fn process(
    pool: &SqlitePool,
    config: &Config,
    deps: &IngestDeps,
    document_id: &str,
    kind: DocumentKind,
    upload: &Upload,
) -> Result<Document, IngestError> {
    let extraction = extract(pool, config, deps, kind, upload).await?;
    require_min_content(&extraction.text)?;

    let (text, page_starts) = assemble_pages(&extraction.pages);
    let mut chunks = chunk_text(
        document_id,
        &text,
        config.chunking.chunk_size,
        config.chunking.overlap,
    )?;
    assign_pages(&mut chunks, &page_starts);

    match &deps.embedder {
        Some(embedder) => {
            let mut embeddings = Vec::with_capacity(chunks.len());
            for batch in chunks.chunks(config.embedding.batch_size) {
                let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
                embeddings.extend(embedder.embed(&texts).await?);
            }
            crate::retrieval::store_chunks(
                pool,
                &upload.user_id,
                &chunks,
                &embeddings,
                embedder.model_name(),
            )
            .await?;
        }
        None => {
            crate::retrieval::store_chunks_plain(pool, &upload.user_id, &chunks).await?;
        }
    }

    let page_count = extraction.pages.len() as i64;
    mark_status(
        pool,
        document_id,
        DocumentStatus::Ready,
        page_count,
        extraction.used_ocr,
    )
    .await
    .map_err(anyhow::Error::from)?;

    info!(
        document_id,
        kind = kind.as_str(),
        pages = page_count,
        chunks = chunks.len(),
        used_ocr = extraction.used_ocr,
        "document ingested"
    );

    Ok(Document {
        id: document_id.to_string(),
        user_id: upload.user_id.clone(),
        title: upload.filename.clone(),
        kind: kind.as_str().to_string(),
        content_type: upload.content_type.clone(),
        status: DocumentStatus::Ready,
        page_count,
        used_ocr: extraction.used_ocr,
        created_at: Utc::now().timestamp(),
        updated_at: Utc::now().timestamp(),
    })
}

async fn extract(
    pool: &SqlitePool,
    config: &Config,
    deps: &IngestDeps,
    kind: DocumentKind,
    upload: &Upload,
) -> Result<Extraction, IngestError> {
    match kind {
        DocumentKind::Pdf => extract_pdf(pool, config, deps, upload).await,
        DocumentKind::Docx => Ok(crate::extract::single_page(
            extract_docx(&upload.bytes)?,
            false,
        )),
        DocumentKind::Pptx => Ok(crate::extract::single_page(
            extract_pptx(&upload.bytes)?,
            false,
        )),
        DocumentKind::Text => Ok(crate::extract::single_page(
            extract_plain_text(&upload.bytes),
            false,
        )),
        DocumentKind::Image => {
            let ocr = deps.ocr.as_ref().ok_or(IngestError::OcrUnavailable)?;
            charge_ocr(pool, config, &upload.user_id, 1).await?;
            let text = ocr
                .recognize(&upload.bytes)
                .await
                .map_err(|e| IngestError::Other(e.into()))?;
            Ok(crate::extract::single_page(text, true))
        }
        DocumentKind::Unknown => Err(IngestError::UnsupportedFormat(upload.content_type.clone())),
    }
}

/// PDF path: native text first, OCR fallback when the scanned heuristic
/// trips. Rasterization runs on the blocking pool; pdfium is not async-safe.
async fn extract_pdf(
    pool: &SqlitePool,
    config: &Config,
    deps: &IngestDeps,
    upload: &Upload,
) -> Result<Extraction, IngestError> {
    let pages = extract_pdf_pages(&upload.bytes)?;

    if !is_scanned(&pages, &config.scan) {
        let (text, _) = assemble_pages(&pages);
        return Ok(Extraction {
            text,
            pages,
            used_ocr: false,
        });
    }

    let ocr = deps.ocr.as_ref().ok_or(IngestError::OcrUnavailable)?;
    info!(pages = pages.len(), "scanned PDF detected, falling back to OCR");

    let bytes = upload.bytes.clone();
    let scale = config.ocr.scale;
    let images = tokio::task::spawn_blocking(move || rasterize::render_all_pages(&bytes, scale))
        .await
        .map_err(|e| IngestError::Other(e.into()))??;

    charge_ocr(pool, config, &upload.user_id, images.len() as i64).await?;

    let ocr_pages = recognize_batch(ocr.clone(), images, config.ocr.workers).await;
    let (text, _) = assemble_pages(&ocr_pages);
    Ok(Extraction {
        text,
        pages: ocr_pages,
        used_ocr: true,
    })
}

async fn charge_ocr(
    pool: &SqlitePool,
    config: &Config,
    user_id: &str,
    pages: i64,
) -> Result<(), IngestError> {
    let outcome =
        ledger::check_and_consume(pool, &config.plans, user_id, BillableOp::OcrPage, pages).await?;
    if outcome != QuotaOutcome::Allowed {
        return Err(IngestError::QuotaDenied(outcome));
    }
    Ok(())
}

async fn mark_status(
    pool: &SqlitePool,
    document_id: &str,
    status: DocumentStatus,
    page_count: i64,
    used_ocr: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE documents SET status = ?, page_count = ?, used_ocr = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(page_count)
    .bind(used_ocr)
    .bind(Utc::now().timestamp())
    .bind(document_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_document(pool: &SqlitePool, document_id: &str) -> Result<Option<Document>> {
    use sqlx::Row;
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            let status_str: String = row.get("status");
            let status = DocumentStatus::parse(&status_str)
                .ok_or_else(|| anyhow::anyhow!("unknown document status: {}", status_str))?;
            Ok(Some(Document {
                id: row.get("id"),
                user_id: row.get("user_id"),
                title: row.get("title"),
                kind: row.get("kind"),
                content_type: row.get("content_type"),
                status,
                page_count: row.get("page_count"),
                used_ocr: row.get::<i64, _>("used_ocr") != 0,
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            }))
        }
        None => Ok(None),
    }
}
