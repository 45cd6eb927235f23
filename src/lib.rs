//! # DocChat
//!
//! Core engine for a document-chat service: upload a document, extract and
//! chunk its text, embed the chunks, then ask questions or request summaries
//! grounded in the document, with per-plan metering of every billable call.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────┐   ┌──────────┐
//! │  Upload  │──▶│ Detect → Extract  │──▶│  SQLite   │
//! │ PDF/DOCX │   │ (OCR fallback)    │   │ chunks +  │
//! │ PPTX/... │   │ Chunk + Embed     │   │ vectors   │
//! └──────────┘   └───────────────────┘   └────┬─────┘
//!                                             │
//!                      ┌──────────────────────┤
//!                      ▼                      ▼
//!                ┌───────────┐          ┌───────────┐
//!                │   Chat    │          │  Summary  │
//!                │ relevance │          │ page order│
//!                └─────┬─────┘          └─────┬─────┘
//!                      └───── quota gate ─────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`detect`] | Upload format classification |
//! | [`extract`] | PDF/DOCX/PPTX/plain-text extraction |
//! | [`scan`] | Scanned-document heuristic |
//! | [`rasterize`] | PDF page rendering for OCR |
//! | [`ocr`] | OCR client and batching |
//! | [`chunk`] | Sliding-window text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`retrieval`] | Vector search and context assembly |
//! | [`completion`] | Chat completion providers and fallback |
//! | [`chat`] | Question answering and summarization |
//! | [`ledger`] | Credit balances and plan quotas |
//! | [`cache`] | Summary cache |
//! | [`webhook`] | Payment webhook verification |
//! | [`ingest`] | Upload processing pipeline |
//! | [`server`] | HTTP API |

pub mod cache;
pub mod chat;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod db;
pub mod detect;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod rasterize;
pub mod retrieval;
pub mod scan;
pub mod server;
pub mod webhook;
