//! Core data models shared across the ingestion and chat pipeline.

/// Lifecycle of an uploaded document.
///
/// `Processing` on upload, `Ready` once chunks and embeddings are persisted,
/// `Failed` if extraction or storage errored. Terminal states are never
/// revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(DocumentStatus::Processing),
            "ready" => Some(DocumentStatus::Ready),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// A stored document row. Body text is not kept here; it lives in chunks.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub kind: String,
    pub content_type: String,
    pub status: DocumentStatus,
    pub page_count: i64,
    pub used_ocr: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A bounded window of a document's extracted text.
///
/// `start_offset` is the chunk's starting character index in the assembled
/// document text; `page_number` is 1-based and derived from page boundaries
/// during ingestion.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub page_number: i64,
    pub start_offset: i64,
    pub text: String,
    pub hash: String,
}

/// Role of a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Ai,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "ai" => Some(MessageRole::Ai),
            _ => None,
        }
    }
}

/// A chat message belonging to a document and a user. Append-only.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub document_id: String,
    pub user_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: i64,
}

/// Result of text extraction, before chunking.
///
/// `pages` holds per-page text for PDFs; single-element for every other
/// format. `text` is the assembled full text with page separators.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub pages: Vec<String>,
    pub used_ocr: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            DocumentStatus::Processing,
            DocumentStatus::Ready,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DocumentStatus::parse("done"), None);
    }

    #[test]
    fn role_roundtrip() {
        assert_eq!(MessageRole::parse("user"), Some(MessageRole::User));
        assert_eq!(MessageRole::parse("ai"), Some(MessageRole::Ai));
        assert_eq!(MessageRole::parse("assistant"), None);
    }
}
