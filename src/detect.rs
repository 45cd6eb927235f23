//! Upload format classification.
//!
//! Matches the declared MIME type against a static table first, then falls
//! back to the filename extension when the MIME type is absent or generic.
//! No magic-byte sniffing: client-supplied metadata is trusted, which is the
//! product's stated risk tolerance.

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Classified upload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Pptx,
    Text,
    Image,
    Unknown,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Docx => "docx",
            DocumentKind::Pptx => "pptx",
            DocumentKind::Text => "text",
            DocumentKind::Image => "image",
            DocumentKind::Unknown => "unknown",
        }
    }
}

/// Accepted upload formats, for error messages to the uploader.
pub const SUPPORTED_FORMATS: &str = "pdf, docx, pptx, txt/md, png/jpeg/webp";

/// Classify an upload from its declared content type and filename.
pub fn detect_kind(content_type: &str, filename: &str) -> DocumentKind {
    let ct = content_type.trim().to_ascii_lowercase();
    // Strip parameters like "; charset=utf-8".
    let ct = ct.split(';').next().unwrap_or("").trim().to_string();

    match ct.as_str() {
        MIME_PDF => return DocumentKind::Pdf,
        MIME_DOCX => return DocumentKind::Docx,
        MIME_PPTX => return DocumentKind::Pptx,
        "" | "application/octet-stream" => {} // generic, fall through to extension
        _ => {
            if ct.starts_with("text/") || ct == "application/json" {
                return DocumentKind::Text;
            }
            if ct.starts_with("image/") {
                return DocumentKind::Image;
            }
        }
    }

    match extension(filename).as_deref() {
        Some("pdf") => DocumentKind::Pdf,
        Some("docx") => DocumentKind::Docx,
        Some("pptx") => DocumentKind::Pptx,
        Some("txt") | Some("md") | Some("csv") | Some("json") => DocumentKind::Text,
        Some("png") | Some("jpg") | Some("jpeg") | Some("webp") | Some("gif") => {
            DocumentKind::Image
        }
        _ => DocumentKind::Unknown,
    }
}

fn extension(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None; // dotfile, not an extension
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_table_wins() {
        assert_eq!(detect_kind(MIME_PDF, "anything.txt"), DocumentKind::Pdf);
        assert_eq!(detect_kind(MIME_DOCX, "report"), DocumentKind::Docx);
        assert_eq!(detect_kind(MIME_PPTX, "deck"), DocumentKind::Pptx);
        assert_eq!(detect_kind("text/plain", "notes"), DocumentKind::Text);
        assert_eq!(detect_kind("image/png", "scan"), DocumentKind::Image);
    }

    #[test]
    fn mime_parameters_are_ignored() {
        assert_eq!(
            detect_kind("text/plain; charset=utf-8", "notes"),
            DocumentKind::Text
        );
    }

    #[test]
    fn generic_mime_falls_back_to_extension() {
        assert_eq!(
            detect_kind("application/octet-stream", "report.pdf"),
            DocumentKind::Pdf
        );
        assert_eq!(detect_kind("", "slides.pptx"), DocumentKind::Pptx);
        assert_eq!(detect_kind("", "photo.JPG"), DocumentKind::Image);
    }

    #[test]
    fn unknown_when_nothing_matches() {
        assert_eq!(
            detect_kind("application/octet-stream", "archive.tar.gz"),
            DocumentKind::Unknown
        );
        assert_eq!(detect_kind("", "README"), DocumentKind::Unknown);
        assert_eq!(detect_kind("", ".gitignore"), DocumentKind::Unknown);
    }
}
