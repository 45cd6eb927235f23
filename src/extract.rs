//! Multi-format text extraction for uploaded documents.
//!
//! Turns raw bytes into plain UTF-8 text: PDFs page by page via the text
//! layer, DOCX/PPTX by walking XML text nodes inside the ZIP container,
//! plain text as a passthrough. Image uploads are handled by the OCR client
//! and do not pass through here.
//!
//! OOXML extraction is structure-blind: tables, styles, and ordering nuances
//! are lost. That approximation is a known product limitation.

use std::io::Read;

use crate::models::Extraction;

/// Minimum trimmed length for extraction to count as having content.
pub const MIN_EXTRACTED_CHARS: usize = 10;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    /// Fewer than [`MIN_EXTRACTED_CHARS`] usable characters came out.
    /// Uploads failing this gate are rejected, nothing persisted.
    #[error("document produced no meaningful text ({0} chars)")]
    InsufficientContent(usize),
}

/// Enforce the minimum-content gate on extracted text.
pub fn require_min_content(text: &str) -> Result<(), ExtractError> {
    let len = text.trim().chars().count();
    if len < MIN_EXTRACTED_CHARS {
        return Err(ExtractError::InsufficientContent(len));
    }
    Ok(())
}

/// Extract per-page text from a PDF's text layer.
///
/// Returns one string per page; pages without a text layer come back empty,
/// which is what the scanned-document heuristic inspects.
pub fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Join per-page texts with `--- Page N ---` separators, returning the
/// assembled text plus the char offset where each page's section begins.
pub fn assemble_pages(pages: &[String]) -> (String, Vec<usize>) {
    let mut text = String::new();
    let mut starts = Vec::with_capacity(pages.len());
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            text.push('\n');
        }
        starts.push(text.chars().count());
        text.push_str(&format!("--- Page {} ---\n", i + 1));
        text.push_str(page.trim());
        text.push('\n');
    }
    (text, starts)
}

/// Extract body text from a DOCX file (`word/document.xml`, `w:t` nodes).
pub fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    let text = extract_text_nodes(&xml)?;
    Ok(collapse_whitespace(&text))
}

/// Extract body text from a PPTX file, slides in numeric order.
pub fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out = String::new();
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = extract_text_nodes(&xml)?;
        if !out.is_empty() && !text.is_empty() {
            out.push(' ');
        }
        out.push_str(&text);
    }
    Ok(collapse_whitespace(&out))
}

/// Decode plain-text bytes as UTF-8 (lossy on invalid sequences).
pub fn extract_plain_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Wrap a single-section extraction result (everything but PDF).
pub fn single_page(text: String, used_ocr: bool) -> Extraction {
    Extraction {
        pages: vec![text.clone()],
        text,
        used_ocr,
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Collect text content of `t` elements — `w:t` in DOCX, `a:t` in PPTX —
/// separated by spaces.
fn extract_text_nodes(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
