//! Scanned-document heuristic.
//!
//! Decides whether a PDF is image-only from its per-page text extraction
//! results: pages with too little text in too high a proportion mean the
//! text layer is missing and OCR should run instead. False positives and
//! negatives are expected; the thresholds are configuration.

use crate::config::ScanConfig;

/// Fraction of pages whose trimmed text length is at least `min_chars`.
/// Empty input counts as fully text-bearing (nothing to OCR).
pub fn text_page_ratio(pages: &[String], min_chars: usize) -> f64 {
    if pages.is_empty() {
        return 1.0;
    }
    let text_pages = pages
        .iter()
        .filter(|p| p.trim().chars().count() >= min_chars)
        .count();
    text_pages as f64 / pages.len() as f64
}

/// True when the document should be treated as scanned (image-only).
///
/// Strict less-than: a document with exactly the threshold ratio of
/// text-bearing pages is NOT scanned.
pub fn is_scanned(pages: &[String], config: &ScanConfig) -> bool {
    text_page_ratio(pages, config.min_chars_per_page) < config.text_page_ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(text_count: usize, blank_count: usize) -> Vec<String> {
        let mut v = Vec::new();
        for _ in 0..text_count {
            v.push("x".repeat(50));
        }
        for _ in 0..blank_count {
            v.push(String::new());
        }
        v
    }

    #[test]
    fn all_text_pages_not_scanned() {
        let cfg = ScanConfig::default();
        assert!(!is_scanned(&pages(3, 0), &cfg));
        assert!((text_page_ratio(&pages(3, 0), 50) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_text_pages_scanned() {
        let cfg = ScanConfig::default();
        assert!(is_scanned(&pages(0, 4), &cfg));
    }

    #[test]
    fn ratio_boundary_is_strict() {
        let cfg = ScanConfig::default();
        // Exactly 30% text-bearing (30 of 100): not scanned.
        assert!(!is_scanned(&pages(30, 70), &cfg));
        // 29%: scanned.
        assert!(is_scanned(&pages(29, 71), &cfg));
    }

    #[test]
    fn page_counts_as_text_only_at_min_chars() {
        let cfg = ScanConfig::default();
        let short = vec!["y".repeat(49)];
        assert!(is_scanned(&short, &cfg));
        let exact = vec!["y".repeat(50)];
        assert!(!is_scanned(&exact, &cfg));
    }

    #[test]
    fn whitespace_does_not_count() {
        let padded = vec![format!("  {}  \n", "z".repeat(10))];
        assert!((text_page_ratio(&padded, 50) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn empty_document_not_scanned() {
        let cfg = ScanConfig::default();
        assert!(!is_scanned(&[], &cfg));
    }
}
