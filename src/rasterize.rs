//! PDF page rasterization for the OCR fallback.
//!
//! Renders a single page to an in-memory PNG via pdfium. Output is never
//! persisted; it exists only long enough to be handed to the OCR client.
//! pdfium is not async-safe, so async callers wrap these in
//! `spawn_blocking`.

use pdfium_render::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("page {page} out of range (document has {count} pages)")]
    PageOutOfRange { page: usize, count: usize },
    #[error("PDF rendering failed: {0}")]
    Render(String),
    #[error("PNG encoding failed: {0}")]
    Encode(String),
}

fn bind_pdfium() -> Result<Pdfium, RenderError> {
    let bindings = Pdfium::bind_to_system_library()
        .map_err(|e| RenderError::Render(format!("pdfium unavailable: {}", e)))?;
    Ok(Pdfium::new(bindings))
}

/// Number of pages in the PDF.
pub fn page_count(pdf_bytes: &[u8]) -> Result<usize, RenderError> {
    let pdfium = bind_pdfium()?;
    let doc = pdfium
        .load_pdf_from_byte_slice(pdf_bytes, None)
        .map_err(|e| RenderError::Render(e.to_string()))?;
    Ok(doc.pages().len() as usize)
}

/// Render one page (0-based) to PNG bytes at the given scale factor.
///
/// Scale 2.0 is the default for OCR legibility; 1.0 renders at the page's
/// natural size.
pub fn render_page(pdf_bytes: &[u8], page: usize, scale: f32) -> Result<Vec<u8>, RenderError> {
    let pdfium = bind_pdfium()?;
    let doc = pdfium
        .load_pdf_from_byte_slice(pdf_bytes, None)
        .map_err(|e| RenderError::Render(e.to_string()))?;

    let pages = doc.pages();
    let count = pages.len() as usize;
    if page >= count {
        return Err(RenderError::PageOutOfRange { page, count });
    }

    let pdf_page = pages
        .get(page as u16)
        .map_err(|e| RenderError::Render(e.to_string()))?;

    let config = PdfRenderConfig::new().scale_page_by_factor(scale);
    let bitmap = pdf_page
        .render_with_config(&config)
        .map_err(|e| RenderError::Render(e.to_string()))?;

    let width = bitmap.width() as u32;
    let height = bitmap.height() as u32;
    let rgba = bitmap.as_rgba_bytes();

    let img = image::RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| RenderError::Encode("bitmap dimensions mismatch".to_string()))?;

    let mut png = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(png)
}

/// Render every page of the PDF in order, for batch OCR.
pub fn render_all_pages(pdf_bytes: &[u8], scale: f32) -> Result<Vec<Vec<u8>>, RenderError> {
    let count = page_count(pdf_bytes)?;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(render_page(pdf_bytes, i, scale)?);
    }
    Ok(out)
}
