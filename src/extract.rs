//! Text extraction adapter.
//!
//! Turns raw document bytes into an ordered sequence of pages with structural
//! flags. Format parsers stay behind [`TextExtractor`]; the pipeline never
//! branches on file type itself. The bundled extractor handles PDF (via
//! `pdf-extract`, splitting on form feeds) and plain text.

use async_trait::async_trait;
use thiserror::Error;

/// One extracted page, in document order.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub page_number: i64,
    pub text: String,
    pub has_images: bool,
    pub has_tables: bool,
    pub has_equations: bool,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("document contains no extractable text")]
    Empty,
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<Vec<ExtractedPage>, ExtractError>;
}

/// Characters per pseudo-page when a format has no intrinsic page boundaries.
const PLAIN_TEXT_PAGE_CHARS: usize = 3000;

pub struct DefaultExtractor;

#[async_trait]
impl TextExtractor for DefaultExtractor {
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<Vec<ExtractedPage>, ExtractError> {
        let lower = filename.to_ascii_lowercase();
        let pages = if lower.ends_with(".pdf") {
            extract_pdf(bytes).await?
        } else if lower.ends_with(".txt") || lower.ends_with(".md") {
            let text = String::from_utf8_lossy(bytes).into_owned();
            paginate_plain_text(&text)
        } else {
            return Err(ExtractError::UnsupportedContentType(
                extension_of(&lower).to_string(),
            ));
        };

        if pages.iter().all(|p| p.text.trim().is_empty()) {
            return Err(ExtractError::Empty);
        }
        Ok(pages)
    }
}

fn extension_of(filename: &str) -> &str {
    filename.rsplit('.').next().unwrap_or("unknown")
}

/// PDF extraction is CPU-bound; run it off the async executor.
async fn extract_pdf(bytes: &[u8]) -> Result<Vec<ExtractedPage>, ExtractError> {
    let bytes = bytes.to_vec();
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| ExtractError::Pdf(e.to_string()))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

    // pdf-extract emits form feeds at page boundaries.
    let pages: Vec<ExtractedPage> = text
        .split('\u{c}')
        .enumerate()
        .map(|(i, page_text)| build_page(i as i64 + 1, page_text))
        .collect();
    Ok(pages)
}

fn paginate_plain_text(text: &str) -> Vec<ExtractedPage> {
    if text.is_empty() {
        return vec![build_page(1, "")];
    }

    let mut pages = Vec::new();
    let mut buf = String::new();
    let mut page_number = 1i64;

    for para in text.split("\n\n") {
        if !buf.is_empty() && buf.len() + para.len() > PLAIN_TEXT_PAGE_CHARS {
            pages.push(build_page(page_number, &buf));
            page_number += 1;
            buf.clear();
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    if !buf.is_empty() || pages.is_empty() {
        pages.push(build_page(page_number, &buf));
    }
    pages
}

fn build_page(page_number: i64, text: &str) -> ExtractedPage {
    ExtractedPage {
        page_number,
        has_images: false,
        has_tables: detect_tables(text),
        has_equations: detect_equations(text),
        text: text.to_string(),
    }
}

/// Rows of column-ish whitespace runs or pipe-delimited lines suggest a table.
fn detect_tables(text: &str) -> bool {
    let mut tabular_lines = 0;
    for line in text.lines() {
        let piped = line.matches('|').count() >= 2;
        let columned = line.split("   ").filter(|s| !s.trim().is_empty()).count() >= 3;
        if piped || columned {
            tabular_lines += 1;
            if tabular_lines >= 3 {
                return true;
            }
        }
    }
    false
}

fn detect_equations(text: &str) -> bool {
    const MARKERS: [&str; 6] = ["∑", "∫", "√", "≈", "≤", "≥"];
    MARKERS.iter().any(|m| text.contains(m)) || text.contains("\\frac") || text.contains("\\sum")
}
