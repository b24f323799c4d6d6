//! Page-to-chunk mapping and boilerplate cleanup.
//!
//! Each extracted page becomes one [`Chunk`] with `sequence_number` equal to
//! its page number. Before embedding, a header/footer pass strips lines that
//! repeat near the top or bottom of a super-majority of pages; the raw page
//! text is retained untouched for display.

use std::collections::HashMap;
use uuid::Uuid;

use crate::extract::ExtractedPage;
use crate::models::Chunk;

/// Lines this close to a page edge are candidates for boilerplate detection.
const EDGE_LINES: usize = 3;
/// Below this page count frequency analysis is meaningless; skip cleanup.
const MIN_PAGES_FOR_CLEANUP: usize = 3;

/// Builds chunks for a document from its extracted pages, stripping
/// boilerplate lines that repeat on at least `threshold` of pages.
pub fn build_chunks(document_id: &str, pages: &[ExtractedPage], threshold: f64) -> Vec<Chunk> {
    let boilerplate = detect_boilerplate(pages, threshold);

    pages
        .iter()
        .map(|page| {
            let cleaned = strip_boilerplate(&page.text, &boilerplate);
            let word_count = cleaned.split_whitespace().count() as i64;
            Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                sequence_number: page.page_number,
                raw_text: page.text.clone(),
                cleaned_text: cleaned,
                vector_id: None,
                word_count,
                has_images: page.has_images,
                has_tables: page.has_tables,
                has_equations: page.has_equations,
            }
        })
        .collect()
}

/// Frequency analysis over page-edge lines. A line is boilerplate when it
/// appears (normalized) near the top or bottom of at least `threshold`
/// fraction of pages.
fn detect_boilerplate(pages: &[ExtractedPage], threshold: f64) -> Vec<String> {
    if pages.len() < MIN_PAGES_FOR_CLEANUP {
        return Vec::new();
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for page in pages {
        let mut seen_this_page: Vec<String> = Vec::new();
        for line in edge_lines(&page.text) {
            let norm = normalize_line(line);
            if norm.is_empty() || seen_this_page.contains(&norm) {
                continue;
            }
            seen_this_page.push(norm.clone());
            *counts.entry(norm).or_insert(0) += 1;
        }
    }

    let required = ((pages.len() as f64) * threshold).ceil() as usize;
    counts
        .into_iter()
        .filter(|(_, count)| *count >= required)
        .map(|(line, _)| line)
        .collect()
}

/// First and last [`EDGE_LINES`] non-empty lines of a page.
fn edge_lines(text: &str) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() <= EDGE_LINES * 2 {
        return lines;
    }
    let mut out = Vec::with_capacity(EDGE_LINES * 2);
    out.extend_from_slice(&lines[..EDGE_LINES]);
    out.extend_from_slice(&lines[lines.len() - EDGE_LINES..]);
    out
}

/// Normalization collapses whitespace and digits so "Page 3 of 12" and
/// "Page 7 of 12" match as the same footer.
fn normalize_line(line: &str) -> String {
    let collapsed: String = line.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect::<String>()
        .to_lowercase()
}

fn strip_boilerplate(text: &str, boilerplate: &[String]) -> String {
    if boilerplate.is_empty() {
        return text.trim().to_string();
    }
    text.lines()
        .filter(|line| {
            let norm = normalize_line(line);
            norm.is_empty() || !boilerplate.contains(&norm)
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
