use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Text of a single page. `page` is 0-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    pub page: usize,
    pub text: String,
}

/// Turns an uploaded file into per-page text. Runs on a blocking thread.
pub trait PageExtractor: Send + Sync {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

impl PageExtractor for PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>> {
        let pages = pdf_extract::extract_text_by_pages(path)
            .with_context(|| format!("Failed to extract PDF text: {}", path.display()))?;

        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(page, text)| PageText { page, text })
            .collect())
    }
}

/// Magic bytes every PDF starts with.
pub const PDF_MAGIC_BYTES: &[u8] = b"%PDF";

pub fn looks_like_pdf(content: &[u8]) -> bool {
    content.starts_with(PDF_MAGIC_BYTES)
}
