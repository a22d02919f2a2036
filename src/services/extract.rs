// src/services/extract.rs

//! PDF text extraction via poppler's command line tools.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{AppError, Result};

/// Text pulled out of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedText {
    pub text: String,
    /// Title from document metadata, if it has one
    pub title: Option<String>,
}

/// Extracts text from a local file.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<ExtractedText>;
}

/// `pdftotext` for text, `pdfinfo` for the title.
#[derive(Debug, Clone, Default)]
pub struct PdfToText;

impl PdfToText {
    async fn run_pdftotext(path: &Path) -> Result<String> {
        let output = Command::new("pdftotext")
            .args(["-layout", "-enc", "UTF-8"])
            .arg(path)
            .arg("-")
            .output()
            .await
            .map_err(|e| AppError::Extraction(format!("pdftotext (install poppler-utils): {e}")))?;

        if !output.status.success() {
            return Err(AppError::Extraction(format!(
                "pdftotext failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_pdfinfo(path: &Path) -> Option<String> {
        let output = Command::new("pdfinfo")
            .args(["-enc", "UTF-8"])
            .arg(path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_title(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl TextExtractor for PdfToText {
    async fn extract(&self, path: &Path) -> Result<ExtractedText> {
        let text = Self::run_pdftotext(path).await?;
        let title = Self::run_pdfinfo(path).await;
        Ok(ExtractedText { text, title })
    }
}

/// `Title:` line of `pdfinfo` output.
fn parse_title(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.strip_prefix("Title:"))
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(str::to_string)
}
