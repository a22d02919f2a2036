// src/models/asset.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use super::ArchivePeriod;

const DOCUMENT_EXTENSIONS: [&str; 3] = [".pdf", ".doc", ".docx"];

/// A downloadable document found on a detail page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetReference {
    /// Resolved asset URL; the dedup identity
    pub source_url: String,
    pub period: ArchivePeriod,
}

/// Where a persisted document lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoredRef {
    pub key: String,
    /// Store URI, e.g. `s3://bucket/key`
    pub location: String,
}

/// One entry of a store listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
}

/// Storage key for a document: `{folder}/{year}/{month:02}/{filename}`.
pub fn storage_key(folder: &str, period: ArchivePeriod, asset_url: &str) -> String {
    format!(
        "{}/{}/{:02}/{}",
        folder.trim_matches('/'),
        period.year,
        period.month,
        derive_filename(asset_url)
    )
}

/// Deterministic filename for an asset URL.
///
/// `.../{court}/{year}/{case}/.../source` becomes `{court}_{year}_{case}.pdf`;
/// anything else keeps its basename, with `.pdf` appended when it lacks a
/// document extension.
pub fn derive_filename(asset_url: &str) -> String {
    let fallback = || {
        let digest = hex::encode(Sha256::digest(asset_url.as_bytes()));
        format!("document_{}.pdf", &digest[..16])
    };

    let Ok(url) = Url::parse(asset_url) else {
        return fallback();
    };
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.collect())
        .unwrap_or_default();

    if url.path().contains("/source") {
        // ["akn", "ke", "judgment", court, year, case, ...]
        return match (segments.get(3), segments.get(4), segments.get(5)) {
            (Some(court), Some(year), Some(case))
                if !court.is_empty() && !year.is_empty() && !case.is_empty() =>
            {
                format!("{court}_{year}_{case}.pdf")
            }
            _ => fallback(),
        };
    }

    match segments.last().filter(|s| !s.is_empty()) {
        Some(name) => {
            let lower = name.to_lowercase();
            if DOCUMENT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                name.to_string()
            } else {
                format!("{name}.pdf")
            }
        }
        None => fallback(),
    }
}

/// Content type for a stored key, from its extension.
pub fn content_type_for(key: &str) -> &'static str {
    let lower = key.to_lowercase();
    if lower.ends_with(".docx") {
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
    } else if lower.ends_with(".doc") {
        "application/msword"
    } else {
        "application/pdf"
    }
}
