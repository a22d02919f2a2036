// src/services/links.rs

//! Link extraction for the judgments listing hierarchy.
//!
//! Pure functions over a parsed document. Each listing extractor returns a
//! [`LinkSet`] so callers can tell "this page has no such navigation" from
//! "the extractor could not run".

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{AppError, Result};
use crate::utils::resolve_url;

const YEAR_NAV: &str = "ul.year-nav";
const PAGINATION: &str = "ul.pagination";
const DETAIL_ROW: &str = "tr";
const DETAIL_TITLE: &str = "td.cell-title a[href]";
const DOWNLOAD_BUTTON: &str = "a.btn.btn-primary.btn-shrink-sm";
const DEFINITION: &str = "dd";
const ANCHOR: &str = "a[href]";

static SIZE_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(KB|MB)").ok());

/// Outcome of a listing extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSet {
    /// At least one link was found
    Found(Vec<String>),
    /// The page carries no such navigation
    Missing,
    /// Extraction could not be performed
    Unavailable(String),
}

impl LinkSet {
    fn from_urls(urls: Vec<String>) -> Self {
        if urls.is_empty() {
            Self::Missing
        } else {
            Self::Found(urls)
        }
    }

    /// Links to follow, collapsing anything but `Found` to `[base]`.
    pub fn or_base(self, base: &str, what: &str) -> Vec<String> {
        match self {
            Self::Found(urls) => urls,
            Self::Missing => {
                log::debug!("No {} navigation on {}", what, base);
                vec![base.to_string()]
            }
            Self::Unavailable(reason) => {
                log::warn!("Could not extract {} links from {}: {}", what, base, reason);
                vec![base.to_string()]
            }
        }
    }
}

fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
}

/// Year listing URLs from the first year navigation list.
pub fn year_links(base: &str, document: &Html) -> LinkSet {
    nav_links(base, document, 0)
}

/// Month listing URLs from the second year navigation list.
pub fn month_links(base: &str, document: &Html) -> LinkSet {
    nav_links(base, document, 1)
}

/// `base + {segment}/` for every entry of the `index`-th year navigation list,
/// where segment is the last path segment of the entry's href.
fn nav_links(base: &str, document: &Html, index: usize) -> LinkSet {
    let (nav, anchor) = match (parse_selector(YEAR_NAV), parse_selector(ANCHOR)) {
        (Ok(nav), Ok(anchor)) => (nav, anchor),
        (Err(e), _) | (_, Err(e)) => return LinkSet::Unavailable(e.to_string()),
    };

    let Some(list) = document.select(&nav).nth(index) else {
        return LinkSet::Missing;
    };

    let prefix = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };

    let mut seen = HashSet::new();
    let urls = list
        .select(&anchor)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(last_path_segment)
        .map(|segment| format!("{prefix}{segment}/"))
        .filter(|url| seen.insert(url.clone()))
        .collect();

    LinkSet::from_urls(urls)
}

fn last_path_segment(href: &str) -> Option<&str> {
    let path = href.split(['?', '#']).next()?;
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}

/// The 26 alphabet partitions of a listing, `a` through `z`.
pub fn alphabet_partitions(base: &str) -> Vec<String> {
    ('a'..='z')
        .map(|letter| format!("{base}?alphabet={letter}"))
        .collect()
}

/// Page URLs of a partition's pagination control.
///
/// Each entry keeps the query of its href minus the `alphabet` pair and
/// appends it to `base`; an entry that only selects the partition maps
/// back to `base` itself.
pub fn pagination_links(base: &str, document: &Html) -> LinkSet {
    let (pagination, anchor) = match (parse_selector(PAGINATION), parse_selector(ANCHOR)) {
        (Ok(p), Ok(a)) => (p, a),
        (Err(e), _) | (_, Err(e)) => return LinkSet::Unavailable(e.to_string()),
    };
    let resolver = match Url::parse(base) {
        Ok(url) => url,
        Err(e) => return LinkSet::Unavailable(e.to_string()),
    };

    let Some(list) = document.select(&pagination).next() else {
        return LinkSet::Missing;
    };

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for href in list.select(&anchor).filter_map(|a| a.value().attr("href")) {
        let Ok(target) = resolver.join(href) else {
            continue;
        };
        let fragment = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(target.query_pairs().filter(|(k, _)| k != "alphabet"))
            .finish();
        let page = if fragment.is_empty() {
            base.to_string()
        } else {
            format!("{base}&{fragment}")
        };
        if seen.insert(page.clone()) {
            urls.push(page);
        }
    }

    LinkSet::from_urls(urls)
}

/// Absolute detail-page URLs of every listing row with a title link.
pub fn detail_links(base: &str, document: &Html) -> Vec<String> {
    let (Ok(row), Ok(title)) = (parse_selector(DETAIL_ROW), parse_selector(DETAIL_TITLE)) else {
        return Vec::new();
    };
    let Ok(base_url) = Url::parse(base) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    document
        .select(&row)
        .filter_map(|tr| tr.select(&title).next())
        .filter_map(|a| a.value().attr("href"))
        .map(|href| resolve_url(&base_url, href.trim()))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Downloadable document URL of a detail page.
///
/// Prefers the primary download button when its label does not advertise
/// a zero size, then falls back to the link in the last definition entry.
pub fn asset_url(document: &Html, detail_url: &str) -> Option<String> {
    let base = Url::parse(detail_url).ok()?;

    if let Ok(button) = parse_selector(DOWNLOAD_BUTTON) {
        let primary = document.select(&button).find(|a| {
            a.value().attr("href").is_some_and(is_document_href) && size_label_allows(&label(a))
        });
        if let Some(href) = primary.and_then(|a| a.value().attr("href")) {
            return Some(resolve_url(&base, href.trim()));
        }
    }

    let definition = parse_selector(DEFINITION).ok()?;
    let anchor = parse_selector(ANCHOR).ok()?;
    let last = document.select(&definition).last()?;
    let href = last.select(&anchor).next()?.value().attr("href")?;
    is_document_href(href).then(|| resolve_url(&base, href.trim()))
}

fn label(element: &ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Whether an href points at a document download.
pub fn is_document_href(href: &str) -> bool {
    let lower = href.to_lowercase();
    [".pdf", ".doc", ".docx"]
        .iter()
        .any(|ext| lower.ends_with(ext))
        || lower.contains("/source")
}

/// Size gate for download labels like `PDF (245 KB)`.
///
/// Only an explicit zero size is rejected; labels without a parsable
/// size pass.
pub fn size_label_allows(text: &str) -> bool {
    let Some(re) = SIZE_LABEL.as_ref() else {
        return true;
    };
    let Some(caps) = re.captures(text) else {
        return true;
    };
    let Some(size) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) else {
        return true;
    };
    match caps.get(2).map(|m| m.as_str().to_uppercase()).as_deref() {
        Some("MB") => size > 0.001,
        _ => size > 0.0,
    }
}
