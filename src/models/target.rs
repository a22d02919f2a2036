// src/models/target.rs

use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};

/// Levels of the listing hierarchy, walked strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CrawlLevel {
    Root,
    Year,
    Month,
    AlphabetPartition,
    PaginatedListing,
    DetailPage,
}

impl CrawlLevel {
    /// The level a child link of this level belongs to.
    pub fn child(self) -> Option<Self> {
        match self {
            Self::Root => Some(Self::Year),
            Self::Year => Some(Self::Month),
            Self::Month => Some(Self::AlphabetPartition),
            Self::AlphabetPartition => Some(Self::PaginatedListing),
            Self::PaginatedListing => Some(Self::DetailPage),
            Self::DetailPage => None,
        }
    }
}

/// A URL to visit at a given level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CrawlTarget {
    pub url: String,
    pub level: CrawlLevel,
}

impl CrawlTarget {
    pub fn new(url: impl Into<String>, level: CrawlLevel) -> Self {
        Self {
            url: url.into(),
            level,
        }
    }

    /// Children of this target at the next level down.
    pub fn children(&self, urls: impl IntoIterator<Item = String>) -> Vec<CrawlTarget> {
        let Some(level) = self.level.child() else {
            return Vec::new();
        };
        urls.into_iter()
            .map(|url| CrawlTarget::new(url, level))
            .collect()
    }
}

/// Year and month a document was listed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchivePeriod {
    pub year: i32,
    pub month: u32,
}

impl ArchivePeriod {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// The current calendar period.
    pub fn current() -> Self {
        let now = Local::now();
        Self::new(now.year(), now.month())
    }

    /// Year from the last path segment of a year listing URL.
    ///
    /// Keeps the current month; falls back to the current period when the
    /// segment is not a plausible year.
    pub fn from_year_url(url: &str) -> Self {
        let current = Self::current();
        match last_segment(url).and_then(|s| s.parse::<i32>().ok()) {
            Some(year) if (1900..=9999).contains(&year) => Self::new(year, current.month),
            _ => current,
        }
    }

    /// Same period with the month taken from a month listing URL.
    pub fn with_month_url(self, url: &str) -> Self {
        match last_segment(url).and_then(|s| s.parse::<u32>().ok()) {
            Some(month) if (1..=12).contains(&month) => Self::new(self.year, month),
            _ => Self::new(self.year, Self::current().month),
        }
    }
}

impl std::fmt::Display for ArchivePeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:02}", self.year, self.month)
    }
}

fn last_segment(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/').rsplit('/').next()
}
