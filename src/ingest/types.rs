// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Polling cadence tier of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyClass {
    High,
    Low,
}

/// One configured feed. Immutable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub category: String,
    pub frequency: FrequencyClass,
}

/// HTTP cache validator returned by one fetch and replayed on the next.
/// Treated as opaque: the header values are echoed back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

impl Validator {
    pub fn is_empty(&self) -> bool {
        self.last_modified.is_none() && self.etag.is_none()
    }
}

/// Feed-level fields of an Atom document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedMeta {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub updated: Option<String>,
    pub atom_id: Option<String>,
    pub rights: Option<String>,
}

/// One `<entry>` as it appears in the document, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEntry {
    pub entry_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    /// `updated`, or the alternate publish date when `updated` is absent. Unparsed.
    pub updated: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub meta: FeedMeta,
    pub entries: Vec<ParsedEntry>,
}

/// Which fallback tier produced the prefecture list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationTier {
    Content,
    Office,
    Detail,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub prefectures: Vec<String>,
    pub publishing_office: Option<String>,
    pub tier: ClassificationTier,
}

/// Entry ready for storage: one row per prefecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEntry {
    pub entry: ParsedEntry,
    pub prefectures: Vec<String>,
    pub publishing_office: Option<String>,
}

/// Stored FeedSnapshot row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FeedRecord {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub updated: Option<String>,
    pub atom_id: Option<String>,
    pub rights: Option<String>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub last_fetched_at: Option<i64>,
}

impl FeedRecord {
    pub fn validator(&self) -> Validator {
        Validator {
            last_modified: self.last_modified.clone(),
            etag: self.etag.clone(),
        }
    }

    pub fn last_fetched(&self) -> Option<DateTime<Utc>> {
        self.last_fetched_at
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
    }
}

/// Stored Entry row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EntryRecord {
    pub id: i64,
    pub feed_id: i64,
    pub entry_id: String,
    pub title: Option<String>,
    pub updated: Option<i64>,
    pub publishing_office: String,
    pub link: Option<String>,
    pub content: Option<String>,
    pub prefecture: String,
    pub inserted_at: i64,
}
