// src/ingest/store.rs
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::config::geo::GeoTables;
use crate::ingest::types::{ClassifiedEntry, EntryRecord, FeedMeta, FeedRecord, Validator};

const FEED_COLUMNS: &str = "id, url, title, subtitle, updated, atom_id, rights, \
     last_modified, etag, last_fetched_at";
const ENTRY_COLUMNS: &str = "id, feed_id, entry_id, title, updated, publishing_office, \
     link, content, prefecture, inserted_at";

/// Area restriction for [`Store::recent_entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryFilter {
    All,
    Prefecture(String),
    /// Expanded to the region's member prefectures.
    Region(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryQuery {
    pub feed_id: Option<i64>,
    pub filter: EntryFilter,
    pub limit: u32,
}

impl Default for EntryQuery {
    fn default() -> Self {
        Self {
            feed_id: None,
            filter: EntryFilter::All,
            limit: 100,
        }
    }
}

/// Entry timestamps come as RFC 3339 (Atom) or RFC 2822 (RSS pubDate).
/// Anything else is stored as NULL.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    OffsetDateTime::parse(raw, &Rfc2822)
        .ok()
        .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), dt.nanosecond()))
}

/// FeedSnapshot + Entry tables.
///
/// Every write is keyed by a unique constraint so repeated or overlapping
/// ingestion cycles converge on the same rows. No application-level locking.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) and migrate.
    pub async fn open(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url {url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        if let Some(dir) = opts.get_filename().parent() {
            if !dir.as_os_str().is_empty() && opts.get_filename().as_os_str() != ":memory:" {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating database directory {}", dir.display()))?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. One connection, so every query sees the same data.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT,
                subtitle TEXT,
                updated TEXT,
                atom_id TEXT,
                rights TEXT,
                last_modified TEXT,
                etag TEXT,
                last_fetched_at INTEGER
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                entry_id TEXT NOT NULL,
                title TEXT,
                updated INTEGER,
                publishing_office TEXT NOT NULL DEFAULT '',
                link TEXT,
                content TEXT,
                prefecture TEXT NOT NULL CHECK (prefecture <> ''),
                inserted_at INTEGER NOT NULL,
                UNIQUE(feed_id, entry_id, publishing_office, prefecture)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_prefecture ON entries(prefecture)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_updated ON entries(updated DESC)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_inserted ON entries(inserted_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // Feed snapshots
    // ========================================================================

    /// Insert or fully overwrite the snapshot for `url`; returns its id.
    pub async fn upsert_feed_meta(
        &self,
        url: &str,
        meta: &FeedMeta,
        validator: &Validator,
        fetched_at: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        write_feed_meta(&mut conn, url, meta, validator, fetched_at).await
    }

    /// Snapshot and entries of one successful fetch, committed together.
    ///
    /// The snapshot carries the validator and the fetch time that drive the
    /// throttle and the next conditional GET, so it must never land without
    /// its entries. Returns the feed id and the number of rows inserted.
    pub async fn ingest_snapshot(
        &self,
        url: &str,
        meta: &FeedMeta,
        validator: &Validator,
        entries: &[ClassifiedEntry],
        fetched_at: DateTime<Utc>,
    ) -> Result<(i64, usize)> {
        let mut tx = self.pool.begin().await?;
        let feed_id = write_feed_meta(&mut tx, url, meta, validator, fetched_at).await?;
        let inserted = write_entries(&mut tx, feed_id, entries, fetched_at).await?;
        tx.commit()
            .await
            .with_context(|| format!("committing snapshot of {url}"))?;
        counter!("ingest_rows_inserted_total").increment(inserted as u64);
        Ok((feed_id, inserted))
    }

    pub async fn feed_by_url(&self, url: &str) -> Result<Option<FeedRecord>> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?");
        let feed = sqlx::query_as::<_, FeedRecord>(&sql)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn last_fetched_at(&self, url: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.feed_by_url(url).await?.and_then(|f| f.last_fetched()))
    }

    pub async fn validator_for(&self, url: &str) -> Result<Option<Validator>> {
        Ok(self
            .feed_by_url(url)
            .await?
            .map(|f| f.validator())
            .filter(|v| !v.is_empty()))
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Fan each entry out to one row per prefecture. Existing
    /// (feed, entry id, office, prefecture) tuples are left untouched.
    /// Runs in one transaction; returns the number of rows actually inserted.
    pub async fn upsert_entries(&self, feed_id: i64, entries: &[ClassifiedEntry]) -> Result<usize> {
        self.upsert_entries_at(feed_id, entries, Utc::now()).await
    }

    pub async fn upsert_entries_at(
        &self,
        feed_id: i64,
        entries: &[ClassifiedEntry],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let inserted = write_entries(&mut tx, feed_id, entries, now).await?;
        tx.commit().await?;
        counter!("ingest_rows_inserted_total").increment(inserted as u64);
        Ok(inserted)
    }

    /// Entries ordered newest first (NULL timestamps last).
    pub async fn recent_entries(&self, q: &EntryQuery, geo: &GeoTables) -> Result<Vec<EntryRecord>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE 1 = 1"));

        if let Some(feed_id) = q.feed_id {
            qb.push(" AND feed_id = ").push_bind(feed_id);
        }
        match &q.filter {
            EntryFilter::All => {}
            EntryFilter::Prefecture(p) => {
                qb.push(" AND prefecture = ").push_bind(p.clone());
            }
            EntryFilter::Region(r) => {
                let members = geo
                    .region_members(r)
                    .ok_or_else(|| anyhow!("unknown region {r}"))?;
                qb.push(" AND prefecture IN (");
                let mut sep = qb.separated(", ");
                for m in members {
                    sep.push_bind(m.clone());
                }
                sep.push_unseparated(")");
            }
        }
        qb.push(" ORDER BY updated IS NULL, updated DESC, id DESC LIMIT ")
            .push_bind(i64::from(q.limit));

        let rows = qb
            .build_query_as::<EntryRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn entries_for_feed(&self, feed_id: i64) -> Result<Vec<EntryRecord>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE feed_id = ? ORDER BY id");
        let rows = sqlx::query_as::<_, EntryRecord>(&sql)
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn count_entries(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Retention: drop rows inserted more than `days` ago.
    pub async fn delete_entries_older_than(&self, days: u32, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::days(i64::from(days));
        let res = sqlx::query("DELETE FROM entries WHERE inserted_at < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

async fn write_feed_meta(
    conn: &mut SqliteConnection,
    url: &str,
    meta: &FeedMeta,
    validator: &Validator,
    fetched_at: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO feeds (url, title, subtitle, updated, atom_id, rights,
                           last_modified, etag, last_fetched_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(url) DO UPDATE SET
            title = excluded.title,
            subtitle = excluded.subtitle,
            updated = excluded.updated,
            atom_id = excluded.atom_id,
            rights = excluded.rights,
            last_modified = excluded.last_modified,
            etag = excluded.etag,
            last_fetched_at = excluded.last_fetched_at
        RETURNING id
    "#,
    )
    .bind(url)
    .bind(meta.title.as_deref())
    .bind(meta.subtitle.as_deref())
    .bind(meta.updated.as_deref())
    .bind(meta.atom_id.as_deref())
    .bind(meta.rights.as_deref())
    .bind(validator.last_modified.as_deref())
    .bind(validator.etag.as_deref())
    .bind(fetched_at.timestamp())
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("upserting feed {url}"))?;
    Ok(id)
}

/// Fan each entry out to one row per prefecture; returns rows actually inserted.
async fn write_entries(
    conn: &mut SqliteConnection,
    feed_id: i64,
    entries: &[ClassifiedEntry],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut inserted = 0usize;

    for ce in entries {
        let e = &ce.entry;
        let updated = match e.updated.as_deref() {
            Some(raw) => {
                let ts = parse_timestamp(raw);
                if ts.is_none() {
                    tracing::debug!(target: "ingest", entry = %e.entry_id, raw, "unparsable updated timestamp, storing null");
                }
                ts
            }
            None => None,
        };
        let office = ce.publishing_office.as_deref().unwrap_or_default();

        for pref in ce.prefectures.iter().filter(|p| !p.is_empty()) {
            let res = sqlx::query(
                r#"
                INSERT INTO entries (feed_id, entry_id, title, updated, publishing_office,
                                     link, content, prefecture, inserted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(feed_id, entry_id, publishing_office, prefecture) DO NOTHING
            "#,
            )
            .bind(feed_id)
            .bind(&e.entry_id)
            .bind(e.title.as_deref())
            .bind(updated.map(|t| t.timestamp()))
            .bind(office)
            .bind(e.link.as_deref())
            .bind(e.content.as_deref())
            .bind(pref)
            .bind(now.timestamp())
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting entry {}", e.entry_id))?;

            inserted += res.rows_affected() as usize;
        }
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::ParsedEntry;
    use chrono::TimeZone;

    fn entry(id: &str, updated: Option<&str>, prefs: &[&str], office: Option<&str>) -> ClassifiedEntry {
        ClassifiedEntry {
            entry: ParsedEntry {
                entry_id: id.to_string(),
                title: Some(format!("title {id}")),
                updated: updated.map(str::to_string),
                ..Default::default()
            },
            prefectures: prefs.iter().map(|p| p.to_string()).collect(),
            publishing_office: office.map(str::to_string),
        }
    }

    #[test]
    fn timestamps_parse_in_two_formats() {
        let a = parse_timestamp("2025-09-06T09:00:00+09:00").unwrap();
        let b = parse_timestamp("Sat, 06 Sep 2025 00:00:00 +0000").unwrap();
        assert_eq!(a, b);
        assert_eq!(parse_timestamp("昨日の朝"), None);
    }

    #[tokio::test]
    async fn feed_upsert_overwrites_in_place() {
        let store = Store::open_in_memory().await.unwrap();
        let t = Utc.with_ymd_and_hms(2025, 9, 6, 0, 0, 0).unwrap();
        let meta = FeedMeta {
            title: Some("old".into()),
            ..Default::default()
        };
        let v = Validator {
            last_modified: Some("Sat, 06 Sep 2025 00:00:00 GMT".into()),
            etag: None,
        };
        let id1 = store.upsert_feed_meta("http://f", &meta, &v, t).await.unwrap();
        let meta2 = FeedMeta {
            title: Some("new".into()),
            ..Default::default()
        };
        let id2 = store
            .upsert_feed_meta("http://f", &meta2, &Validator::default(), t + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let rec = store.feed_by_url("http://f").await.unwrap().unwrap();
        assert_eq!(rec.title.as_deref(), Some("new"));
        assert_eq!(rec.last_modified, None);
        assert_eq!(rec.last_fetched(), Some(t + Duration::minutes(5)));
        assert_eq!(store.validator_for("http://f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fan_out_and_idempotent_reinsert() {
        let store = Store::open_in_memory().await.unwrap();
        let fid = store
            .upsert_feed_meta("http://f", &FeedMeta::default(), &Validator::default(), Utc::now())
            .await
            .unwrap();
        let batch = vec![
            entry("e1", Some("2025-09-06T09:00:00Z"), &["東京都", "千葉県"], Some("東京管区気象台")),
            entry("e2", Some("not a date"), &["大阪府"], None),
        ];
        assert_eq!(store.upsert_entries(fid, &batch).await.unwrap(), 3);
        assert_eq!(store.upsert_entries(fid, &batch).await.unwrap(), 0);
        assert_eq!(store.count_entries().await.unwrap(), 3);

        let rows = store.entries_for_feed(fid).await.unwrap();
        let e1: Vec<_> = rows.iter().filter(|r| r.entry_id == "e1").collect();
        assert_eq!(e1.len(), 2);
        assert_ne!(e1[0].prefecture, e1[1].prefecture);
        let e2 = rows.iter().find(|r| r.entry_id == "e2").unwrap();
        assert_eq!(e2.updated, None);
        assert_eq!(e2.publishing_office, "");
    }

    #[tokio::test]
    async fn entry_without_prefectures_stores_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        let fid = store
            .upsert_feed_meta("http://f", &FeedMeta::default(), &Validator::default(), Utc::now())
            .await
            .unwrap();
        let n = store
            .upsert_entries(fid, &[entry("e", None, &[], None)])
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn region_filter_and_ordering() {
        let store = Store::open_in_memory().await.unwrap();
        let geo = GeoTables::builtin();
        let fid = store
            .upsert_feed_meta("http://f", &FeedMeta::default(), &Validator::default(), Utc::now())
            .await
            .unwrap();
        let batch = vec![
            entry("old", Some("2025-09-01T00:00:00Z"), &["京都府"], None),
            entry("new", Some("2025-09-06T00:00:00Z"), &["大阪府"], None),
            entry("nodate", None, &["奈良県"], None),
            entry("tokyo", Some("2025-09-07T00:00:00Z"), &["東京都"], None),
        ];
        store.upsert_entries(fid, &batch).await.unwrap();

        let q = EntryQuery {
            filter: EntryFilter::Region("近畿".into()),
            ..Default::default()
        };
        let rows = store.recent_entries(&q, geo).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old", "nodate"]);

        let q = EntryQuery {
            filter: EntryFilter::Prefecture("東京都".into()),
            limit: 1,
            ..Default::default()
        };
        assert_eq!(store.recent_entries(&q, geo).await.unwrap().len(), 1);

        let q = EntryQuery {
            filter: EntryFilter::Region("どこか".into()),
            ..Default::default()
        };
        assert!(store.recent_entries(&q, geo).await.is_err());
    }

    #[tokio::test]
    async fn retention_deletes_by_insertion_time() {
        let store = Store::open_in_memory().await.unwrap();
        let fid = store
            .upsert_feed_meta("http://f", &FeedMeta::default(), &Validator::default(), Utc::now())
            .await
            .unwrap();
        let now = Utc.with_ymd_and_hms(2025, 9, 10, 0, 0, 0).unwrap();
        store
            .upsert_entries_at(fid, &[entry("a", None, &["東京都"], None)], now - Duration::days(8))
            .await
            .unwrap();
        store
            .upsert_entries_at(fid, &[entry("b", None, &["東京都"], None)], now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(store.delete_entries_older_than(7, now).await.unwrap(), 1);
        assert_eq!(store.count_entries().await.unwrap(), 1);
    }
}
