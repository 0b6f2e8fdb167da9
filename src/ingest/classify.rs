// src/ingest/classify.rs
use metrics::counter;
use std::sync::Arc;

use crate::config::geo::GeoTables;
use crate::ingest::detail::{parse_detail, DetailInfo};
use crate::ingest::fetch::{ConditionalFetcher, FetchResult};
use crate::ingest::types::{Classification, ClassificationTier, ParsedEntry};

/// Characters that mark an administrative prefecture name (都・道・府・県).
const PREFECTURE_SUFFIXES: [char; 4] = ['都', '道', '府', '県'];

/// Three-tier prefecture assignment.
///
/// 1. scan the entry content for known names
/// 2. map the author (forecast office) through the office table
/// 3. fetch the detail document behind the entry id, only while quota usage is
///    below the soft threshold
///
/// Each tier runs only when the previous one found nothing.
#[derive(Clone)]
pub struct GeoClassifier {
    geo: Arc<GeoTables>,
    fetcher: ConditionalFetcher,
    soft_threshold: f64,
}

impl GeoClassifier {
    pub fn new(geo: Arc<GeoTables>, fetcher: ConditionalFetcher, soft_threshold: f64) -> Self {
        Self {
            geo,
            fetcher,
            soft_threshold,
        }
    }

    pub async fn classify(&self, entry: &ParsedEntry) -> Classification {
        let author = entry.author.clone();

        let by_content = entry
            .content
            .as_deref()
            .map(|c| self.geo.scan_content(c))
            .unwrap_or_default();
        if !by_content.is_empty() {
            return Classification {
                prefectures: by_content,
                publishing_office: author,
                tier: ClassificationTier::Content,
            };
        }

        if let Some(office) = author.as_deref() {
            let by_office = self.geo.offices_for(office);
            if !by_office.is_empty() {
                return Classification {
                    prefectures: by_office.to_vec(),
                    publishing_office: author,
                    tier: ClassificationTier::Office,
                };
            }
        }

        let detail = self.fetch_detail(&entry.entry_id).await.unwrap_or_default();
        let prefectures = self.resolve_areas(&detail.areas);
        let tier = if prefectures.is_empty() {
            ClassificationTier::Unresolved
        } else {
            ClassificationTier::Detail
        };
        Classification {
            prefectures,
            publishing_office: author.or(detail.publishing_office),
            tier,
        }
    }

    async fn fetch_detail(&self, entry_id: &str) -> Option<DetailInfo> {
        if !(entry_id.starts_with("http://") || entry_id.starts_with("https://")) {
            return None;
        }
        let used = self.fetcher.quota().fraction_used();
        if used >= self.soft_threshold {
            tracing::info!(
                target: "ingest",
                used,
                threshold = self.soft_threshold,
                "approaching download limit, skipping detail document"
            );
            return None;
        }

        counter!("ingest_detail_fetches_total").increment(1);
        match self.fetcher.fetch(entry_id, None).await {
            FetchResult::Success { bytes, .. } => match parse_detail(&bytes) {
                Ok(info) => Some(info),
                Err(e) => {
                    tracing::warn!(target: "ingest", url = entry_id, error = %e, "detail document unreadable");
                    None
                }
            },
            _ => None,
        }
    }

    /// Keep detail areas that name a prefecture: exact table names first, then
    /// table names contained in the area, then any name ending in a prefecture
    /// suffix (so 京都市 or 府中市 are not mistaken for prefectures).
    fn resolve_areas(&self, areas: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |name: String| {
            if !out.contains(&name) {
                out.push(name);
            }
        };
        for area in areas {
            if self.geo.is_known_prefecture(area) {
                push(area.clone());
                continue;
            }
            let contained = self.geo.scan_content(area);
            if !contained.is_empty() {
                contained.into_iter().for_each(&mut push);
            } else if area.ends_with(PREFECTURE_SUFFIXES) {
                push(area.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fetch::{HttpResponse, HttpTransport};
    use crate::ingest::quota::QuotaTracker;
    use crate::ingest::types::Validator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DetailServer {
        body: &'static str,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for DetailServer {
        async fn head(&self, _url: &str) -> anyhow::Result<HttpResponse> {
            Ok(HttpResponse {
                status: 200,
                content_length: Some(self.body.len() as u64),
                ..Default::default()
            })
        }
        async fn get(&self, _url: &str, _v: Option<&Validator>) -> anyhow::Result<HttpResponse> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: 200,
                body: self.body.as_bytes().to_vec(),
                ..Default::default()
            })
        }
    }

    const DETAIL: &str = "<Report><Control><PublishingOffice>銚子地方気象台</PublishingOffice></Control>\
        <Head><Headline><Information><Item><Areas>\
        <Area><Name>千葉県北西部</Name></Area><Area><Name>千葉県</Name></Area>\
        </Areas></Item></Information></Headline></Head></Report>";

    fn classifier(cap: u64, threshold: f64) -> (GeoClassifier, Arc<DetailServer>, Arc<QuotaTracker>) {
        let server = Arc::new(DetailServer {
            body: DETAIL,
            gets: AtomicUsize::new(0),
        });
        let quota = Arc::new(QuotaTracker::new(cap));
        let fetcher = ConditionalFetcher::new(server.clone(), quota.clone());
        let geo = Arc::new(GeoTables::builtin().clone());
        (GeoClassifier::new(geo, fetcher, threshold), server, quota)
    }

    fn entry(content: Option<&str>, author: Option<&str>) -> ParsedEntry {
        ParsedEntry {
            entry_id: "https://www.data.jma.go.jp/developer/xml/data/x.xml".into(),
            content: content.map(str::to_string),
            author: author.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn content_match_short_circuits() {
        let (c, server, _) = classifier(1_000_000, 0.8);
        let out = c
            .classify(&entry(Some("【東京都】大雨警報"), Some("銚子地方気象台")))
            .await;
        assert_eq!(out.prefectures, vec!["東京都".to_string()]);
        assert_eq!(out.tier, ClassificationTier::Content);
        assert_eq!(out.publishing_office.as_deref(), Some("銚子地方気象台"));
        assert_eq!(server.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn office_lookup_is_second_tier() {
        let (c, server, _) = classifier(1_000_000, 0.8);
        let out = c.classify(&entry(Some("注意報を解除"), Some("沖縄気象台"))).await;
        assert_eq!(out.prefectures, vec!["沖縄本島地方".to_string()]);
        assert_eq!(out.tier, ClassificationTier::Office);
        assert_eq!(server.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn detail_document_is_last_resort() {
        let (c, server, quota) = classifier(1_000_000, 0.8);
        let out = c.classify(&entry(None, None)).await;
        assert_eq!(out.tier, ClassificationTier::Detail);
        assert_eq!(out.prefectures, vec!["千葉県".to_string()]);
        assert_eq!(out.publishing_office.as_deref(), Some("銚子地方気象台"));
        assert_eq!(server.gets.load(Ordering::SeqCst), 1);
        assert_eq!(quota.used(), DETAIL.len() as u64);
    }

    #[tokio::test]
    async fn entry_author_wins_over_detail_office() {
        let (c, _, _) = classifier(1_000_000, 0.8);
        let out = c.classify(&entry(None, Some("気象庁本庁"))).await;
        assert_eq!(out.tier, ClassificationTier::Detail);
        assert_eq!(out.publishing_office.as_deref(), Some("気象庁本庁"));
    }

    #[tokio::test]
    async fn soft_threshold_blocks_detail_fetch() {
        let (c, server, quota) = classifier(1_000, 0.5);
        quota.consume(500);
        let out = c.classify(&entry(None, None)).await;
        assert_eq!(out.tier, ClassificationTier::Unresolved);
        assert!(out.prefectures.is_empty());
        assert_eq!(out.publishing_office, None);
        assert_eq!(server.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_url_ids_skip_detail_fetch() {
        let (c, server, _) = classifier(1_000_000, 0.8);
        let mut e = entry(None, None);
        e.entry_id = "urn:uuid:1234".into();
        assert_eq!(c.classify(&e).await.tier, ClassificationTier::Unresolved);
        assert_eq!(server.gets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn area_resolution_ignores_municipalities() {
        let (c, _, _) = classifier(1_000_000, 0.8);
        let areas: Vec<String> = ["京都市", "府中市", "都城市", "千葉県北西部", "架空県"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            c.resolve_areas(&areas),
            vec!["千葉県".to_string(), "架空県".to_string()]
        );
    }
}
