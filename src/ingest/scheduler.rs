// src/ingest/scheduler.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, gauge};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::geo::GeoTables;
use crate::config::IngestConfig;
use crate::ingest::atom;
use crate::ingest::classify::GeoClassifier;
use crate::ingest::fetch::{ConditionalFetcher, FetchResult, HttpTransport};
use crate::ingest::quota::QuotaTracker;
use crate::ingest::store::Store;
use crate::ingest::throttle::ThrottleGuard;
use crate::ingest::types::{ClassificationTier, ClassifiedEntry, Source};

/// What happened to one source during one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Throttled,
    NotModified,
    QuotaExceeded,
    TransportError(String),
    ParseFailure(String),
    Stored {
        feed_id: i64,
        entries: usize,
        inserted: usize,
        unclassified: usize,
    },
    StorageError(String),
}

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub outcomes: Vec<(String, SourceOutcome)>,
}

impl PassReport {
    pub fn outcome(&self, source_id: &str) -> Option<&SourceOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == source_id)
            .map(|(_, o)| o)
    }

    pub fn inserted(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                SourceOutcome::Stored { inserted, .. } => *inserted,
                _ => 0,
            })
            .sum()
    }
}

/// fetch → parse → classify → store for a single source.
#[derive(Clone)]
pub struct IngestPipeline {
    store: Store,
    throttle: ThrottleGuard,
    fetcher: ConditionalFetcher,
    classifier: GeoClassifier,
}

impl IngestPipeline {
    pub fn new(
        store: Store,
        throttle: ThrottleGuard,
        fetcher: ConditionalFetcher,
        classifier: GeoClassifier,
    ) -> Self {
        Self {
            store,
            throttle,
            fetcher,
            classifier,
        }
    }

    /// Wire every component from configuration. The quota tracker is passed in
    /// so the caller can restore and persist it.
    pub fn from_config(
        cfg: &IngestConfig,
        store: Store,
        transport: Arc<dyn HttpTransport>,
        quota: Arc<QuotaTracker>,
        geo: Arc<GeoTables>,
    ) -> Self {
        let throttle = ThrottleGuard::new(
            cfg.base_interval_secs,
            cfg.high_multiplier,
            cfg.low_multiplier,
        );
        let fetcher = ConditionalFetcher::new(transport, quota);
        let classifier = GeoClassifier::new(geo, fetcher.clone(), cfg.soft_threshold);
        Self::new(store, throttle, fetcher, classifier)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        self.fetcher.quota()
    }

    /// Never fails: every error degrades to an outcome and unchanged state.
    pub async fn run_source(&self, source: &Source) -> SourceOutcome {
        self.run_source_at(source, Utc::now()).await
    }

    pub async fn run_source_at(&self, source: &Source, now: DateTime<Utc>) -> SourceOutcome {
        match self.ingest(source, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(target: "ingest", source = %source.id, error = %format!("{e:#}"), "storage error");
                SourceOutcome::StorageError(format!("{e:#}"))
            }
        }
    }

    async fn ingest(&self, source: &Source, now: DateTime<Utc>) -> Result<SourceOutcome> {
        if self
            .throttle
            .should_throttle_at(&self.store, source, now)
            .await?
        {
            counter!("ingest_throttled_total").increment(1);
            tracing::debug!(target: "ingest", source = %source.id, "throttled");
            return Ok(SourceOutcome::Throttled);
        }

        let cached = self.store.validator_for(&source.url).await?;
        let (bytes, validator) = match self.fetcher.fetch(&source.url, cached.as_ref()).await {
            FetchResult::Success { bytes, validator } => (bytes, validator),
            FetchResult::NotModified => return Ok(SourceOutcome::NotModified),
            FetchResult::QuotaExceeded => return Ok(SourceOutcome::QuotaExceeded),
            FetchResult::TransportError(e) => return Ok(SourceOutcome::TransportError(e)),
        };

        let parsed = match atom::parse(&bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(target: "ingest", source = %source.id, error = %e, "feed parse failed, keeping stored state");
                return Ok(SourceOutcome::ParseFailure(e.0));
            }
        };

        let total = parsed.entries.len();
        let mut classified = Vec::with_capacity(total);
        let mut unclassified = 0usize;
        for entry in parsed.entries {
            let c = self.classifier.classify(&entry).await;
            if c.tier == ClassificationTier::Unresolved {
                unclassified += 1;
                counter!("ingest_unclassified_total").increment(1);
                tracing::debug!(target: "ingest", source = %source.id, entry = %entry.entry_id, "no prefecture found, entry dropped");
                continue;
            }
            classified.push(ClassifiedEntry {
                entry,
                prefectures: c.prefectures,
                publishing_office: c.publishing_office,
            });
        }

        let (feed_id, inserted) = self
            .store
            .ingest_snapshot(&source.url, &parsed.meta, &validator, &classified, now)
            .await?;

        tracing::info!(
            target: "ingest",
            source = %source.id,
            category = %source.category,
            entries = total,
            inserted,
            unclassified,
            "feed stored"
        );
        Ok(SourceOutcome::Stored {
            feed_id,
            entries: total,
            inserted,
            unclassified,
        })
    }

    /// One pass over every source, at most `parallelism` in flight.
    /// Sources write disjoint rows, so running them concurrently is safe.
    pub async fn run_pass(&self, sources: &[Source], parallelism: usize) -> PassReport {
        let outcomes = stream::iter(sources.iter().cloned())
            .map(|s| async move {
                let outcome = self.run_source(&s).await;
                (s.id, outcome)
            })
            .buffered(parallelism.max(1))
            .collect::<Vec<_>>()
            .await;
        PassReport { outcomes }
    }
}

/// Long-running polling loop.
pub struct Scheduler {
    pipeline: IngestPipeline,
    sources: Vec<Source>,
    base_interval: Duration,
    parallelism: usize,
    quota_state_path: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(pipeline: IngestPipeline, cfg: &IngestConfig) -> Self {
        Self {
            pipeline,
            sources: cfg.sources.clone(),
            base_interval: Duration::from_secs(cfg.base_interval_secs),
            parallelism: cfg.max_parallel_sources,
            quota_state_path: cfg.quota_state_path.clone(),
        }
    }

    /// Runs passes until `shutdown` flips to true. The flag is only honoured
    /// between passes, never in the middle of one.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let report = self
                .pipeline
                .run_pass(&self.sources, self.parallelism)
                .await;

            let now = Utc::now().timestamp().max(0);
            counter!("ingest_runs_total").increment(1);
            gauge!("ingest_pipeline_last_run_ts").set(now as f64);
            tracing::info!(
                target: "ingest",
                sources = report.outcomes.len(),
                inserted = report.inserted(),
                quota_used = self.pipeline.quota().used(),
                "ingest pass finished"
            );

            if let Some(path) = &self.quota_state_path {
                if let Err(e) = self.pipeline.quota().persist(path).await {
                    tracing::warn!("quota state: {e:#}");
                }
            }

            if *shutdown.borrow() {
                break;
            }
            let sender_gone = tokio::select! {
                _ = tokio::time::sleep(self.base_interval) => false,
                changed = shutdown.changed() => changed.is_err(),
            };
            if sender_gone || *shutdown.borrow() {
                break;
            }
        }
        tracing::info!(target: "ingest", "scheduler stopped");
    }
}

pub fn spawn_scheduler(scheduler: Scheduler, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(scheduler.run(shutdown))
}

/// Daily retention sweep. Wire this from startup when retention is configured.
pub fn spawn_retention_task(store: Store, days: u32) -> JoinHandle<()> {
    let period = Duration::from_secs(24 * 3600);
    tokio::spawn(async move {
        loop {
            match store.delete_entries_older_than(days, Utc::now()).await {
                Ok(n) => tracing::info!(target: "ingest", deleted = n, days, "retention sweep"),
                Err(e) => tracing::warn!("retention sweep failed: {e:#}"),
            }
            tokio::time::sleep(period).await;
        }
    })
}
