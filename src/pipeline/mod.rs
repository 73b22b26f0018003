//! Pipeline orchestrator: ties portal → snapshot → history together.
//!
//! `scrape()` produces one snapshot:
//!   1. Log in (and read the member's own queue days)
//!   2. Crawl the paginated index, sequentially
//!   3. Normalise and dedupe the entries
//!   4. Enrich from detail pages on a bounded task pool, under a global timeout
//!
//! `run()` additionally merges the snapshot into the stored history and
//! persists it. Re-running on the same day replaces that day's snapshot.

use crate::config::AppConfig;
use crate::error::{AuthError, FetchError, RunError, ScrapeError, TransportError};
use crate::merge::{MergeSummary, merge};
use crate::models::{DetailFields, History, ListingRecord, RawListing, Snapshot, dedupe_last_wins};
use crate::scraper::cleaner::normalize;
use crate::scraper::{ListingSource, SssbScraper};
use crate::storage::Repository;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, warn};

pub struct Pipeline {
    config: AppConfig,
    source: Arc<dyn ListingSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    pub pages: u32,
    pub hit_page_limit: bool,
    pub listings_seen: usize,
    pub normalize_dropped: usize,
    pub duplicates: usize,
    pub details_enriched: usize,
    pub details_skipped: usize,
}

#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub snapshot: Snapshot,
    pub stats: ScrapeStats,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub stats: ScrapeStats,
    pub merge: MergeSummary,
    pub history: History,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Result<Self, RunError> {
        let source = Arc::new(SssbScraper::new(&config)?);
        Ok(Self::with_source(config, source))
    }

    pub fn with_source(config: AppConfig, source: Arc<dyn ListingSource>) -> Self {
        Self { config, source }
    }

    pub async fn scrape(&self) -> Result<ScrapeOutcome, RunError> {
        self.scrape_at(Local::now().naive_local()).await
    }

    pub async fn scrape_at(&self, taken_at: NaiveDateTime) -> Result<ScrapeOutcome, RunError> {
        let fetch = &self.config.fetch;

        // ── 1. Session ────────────────────────────────────────────────────────
        info!("=== Step 1: Logging in ===");
        let credit_days = self.source.member_credit_days().await?;

        // ── 2. Index ──────────────────────────────────────────────────────────
        info!("=== Step 2: Crawling listing index (max {} pages) ===", fetch.max_pages);
        let crawl = self.source.fetch_index(fetch.max_pages).await?;

        // ── 3. Normalise ──────────────────────────────────────────────────────
        info!("=== Step 3: Normalising {} listings ===", crawl.listings.len());
        let (records, dropped) = normalize_all(&crawl.listings);
        let (mut records, duplicates) = dedupe_last_wins(records);
        if duplicates > 0 {
            info!("{} duplicate listing(s) collapsed", duplicates);
        }

        let mut stats = ScrapeStats {
            pages: crawl.pages,
            hit_page_limit: crawl.hit_page_limit,
            listings_seen: crawl.listings.len(),
            normalize_dropped: dropped,
            duplicates,
            ..ScrapeStats::default()
        };

        // ── 4. Detail pages ───────────────────────────────────────────────────
        if fetch.fetch_closing_dates {
            info!(
                "=== Step 4: Fetching {} detail pages ({} concurrent) ===",
                records.len(),
                fetch.concurrency
            );
            let (enriched, skipped) = enrich_details(
                Arc::clone(&self.source),
                &mut records,
                fetch.concurrency,
                fetch.detail_timeout(),
            )
            .await?;
            stats.details_enriched = enriched;
            stats.details_skipped = skipped;
        } else {
            info!("=== Step 4: Detail pages disabled, closing dates left unknown ===");
        }

        let snapshot = Snapshot::new(taken_at, credit_days, stats.details_skipped, records);
        info!(
            "Snapshot {}: {} listings | {} enriched | {} detail fetches skipped | {} dropped",
            snapshot.date(),
            snapshot.len(),
            stats.details_enriched,
            stats.details_skipped,
            stats.normalize_dropped,
        );
        Ok(ScrapeOutcome { snapshot, stats })
    }

    pub async fn run(&self, repo: &Repository) -> Result<RunReport> {
        self.run_at(repo, Local::now().naive_local()).await
    }

    /// Scrape, merge into the stored history and persist. The run is logged
    /// in `scrape_runs` whether it succeeds or not.
    pub async fn run_at(&self, repo: &Repository, taken_at: NaiveDateTime) -> Result<RunReport> {
        let run_id = repo.begin_scrape_run()?;

        match self.scrape_and_store(repo, taken_at).await {
            Ok(report) => {
                let listings = report.history.latest().map_or(0, Snapshot::len);
                repo.finish_scrape_run(run_id, listings, report.stats.details_skipped, None)?;
                Ok(report)
            }
            Err(e) => {
                error!("Run failed: {:#}", e);
                repo.finish_scrape_run(run_id, 0, 0, Some(&format!("{:#}", e))).ok();
                Err(e)
            }
        }
    }

    async fn scrape_and_store(&self, repo: &Repository, taken_at: NaiveDateTime) -> Result<RunReport> {
        let outcome = self.scrape_at(taken_at).await?;

        info!("=== Step 5: Merging into history ===");
        let previous = repo.load_history(None).context("Failed to load history")?;
        let merged = merge(&previous, outcome.snapshot)?;

        let latest = merged
            .history
            .latest()
            .context("merged history has no snapshot")?;
        repo.save_snapshot(latest).context("Failed to store snapshot")?;

        let summary = merged.summary;
        info!(
            "=== Done: {} listings | {} new | {} updated | {} gone | {} closing dates kept | {} detail fetches skipped ===",
            latest.len(),
            summary.inserted,
            summary.updated,
            summary.no_longer_available,
            summary.closing_dates_carried,
            outcome.stats.details_skipped,
        );

        Ok(RunReport {
            stats: outcome.stats,
            merge: summary,
            history: merged.history,
        })
    }
}

fn normalize_all(raw: &[RawListing]) -> (Vec<ListingRecord>, usize) {
    let mut records = Vec::with_capacity(raw.len());
    let mut dropped = 0;
    for (i, listing) in raw.iter().enumerate() {
        match normalize(listing) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    "Listing #{} ({}) dropped: {}",
                    i + 1,
                    listing.name.as_deref().unwrap_or("unnamed"),
                    e
                );
                dropped += 1;
            }
        }
    }
    (records, dropped)
}

/// Fetch detail pages for `records` and apply them in place.
///
/// Returns (enriched, skipped). A record without a link, a failed fetch, an
/// unparseable page, or a fetch still outstanding at the deadline counts as
/// skipped. Only an authentication failure aborts.
pub async fn enrich_details(
    source: Arc<dyn ListingSource>,
    records: &mut [ListingRecord],
    concurrency: usize,
    deadline_after: Duration,
) -> Result<(usize, usize), AuthError> {
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut skipped = 0usize;

    for record in records.iter() {
        let Some(url) = record.listing_url.clone() else {
            warn!("{}: no detail link", record.identity_key);
            skipped += 1;
            continue;
        };
        let key = record.identity_key.clone();
        let source = Arc::clone(&source);
        let sem = Arc::clone(&sem);

        tasks.spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                let closed = FetchError {
                    url,
                    cause: TransportError::Other("task pool closed".into()),
                };
                return (key, Err(ScrapeError::Fetch(closed)));
            };
            let result = source.fetch_detail(&url).await;
            (key, result)
        });
    }

    let deadline = Instant::now() + deadline_after;
    let mut details: HashMap<String, DetailFields> = HashMap::new();

    loop {
        match timeout_at(deadline, tasks.join_next()).await {
            Ok(None) => break,
            Ok(Some(Ok((key, Ok(fields))))) => {
                details.insert(key, fields);
            }
            Ok(Some(Ok((_, Err(ScrapeError::Auth(e)))))) => {
                tasks.abort_all();
                return Err(e);
            }
            Ok(Some(Ok((key, Err(e))))) => {
                warn!("{}: detail skipped: {}", key, e);
                skipped += 1;
            }
            Ok(Some(Err(e))) => {
                error!("Detail task failed: {}", e);
                skipped += 1;
            }
            Err(_) => {
                let outstanding = tasks.len();
                warn!(
                    "Detail timeout after {:?}, abandoning {} outstanding fetch(es)",
                    deadline_after, outstanding
                );
                tasks.abort_all();
                skipped += outstanding;
                break;
            }
        }
    }

    let mut enriched = 0;
    for record in records.iter_mut() {
        if let Some(fields) = details.get(&record.identity_key) {
            record.enrich(fields);
            enriched += 1;
        }
    }
    Ok((enriched, skipped))
}
