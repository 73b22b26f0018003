pub mod cleaner;
pub mod http_client;
pub mod parsers;
pub mod session;

use crate::config::AppConfig;
use crate::error::{AuthError, FetchError, RunError, ScrapeError, TransportError};
use crate::models::{DetailFields, RawListing};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use self::http_client::{PageFetcher, PortalTransport, ReqwestTransport, RetryPolicy};
use self::parsers::{parse_detail, parse_index};
use self::session::{Credentials, SessionProvider};

// ── Source trait ──────────────────────────────────────────────────────────────

/// Everything the pipeline needs from the portal.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Log in if needed; the member's own credit days, if the portal shows them.
    async fn member_credit_days(&self) -> Result<Option<u32>, AuthError>;
    /// Walk the paginated index, at most `max_pages` pages.
    async fn fetch_index(&self, max_pages: u32) -> Result<IndexCrawl, RunError>;
    async fn fetch_detail(&self, url: &str) -> Result<DetailFields, ScrapeError>;
}

/// Raw entries of all index pages, in scan order.
#[derive(Debug, Clone, Default)]
pub struct IndexCrawl {
    pub listings: Vec<RawListing>,
    pub pages: u32,
    pub hit_page_limit: bool,
}

// ── SSSB scraper ──────────────────────────────────────────────────────────────

pub struct SssbScraper {
    sessions: SessionProvider,
    fetcher: PageFetcher,
    first_page: Url,
}

impl SssbScraper {
    pub fn new(config: &AppConfig) -> Result<Self, RunError> {
        let credentials = config.credentials()?;
        let transport: Arc<dyn PortalTransport> = Arc::new(ReqwestTransport::new(&config.portal));
        // Always the full index; type/rent/area filters only narrow the view.
        let first_page = index_url(&config.portal.list_url(), config.fetch.page_size)?;
        Ok(Self::with_transport(
            transport,
            credentials,
            first_page,
            config.fetch.retry_policy(),
        ))
    }

    pub fn with_transport(
        transport: Arc<dyn PortalTransport>,
        credentials: Credentials,
        first_page: Url,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            sessions: SessionProvider::new(Arc::clone(&transport), credentials),
            fetcher: PageFetcher::new(transport, policy),
            first_page,
        }
    }

    /// Fetch a page, re-authenticating once if the session has expired.
    async fn get_page(&self, url: &str) -> Result<String, ScrapeError> {
        let session = self.sessions.acquire().await?;
        match self.fetcher.fetch(url, &session).await {
            Err(FetchError {
                cause: TransportError::SessionExpired,
                ..
            }) => {
                let fresh = self.sessions.refresh(&session).await?;
                match self.fetcher.fetch(url, &fresh).await {
                    Err(FetchError {
                        cause: TransportError::SessionExpired,
                        ..
                    }) => Err(AuthError::ExpiredAfterRefresh.into()),
                    other => Ok(other?),
                }
            }
            other => Ok(other?),
        }
    }
}

/// URL of the first index page, listing every housing type.
pub fn index_url(list_url: &str, page_size: u32) -> Result<Url, RunError> {
    let mut url = Url::parse(list_url).map_err(|_| RunError::InvalidUrl(list_url.to_string()))?;
    url.query_pairs_mut()
        .append_pair("paginationantal", &page_size.to_string());
    Ok(url)
}

#[async_trait]
impl ListingSource for SssbScraper {
    async fn member_credit_days(&self) -> Result<Option<u32>, AuthError> {
        let session = self.sessions.acquire().await?;
        Ok(session.member_credit_days())
    }

    async fn fetch_index(&self, max_pages: u32) -> Result<IndexCrawl, RunError> {
        let mut crawl = IndexCrawl::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut url = self.first_page.clone();

        loop {
            let page = crawl.pages + 1;
            info!("Fetching listing page {} ({})", page, url);

            let html = self
                .get_page(url.as_str())
                .await
                .map_err(|e| RunError::from_index(page, e))?;
            let parsed = parse_index(&html, &url).map_err(|source| RunError::IndexLayout {
                url: url.to_string(),
                source,
            })?;

            crawl.pages = page;
            visited.insert(url.to_string());

            if parsed.listings.is_empty() {
                debug!("Empty page {}, stopping pagination", page);
                break;
            }
            info!("  Page {}: {} listings", page, parsed.listings.len());
            crawl.listings.extend(parsed.listings);

            let Some(next) = parsed.next_page else { break };
            if visited.contains(&next) {
                warn!("Next link of page {} points back to {}, stopping", page, next);
                break;
            }
            if page >= max_pages {
                warn!("Reached page limit ({}), stopping", max_pages);
                crawl.hit_page_limit = true;
                break;
            }
            url = Url::parse(&next).map_err(|_| RunError::InvalidUrl(next.clone()))?;
        }

        info!(
            "Total listings discovered: {} across {} page(s)",
            crawl.listings.len(),
            crawl.pages
        );
        Ok(crawl)
    }

    async fn fetch_detail(&self, url: &str) -> Result<DetailFields, ScrapeError> {
        debug!("Fetching detail page: {}", url);
        let html = self.get_page(url).await?;
        parse_detail(&html).map_err(|source| ScrapeError::Parse {
            url: url.to_string(),
            source,
        })
    }
}

// ── Test transport ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::http_client::PortalTransport;
    use super::session::{Credentials, Session};
    use crate::error::{AuthError, TransportError};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted portal. Each URL answers from its queue; the last answer
    /// repeats once the queue is down to one. Unscripted URLs are 404s.
    #[derive(Default)]
    pub(crate) struct StubTransport {
        pages: Mutex<HashMap<String, VecDeque<Result<String, TransportError>>>>,
        gets: Mutex<HashMap<String, usize>>,
        stalled: Mutex<HashSet<String>>,
        logins: AtomicUsize,
        reject: AtomicBool,
        credit_days: Mutex<Option<u32>>,
    }

    impl StubTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn session(generation: u64) -> Session {
            Session::new(reqwest::Client::new(), None).with_generation(generation)
        }

        pub(crate) fn script(&self, url: &str, answers: Vec<Result<String, TransportError>>) {
            self.pages
                .lock()
                .unwrap()
                .insert(url.to_string(), answers.into_iter().collect());
        }

        pub(crate) fn page(&self, url: &str, html: String) {
            self.script(url, vec![Ok(html)]);
        }

        /// Requests for `url` never complete.
        pub(crate) fn stall(&self, url: &str) {
            self.stalled.lock().unwrap().insert(url.to_string());
        }

        pub(crate) fn reject_logins(&self) {
            self.reject.store(true, Ordering::SeqCst);
        }

        pub(crate) fn set_credit_days(&self, days: u32) {
            *self.credit_days.lock().unwrap() = Some(days);
        }

        pub(crate) fn logins(&self) -> usize {
            self.logins.load(Ordering::SeqCst)
        }

        pub(crate) fn gets(&self, url: &str) -> usize {
            self.gets.lock().unwrap().get(url).copied().unwrap_or(0)
        }

        fn next_answer(&self, url: &str) -> Result<String, TransportError> {
            let mut pages = self.pages.lock().unwrap();
            match pages.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue
                    .front()
                    .cloned()
                    .unwrap_or(Err(TransportError::Status(404))),
                None => Err(TransportError::Status(404)),
            }
        }
    }

    #[async_trait]
    impl PortalTransport for StubTransport {
        async fn login(&self, _credentials: &Credentials) -> Result<Session, AuthError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.reject.load(Ordering::SeqCst) {
                return Err(AuthError::Rejected);
            }
            let days = *self.credit_days.lock().unwrap();
            Ok(Session::new(reqwest::Client::new(), days))
        }

        async fn get(&self, url: &str, _session: &Session) -> Result<String, TransportError> {
            *self.gets.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
            let stalled = self.stalled.lock().unwrap().contains(url);
            if stalled {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.next_answer(url)
        }
    }
}
