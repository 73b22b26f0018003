use crate::config::PortalConfig;
use crate::error::{AuthError, FetchError, TransportError};
use crate::scraper::parsers::{is_login_page, parse_login_form, parse_member_credit_days};
use crate::scraper::session::{Credentials, Session};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};
use url::Url;

// ── Transport ─────────────────────────────────────────────────────────────────

/// The raw capability to log in and to fetch a page within a session.
#[async_trait]
pub trait PortalTransport: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError>;
    async fn get(&self, url: &str, session: &Session) -> Result<String, TransportError>;
}

/// HTTP transport: cookie-backed sessions, polite delays, status mapping.
pub struct ReqwestTransport {
    config: PortalConfig,
}

impl ReqwestTransport {
    pub fn new(config: &PortalConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(&self.config.user_agent)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .gzip(true)
            // One cookie jar per session; the portal keys the login on it.
            .cookie_store(true)
            .build()
    }

    /// Sleep for the configured delay + random jitter.
    async fn polite_delay(&self) {
        let jitter = rand::random_range(0..=self.config.jitter_ms);
        sleep(Duration::from_millis(self.config.request_delay_ms + jitter)).await;
    }

    fn is_login_url(&self, url: &Url) -> bool {
        url.path().trim_end_matches('/') == self.config.login_path.trim_end_matches('/')
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        TransportError::Transient(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// Form-encoded login POST: the form's hidden fields, then `log`/`pwd`.
fn login_body(hidden: &[(String, String)], credentials: &Credentials) -> String {
    let mut body = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in hidden {
        body.append_pair(name, value);
    }
    body.append_pair("log", credentials.username());
    body.append_pair("pwd", credentials.password());
    body.finish()
}

fn login_failed(e: impl std::fmt::Display) -> AuthError {
    AuthError::Transport(e.to_string())
}

#[async_trait]
impl PortalTransport for ReqwestTransport {
    async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let client = self.build_client().map_err(login_failed)?;
        let login_url = Url::parse(&self.config.login_url()).map_err(login_failed)?;

        self.polite_delay().await;
        debug!("GET {} (login form)", login_url);
        let page = client
            .get(login_url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(login_failed)?
            .text()
            .await
            .map_err(login_failed)?;

        let form = parse_login_form(&page, &login_url).map_err(login_failed)?;

        let body = login_body(&form.hidden, credentials);

        self.polite_delay().await;
        debug!("POST {} (login)", form.action);
        let resp = client
            .post(form.action)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(login_failed)?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(AuthError::Rejected),
            s if !s.is_success() => return Err(AuthError::Transport(format!("HTTP {}", s))),
            _ => {}
        }

        let landing = resp.text().await.map_err(login_failed)?;
        if is_login_page(&landing) {
            return Err(AuthError::Rejected);
        }

        let credit_days = parse_member_credit_days(&landing);
        info!("Logged in as {} (own queue days: {:?})", credentials.username(), credit_days);
        Ok(Session::new(client, credit_days))
    }

    async fn get(&self, url: &str, session: &Session) -> Result<String, TransportError> {
        self.polite_delay().await;

        let resp = session.client().get(url).send().await.map_err(classify)?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::SessionExpired);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(TransportError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let landed_on_login = self.is_login_url(resp.url());
        let body = resp.text().await.map_err(classify)?;

        if landed_on_login || is_login_page(&body) {
            return Err(TransportError::SessionExpired);
        }
        Ok(body)
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Retries for transient failures: `max_retries` extra attempts, the wait
/// doubling from `initial_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.max_retries)
            .map(|i| self.initial_backoff.saturating_mul(2u32.saturating_pow(i)))
            .collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

// ── Page fetcher ──────────────────────────────────────────────────────────────

/// Fetches a page within a session, retrying transient failures.
///
/// Session expiry and non-transient HTTP errors are returned on the first
/// occurrence; deciding what to do with them is up to the caller.
pub struct PageFetcher {
    transport: Arc<dyn PortalTransport>,
    policy: RetryPolicy,
}

impl PageFetcher {
    pub fn new(transport: Arc<dyn PortalTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn fetch(&self, url: &str, session: &Session) -> Result<String, FetchError> {
        let attempts = AtomicU32::new(0);

        let action = || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("GET {} (attempt {})", url, attempt);
            self.transport.get(url, session)
        };
        let transient = |e: &TransportError| {
            if e.is_transient() {
                warn!(
                    "{} failed on attempt {}: {}",
                    url,
                    attempts.load(Ordering::Relaxed),
                    e
                );
                true
            } else {
                false
            }
        };

        RetryIf::start(self.policy.delays(), action, transient)
            .await
            .map_err(|cause| FetchError {
                url: url.to_string(),
                cause,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::testing::StubTransport;
    use tokio_test::{assert_err, assert_ok};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delays(),
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert!(fast(0).delays().is_empty());
    }

    #[test]
    fn login_body_posts_hidden_fields_then_credentials() {
        let hidden = vec![("redirect_to".to_string(), "/mina-sidor/".to_string())];
        let body = login_body(&hidden, &Credentials::new("student", "p&ss word"));
        assert_eq!(body, "redirect_to=%2Fmina-sidor%2F&log=student&pwd=p%26ss+word");
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let stub = Arc::new(StubTransport::new());
        stub.script(
            "https://sssb.se/a",
            vec![
                Err(TransportError::Transient("timeout".into())),
                Err(TransportError::Transient("HTTP 503".into())),
                Ok("<html>ok</html>".into()),
            ],
        );
        let fetcher = PageFetcher::new(stub.clone(), fast(3));
        let session = StubTransport::session(1);

        let html = assert_ok!(fetcher.fetch("https://sssb.se/a", &session).await);
        assert_eq!(html, "<html>ok</html>");
        assert_eq!(stub.gets("https://sssb.se/a"), 3);
    }

    #[tokio::test]
    async fn fourth_transient_failure_surfaces_fetch_error() {
        let stub = Arc::new(StubTransport::new());
        stub.script(
            "https://sssb.se/a",
            (0..4).map(|i| Err(TransportError::Transient(format!("timeout {}", i)))).collect(),
        );
        let fetcher = PageFetcher::new(stub.clone(), fast(3));
        let session = StubTransport::session(1);

        let err = assert_err!(fetcher.fetch("https://sssb.se/a", &session).await);
        assert_eq!(err.url, "https://sssb.se/a");
        assert_eq!(err.cause, TransportError::Transient("timeout 3".into()));
        assert_eq!(stub.gets("https://sssb.se/a"), 4);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let stub = Arc::new(StubTransport::new());
        stub.script("https://sssb.se/gone", vec![Err(TransportError::Status(404))]);
        stub.script("https://sssb.se/expired", vec![Err(TransportError::SessionExpired)]);
        let fetcher = PageFetcher::new(stub.clone(), fast(3));
        let session = StubTransport::session(1);

        let err = assert_err!(fetcher.fetch("https://sssb.se/gone", &session).await);
        assert_eq!(err.cause, TransportError::Status(404));
        let err = assert_err!(fetcher.fetch("https://sssb.se/expired", &session).await);
        assert_eq!(err.cause, TransportError::SessionExpired);
        assert_eq!(stub.gets("https://sssb.se/gone"), 1);
        assert_eq!(stub.gets("https://sssb.se/expired"), 1);
    }
}
