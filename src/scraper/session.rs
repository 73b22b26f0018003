use crate::error::AuthError;
use crate::scraper::http_client::PortalTransport;
use chrono::{Local, NaiveDateTime};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// An authenticated portal session.
///
/// Each login produces a new generation; a fetch that saw an expired
/// session reports the generation it used so that concurrent refreshes
/// collapse into one login.
#[derive(Debug)]
pub struct Session {
    generation: u64,
    client: reqwest::Client,
    member_credit_days: Option<u32>,
    established_at: NaiveDateTime,
}

impl Session {
    pub fn new(client: reqwest::Client, member_credit_days: Option<u32>) -> Self {
        Self {
            generation: 0,
            client,
            member_credit_days,
            established_at: Local::now().naive_local(),
        }
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// The logged-in member's own queue days, when the landing page shows them.
    pub fn member_credit_days(&self) -> Option<u32> {
        self.member_credit_days
    }

    pub fn established_at(&self) -> NaiveDateTime {
        self.established_at
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

/// Owns the current session and serialises logins.
pub struct SessionProvider {
    transport: Arc<dyn PortalTransport>,
    credentials: Credentials,
    current: Mutex<Option<Arc<Session>>>,
}

impl SessionProvider {
    pub fn new(transport: Arc<dyn PortalTransport>, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
            current: Mutex::new(None),
        }
    }

    /// The current session, logging in first if there is none.
    pub async fn acquire(&self) -> Result<Arc<Session>, AuthError> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            return Ok(Arc::clone(session));
        }
        self.login_into(&mut current).await
    }

    /// Replace `stale` with a fresh session.
    ///
    /// If another task already replaced it, the newer session is returned
    /// without logging in again.
    pub async fn refresh(&self, stale: &Session) -> Result<Arc<Session>, AuthError> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if session.generation() != stale.generation() {
                debug!(
                    "Session {} already replaced by {}",
                    stale.generation(),
                    session.generation()
                );
                return Ok(Arc::clone(session));
            }
        }
        info!(
            "Session {} (established {}) expired, logging in again",
            stale.generation(),
            stale.established_at().format("%H:%M:%S")
        );
        self.login_into(&mut current).await
    }

    async fn login_into(&self, slot: &mut Option<Arc<Session>>) -> Result<Arc<Session>, AuthError> {
        let generation = slot.as_ref().map_or(1, |s| s.generation() + 1);
        let session = self.transport.login(&self.credentials).await?;
        let session = Arc::new(session.with_generation(generation));
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }
}
