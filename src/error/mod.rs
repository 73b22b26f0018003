//! Error taxonomy of the acquisition pipeline.
//!
//! `AuthError` and the `RunError` variants abort a run. `FetchError` and
//! `ParseError` on a detail page, and `NormalizeError`, only cost the affected
//! listing its enrichment or its place in the snapshot.

use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credentials configured (set SSSB__CREDENTIALS__USERNAME / SSSB__CREDENTIALS__PASSWORD)")]
    MissingCredentials,
    #[error("portal rejected the credentials")]
    Rejected,
    #[error("session expired again right after re-authentication")]
    ExpiredAfterRefresh,
    #[error("login request failed: {0}")]
    Transport(String),
}

/// What a single transport call reported.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Timeouts, dropped connections, 429 and 5xx responses.
    #[error("transient: {0}")]
    Transient(String),
    #[error("session expired")]
    SessionExpired,
    #[error("HTTP {0}")]
    Status(u16),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("fetching {url} failed: {cause}")]
pub struct FetchError {
    pub url: String,
    pub cause: TransportError,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The listing container is gone: the site layout changed.
    #[error("listing container `{0}` not found")]
    MissingContainer(&'static str),
    #[error("page is not a listing: {0}")]
    NotAListing(String),
    #[error("invalid selector {0}")]
    Selector(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("listing has no address")]
    MissingAddress,
    #[error("listing has no housing type")]
    MissingHousingType,
    #[error("unrecognised housing type {0:?}")]
    UnknownHousingType(String),
}

/// Failure of one authenticated page fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScrapeError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("snapshot taken at {current} is older than the latest stored one ({latest})")]
    OutOfOrder {
        latest: NaiveDateTime,
        current: NaiveDateTime,
    },
}

/// Errors that abort a run, tagged with the stage they happened in.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("index page {page} could not be fetched: {source}")]
    IndexFetch {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("index page {url} has an unexpected layout: {source}")]
    IndexLayout {
        url: String,
        #[source]
        source: ParseError,
    },
    #[error("invalid portal URL {0}")]
    InvalidUrl(String),
}

impl RunError {
    /// Lift a failed index-page fetch into the stage-tagged run error.
    pub fn from_index(page: u32, err: ScrapeError) -> Self {
        match err {
            ScrapeError::Auth(e) => RunError::Auth(e),
            ScrapeError::Fetch(source) => RunError::IndexFetch { page, source },
            ScrapeError::Parse { url, source } => RunError::IndexLayout { url, source },
        }
    }
}
