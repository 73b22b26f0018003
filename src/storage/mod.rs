use crate::models::{History, HousingType, ListingRecord, Snapshot};
use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use duckdb::{Connection, params};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_date       DATE PRIMARY KEY,
    taken_at            TIMESTAMP NOT NULL,
    member_credit_days  BIGINT,
    skipped_details     BIGINT NOT NULL DEFAULT 0,
    listing_count       BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS listings (
    identity_key        VARCHAR  NOT NULL,
    snapshot_date       DATE     NOT NULL,
    -- Scan order within the snapshot
    position            BIGINT   NOT NULL,
    name                VARCHAR  NOT NULL,
    area_name           VARCHAR  NOT NULL DEFAULT '',
    address             VARCHAR  NOT NULL,
    housing_type        VARCHAR  NOT NULL,
    floor               BIGINT,
    living_space_sqm    DOUBLE,
    monthly_rent        BIGINT,
    move_in_date        DATE,
    best_bid_days       BIGINT,
    applicant_count     BIGINT,
    closing_date        DATE,
    listing_url         VARCHAR,
    detail_fetched      BOOLEAN  NOT NULL DEFAULT FALSE,
    PRIMARY KEY (identity_key, snapshot_date)
);

CREATE SEQUENCE IF NOT EXISTS scrape_runs_id_seq START 1;

CREATE TABLE IF NOT EXISTS scrape_runs (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('scrape_runs_id_seq'),
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    listings_seen       BIGINT DEFAULT 0,
    details_skipped     BIGINT DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_listings_date ON listings (snapshot_date);
CREATE INDEX IF NOT EXISTS idx_listings_key  ON listings (identity_key);
"#;

/// One row of the scrape run log.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeRun {
    pub id: i64,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub status: String,
    pub listings_seen: i64,
    pub details_skipped: i64,
    pub error_msg: Option<String>,
}

/// Listing row as stored, before the housing type is validated.
struct StoredListing {
    snapshot_date: NaiveDate,
    identity_key: String,
    name: String,
    area_name: String,
    address: String,
    housing_type: String,
    floor: Option<i64>,
    living_space_sqm: Option<f64>,
    monthly_rent: Option<i64>,
    move_in_date: Option<NaiveDate>,
    best_bid_days: Option<i64>,
    applicant_count: Option<i64>,
    closing_date: Option<NaiveDate>,
    listing_url: Option<String>,
    detail_fetched: bool,
}

impl StoredListing {
    fn into_record(self) -> Result<(NaiveDate, ListingRecord)> {
        let housing_type = HousingType::from_stored(&self.housing_type).ok_or_else(|| {
            anyhow!(
                "stored listing {} has unknown housing type {:?}",
                self.identity_key,
                self.housing_type
            )
        })?;
        let record = ListingRecord {
            identity_key: self.identity_key,
            name: self.name,
            area_name: self.area_name,
            address: self.address,
            housing_type,
            floor: self.floor.and_then(|v| i32::try_from(v).ok()),
            living_space_sqm: self.living_space_sqm,
            monthly_rent: self.monthly_rent.and_then(|v| u32::try_from(v).ok()),
            move_in_date: self.move_in_date,
            best_bid_days: self.best_bid_days.and_then(|v| u32::try_from(v).ok()),
            applicant_count: self.applicant_count.and_then(|v| u32::try_from(v).ok()),
            closing_date: self.closing_date,
            listing_url: self.listing_url,
            detail_fetched: self.detail_fetched,
        };
        Ok((self.snapshot_date, record))
    }
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        Ok(self.conn.execute_batch(sql)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn
            .execute_batch(INDEXES)
            .context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    /// Store a snapshot, replacing whatever was stored for the same day.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<usize> {
        let date = snapshot.date();
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"INSERT INTO snapshots
                   (snapshot_date, taken_at, member_credit_days, skipped_details, listing_count)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (snapshot_date) DO UPDATE SET
                   taken_at           = excluded.taken_at,
                   member_credit_days = COALESCE(excluded.member_credit_days, snapshots.member_credit_days),
                   skipped_details    = excluded.skipped_details,
                   listing_count      = excluded.listing_count"#,
            params![
                date,
                snapshot.taken_at(),
                snapshot.member_credit_days().map(i64::from),
                snapshot.skipped_details() as i64,
                snapshot.len() as i64,
            ],
        )
        .with_context(|| format!("upsert snapshot {}", date))?;

        // Same-day rerun: drop listings that are gone from the new snapshot.
        let current: HashSet<&str> = snapshot
            .records()
            .iter()
            .map(|r| r.identity_key.as_str())
            .collect();
        let stored: Vec<String> = {
            let mut stmt = tx.prepare("SELECT identity_key FROM listings WHERE snapshot_date = ?")?;
            let keys = stmt
                .query_map(params![date], |r| r.get(0))?
                .collect::<duckdb::Result<Vec<String>>>()?;
            keys
        };
        for key in stored.iter().filter(|k| !current.contains(k.as_str())) {
            debug!("{}: no longer listed on {}", key, date);
            tx.execute(
                "DELETE FROM listings WHERE identity_key = ? AND snapshot_date = ?",
                params![key, date],
            )?;
        }

        let sql = r#"
            INSERT INTO listings
                (identity_key, snapshot_date, position, name, area_name, address, housing_type,
                 floor, living_space_sqm, monthly_rent, move_in_date, best_bid_days,
                 applicant_count, closing_date, listing_url, detail_fetched)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (identity_key, snapshot_date) DO UPDATE SET
                position         = excluded.position,
                name             = excluded.name,
                area_name        = excluded.area_name,
                address          = excluded.address,
                housing_type     = excluded.housing_type,
                floor            = excluded.floor,
                living_space_sqm = excluded.living_space_sqm,
                monthly_rent     = excluded.monthly_rent,
                move_in_date     = excluded.move_in_date,
                best_bid_days    = excluded.best_bid_days,
                applicant_count  = excluded.applicant_count,
                closing_date     = excluded.closing_date,
                listing_url      = excluded.listing_url,
                detail_fetched   = excluded.detail_fetched
        "#;

        for (position, r) in snapshot.records().iter().enumerate() {
            tx.execute(
                sql,
                params![
                    r.identity_key,
                    date,
                    position as i64,
                    r.name,
                    r.area_name,
                    r.address,
                    r.housing_type.as_str(),
                    r.floor.map(i64::from),
                    r.living_space_sqm,
                    r.monthly_rent.map(i64::from),
                    r.move_in_date,
                    r.best_bid_days.map(i64::from),
                    r.applicant_count.map(i64::from),
                    r.closing_date,
                    r.listing_url,
                    r.detail_fetched,
                ],
            )
            .with_context(|| format!("insert listing {} {}", r.identity_key, date))?;
        }

        tx.commit()?;
        Ok(snapshot.len())
    }

    /// Stored snapshots, optionally only those on or after `since`.
    pub fn load_history(&self, since: Option<NaiveDate>) -> Result<History> {
        let since_clause = if since.is_some() {
            " WHERE snapshot_date >= ?"
        } else {
            ""
        };
        let bind: Vec<NaiveDate> = since.into_iter().collect();

        let mut stmt = self.conn.prepare(&format!(
            "SELECT snapshot_date, taken_at, member_credit_days, skipped_details \
             FROM snapshots{} ORDER BY snapshot_date",
            since_clause
        ))?;
        let heads = stmt
            .query_map(duckdb::params_from_iter(bind.iter()), |r| {
                Ok((
                    r.get::<_, NaiveDate>(0)?,
                    r.get::<_, NaiveDateTime>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT snapshot_date, identity_key, name, area_name, address, housing_type, \
                    floor, living_space_sqm, monthly_rent, move_in_date, best_bid_days, \
                    applicant_count, closing_date, listing_url, detail_fetched \
             FROM listings{} ORDER BY snapshot_date, position",
            since_clause
        ))?;
        let rows = stmt
            .query_map(duckdb::params_from_iter(bind.iter()), |r| {
                Ok(StoredListing {
                    snapshot_date: r.get(0)?,
                    identity_key: r.get(1)?,
                    name: r.get(2)?,
                    area_name: r.get(3)?,
                    address: r.get(4)?,
                    housing_type: r.get(5)?,
                    floor: r.get(6)?,
                    living_space_sqm: r.get(7)?,
                    monthly_rent: r.get(8)?,
                    move_in_date: r.get(9)?,
                    best_bid_days: r.get(10)?,
                    applicant_count: r.get(11)?,
                    closing_date: r.get(12)?,
                    listing_url: r.get(13)?,
                    detail_fetched: r.get(14)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;

        let mut by_date: HashMap<NaiveDate, Vec<ListingRecord>> = HashMap::new();
        for row in rows {
            let (date, record) = row.into_record()?;
            by_date.entry(date).or_default().push(record);
        }

        let snapshots = heads
            .into_iter()
            .map(|(date, taken_at, credit_days, skipped)| {
                Snapshot::new(
                    taken_at,
                    credit_days.and_then(|v| u32::try_from(v).ok()),
                    usize::try_from(skipped).unwrap_or(0),
                    by_date.remove(&date).unwrap_or_default(),
                )
            })
            .collect();

        Ok(History::from_snapshots(snapshots))
    }

    pub fn snapshot_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM snapshots")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn listing_row_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM listings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    /// Distinct units ever seen.
    pub fn unit_count(&self) -> Result<i64> {
        let mut s = self
            .conn
            .prepare("SELECT COUNT(DISTINCT identity_key) FROM listings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let mut s = self
            .conn
            .prepare("SELECT MIN(snapshot_date), MAX(snapshot_date) FROM snapshots")?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    // ── Scrape run log ────────────────────────────────────────────────────────

    pub fn begin_scrape_run(&self) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO scrape_runs (started_at, status) VALUES (?, 'running') RETURNING id",
            params![Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_scrape_run(
        &self,
        run_id: i64,
        listings: usize,
        skipped: usize,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"UPDATE scrape_runs SET
               finished_at = ?, status = ?,
               listings_seen = ?, details_skipped = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                listings as i64,
                skipped as i64,
                error,
                run_id,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<ScrapeRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, status, listings_seen, details_skipped, error_msg \
             FROM scrape_runs ORDER BY id DESC LIMIT ?",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], |r| {
                Ok(ScrapeRun {
                    id: r.get(0)?,
                    started_at: r.get(1)?,
                    finished_at: r.get(2)?,
                    status: r.get(3)?,
                    listings_seen: r.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    details_skipped: r.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    error_msg: r.get(6)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(runs)
    }
}
