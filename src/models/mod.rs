use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ── Housing type ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HousingType {
    Room,
    Studio,
    Apartment,
}

impl HousingType {
    /// Stable lowercase name, used in identity keys and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            HousingType::Room => "room",
            HousingType::Studio => "studio",
            HousingType::Apartment => "apartment",
        }
    }

    /// Object type code the portal uses in its search query.
    pub fn portal_code(&self) -> &'static str {
        match self {
            HousingType::Room => "BOASR",
            HousingType::Studio => "BOAS1",
            HousingType::Apartment => "BOASL",
        }
    }

    pub fn from_stored(s: &str) -> Option<Self> {
        match s {
            "room" => Some(HousingType::Room),
            "studio" => Some(HousingType::Studio),
            "apartment" => Some(HousingType::Apartment),
            _ => None,
        }
    }
}

impl fmt::Display for HousingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HousingType::Room => "Room",
            HousingType::Studio => "Studio",
            HousingType::Apartment => "Apartment",
        };
        f.write_str(label)
    }
}

// ── Listing record ────────────────────────────────────────────────────────────

/// One housing unit as observed in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub identity_key: String,
    pub name: String,
    pub area_name: String,
    pub address: String,
    pub housing_type: HousingType,
    pub floor: Option<i32>,
    pub living_space_sqm: Option<f64>,
    pub monthly_rent: Option<u32>,
    pub move_in_date: Option<NaiveDate>,
    /// Credit days of the current top applicant.
    pub best_bid_days: Option<u32>,
    pub applicant_count: Option<u32>,
    pub closing_date: Option<NaiveDate>,
    pub listing_url: Option<String>,
    /// Whether the detail page was fetched and parsed during this run.
    #[serde(skip)]
    pub detail_fetched: bool,
}

impl ListingRecord {
    /// Apply detail-page fields. Fields the page did not carry keep their
    /// index-page values.
    pub fn enrich(&mut self, detail: &DetailFields) {
        if detail.closing_date.is_some() {
            self.closing_date = detail.closing_date;
        }
        if detail.applicant_count.is_some() {
            self.applicant_count = detail.applicant_count;
        }
        if detail.best_bid_days.is_some() {
            self.best_bid_days = detail.best_bid_days;
        }
        self.detail_fetched = true;
    }
}

/// Stable identity of a unit across runs: normalised address, housing type
/// and the unit label (the listing title with the address stripped).
pub fn identity_key(address: &str, housing_type: HousingType, unit: &str) -> String {
    let address = key_part(address);
    let unit = {
        let u = key_part(unit);
        match u.strip_prefix(&address) {
            Some(rest) => rest.trim_start_matches(['-', '/']).to_string(),
            None => u,
        }
    };

    if unit.is_empty() || unit == address {
        format!("{}|{}", address, housing_type.as_str())
    } else {
        format!("{}|{}|{}", address, housing_type.as_str(), unit)
    }
}

fn key_part(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase().replace('|', "/"))
        .collect::<Vec<_>>()
        .join("-")
}

// ── Raw scraped rows ──────────────────────────────────────────────────────────

/// One index-page entry, fields exactly as scraped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawListing {
    pub name: Option<String>,
    pub area: Option<String>,
    pub address: Option<String>,
    pub housing_type: Option<String>,
    pub floor: Option<String>,
    pub living_space: Option<String>,
    pub rent: Option<String>,
    pub move_in_date: Option<String>,
    /// e.g. "1234 (5 st)": best bid followed by applicant count.
    pub queue_info: Option<String>,
    pub link: Option<String>,
}

/// One parsed index page.
#[derive(Debug, Clone, Default)]
pub struct IndexPage {
    pub listings: Vec<RawListing>,
    pub next_page: Option<String>,
}

/// Fields only available on a listing's detail page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetailFields {
    pub closing_date: Option<NaiveDate>,
    pub applicant_count: Option<u32>,
    pub best_bid_days: Option<u32>,
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// All listings observed in one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    taken_at: NaiveDateTime,
    member_credit_days: Option<u32>,
    skipped_details: usize,
    records: Vec<ListingRecord>,
}

impl Snapshot {
    /// Builds a snapshot, collapsing duplicate identity keys (last wins).
    pub fn new(
        taken_at: NaiveDateTime,
        member_credit_days: Option<u32>,
        skipped_details: usize,
        records: Vec<ListingRecord>,
    ) -> Self {
        let (records, _) = dedupe_last_wins(records);
        Self {
            taken_at,
            member_credit_days,
            skipped_details,
            records,
        }
    }

    pub fn taken_at(&self) -> NaiveDateTime {
        self.taken_at
    }

    pub fn date(&self) -> NaiveDate {
        self.taken_at.date()
    }

    pub fn member_credit_days(&self) -> Option<u32> {
        self.member_credit_days
    }

    pub fn skipped_details(&self) -> usize {
        self.skipped_details
    }

    pub fn records(&self) -> &[ListingRecord] {
        &self.records
    }

    pub fn get(&self, identity_key: &str) -> Option<&ListingRecord> {
        self.records.iter().find(|r| r.identity_key == identity_key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Collapse duplicate identity keys. The later occurrence's values replace the
/// earlier ones at the earlier position, so scan order is kept. Returns the
/// number of duplicates collapsed.
pub fn dedupe_last_wins(records: Vec<ListingRecord>) -> (Vec<ListingRecord>, usize) {
    let mut position: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<ListingRecord> = Vec::with_capacity(records.len());
    let mut duplicates = 0;

    for record in records {
        match position.get(&record.identity_key) {
            Some(&i) => {
                out[i] = record;
                duplicates += 1;
            }
            None => {
                position.insert(record.identity_key.clone(), out.len());
                out.push(record);
            }
        }
    }

    (out, duplicates)
}

// ── History ───────────────────────────────────────────────────────────────────

/// Snapshots ordered by time, at most one per calendar day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    snapshots: Vec<Snapshot>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a history from snapshots in any order. Later snapshots of the
    /// same day replace earlier ones.
    pub fn from_snapshots(mut snapshots: Vec<Snapshot>) -> Self {
        snapshots.sort_by_key(|s| s.taken_at());
        let mut out: Vec<Snapshot> = Vec::with_capacity(snapshots.len());
        for snap in snapshots {
            match out.last_mut() {
                Some(last) if last.date() == snap.date() => *last = snap,
                _ => out.push(snap),
            }
        }
        Self { snapshots: out }
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Listings present in the most recent snapshot.
    pub fn available_now(&self) -> &[ListingRecord] {
        self.latest().map(|s| s.records()).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub(crate) fn push_or_replace(&mut self, snapshot: Snapshot) {
        match self.snapshots.last_mut() {
            Some(last) if last.date() == snapshot.date() => *last = snapshot,
            _ => self.snapshots.push(snapshot),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
