//! CSV export and bulk import of snapshot history.
//!
//! One row per listing per snapshot. Rows sharing a `taken_at` form one
//! snapshot; a snapshot without listings has no rows and is not exported.

use crate::models::{History, HousingType, ListingRecord, Snapshot, identity_key};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub taken_at: NaiveDateTime,
    pub member_credit_days: Option<u32>,
    /// Recomputed from address, type and name when empty.
    #[serde(default)]
    pub identity_key: Option<String>,
    pub name: String,
    pub area: String,
    pub address: String,
    #[serde(rename = "type")]
    pub housing_type: HousingType,
    pub floor: Option<i32>,
    pub living_space: Option<f64>,
    pub rent: Option<u32>,
    pub move_in_date: Option<NaiveDate>,
    pub best_bid: Option<u32>,
    pub applicants: Option<u32>,
    pub closing_date: Option<NaiveDate>,
    pub link: Option<String>,
}

impl HistoryRow {
    fn from_record(snapshot: &Snapshot, r: &ListingRecord) -> Self {
        Self {
            taken_at: snapshot.taken_at(),
            member_credit_days: snapshot.member_credit_days(),
            identity_key: Some(r.identity_key.clone()),
            name: r.name.clone(),
            area: r.area_name.clone(),
            address: r.address.clone(),
            housing_type: r.housing_type,
            floor: r.floor,
            living_space: r.living_space_sqm,
            rent: r.monthly_rent,
            move_in_date: r.move_in_date,
            best_bid: r.best_bid_days,
            applicants: r.applicant_count,
            closing_date: r.closing_date,
            link: r.listing_url.clone(),
        }
    }

    fn into_record(self) -> ListingRecord {
        let key = self
            .identity_key
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| identity_key(&self.address, self.housing_type, &self.name));
        ListingRecord {
            identity_key: key,
            name: self.name,
            area_name: self.area,
            address: self.address,
            housing_type: self.housing_type,
            floor: self.floor,
            living_space_sqm: self.living_space,
            monthly_rent: self.rent,
            move_in_date: self.move_in_date,
            best_bid_days: self.best_bid,
            applicant_count: self.applicants,
            closing_date: self.closing_date,
            listing_url: self.link,
            detail_fetched: false,
        }
    }
}

// ── Export ────────────────────────────────────────────────────────────────────

pub fn write_history_csv<W: Write>(history: &History, writer: W) -> Result<usize> {
    let mut out = csv::Writer::from_writer(writer);
    let mut rows = 0;
    for snapshot in history.snapshots() {
        for record in snapshot.records() {
            out.serialize(HistoryRow::from_record(snapshot, record))?;
            rows += 1;
        }
    }
    out.flush()?;
    Ok(rows)
}

pub fn export_history(history: &History, path: &Path) -> Result<usize> {
    let file = std::fs::File::create(path).with_context(|| format!("Cannot create {:?}", path))?;
    let rows = write_history_csv(history, file)?;
    info!(
        "Exported {} rows from {} snapshot(s) to {:?}",
        rows,
        history.snapshots().len(),
        path
    );
    Ok(rows)
}

// ── Import ────────────────────────────────────────────────────────────────────

/// Parse history rows into snapshots, oldest first. Malformed rows are
/// skipped with a warning.
pub fn read_history_csv<R: Read>(reader: R) -> Result<Vec<Snapshot>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut grouped: BTreeMap<NaiveDateTime, (Option<u32>, Vec<ListingRecord>)> = BTreeMap::new();

    for (i, result) in rdr.deserialize::<HistoryRow>().enumerate() {
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Row {}: {}", i + 1, e);
                continue;
            }
        };
        let entry = grouped.entry(row.taken_at).or_insert((None, Vec::new()));
        if entry.0.is_none() {
            entry.0 = row.member_credit_days;
        }
        entry.1.push(row.into_record());
    }

    let snapshots: Vec<Snapshot> = grouped
        .into_iter()
        .map(|(taken_at, (credit_days, records))| {
            debug!("{}: {} listings", taken_at, records.len());
            Snapshot::new(taken_at, credit_days, 0, records)
        })
        .collect();
    Ok(snapshots)
}

pub fn load_history_csv(path: &Path) -> Result<Vec<Snapshot>> {
    let file = std::fs::File::open(path).with_context(|| format!("Cannot open {:?}", path))?;
    let snapshots = read_history_csv(file).with_context(|| format!("Bad history file {:?}", path))?;
    info!("{:?}: {} snapshot(s) loaded", path, snapshots.len());
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::{at, record};

    #[test]
    fn exported_history_imports_back() {
        let mut a = record("Körsbärsvägen 4", "Unit A", HousingType::Studio);
        a.monthly_rent = Some(4500);
        a.best_bid_days = Some(812);
        a.closing_date = NaiveDate::from_ymd_opt(2024, 3, 15);
        let b = record("Forskarbacken 2", "Unit B", HousingType::Room);
        let history = History::from_snapshots(vec![
            Snapshot::new(at("2024-03-01"), Some(1000), 0, vec![a.clone(), b]),
            Snapshot::new(at("2024-03-02"), None, 0, vec![a]),
        ]);

        let mut buf = Vec::new();
        assert_eq!(write_history_csv(&history, &mut buf).unwrap(), 3);
        let imported = read_history_csv(buf.as_slice()).unwrap();

        assert_eq!(History::from_snapshots(imported), history);
    }

    #[test]
    fn missing_identity_key_is_recomputed_and_bad_rows_skipped() {
        let csv = "\
taken_at,member_credit_days,identity_key,name,area,address,type,floor,living_space,rent,move_in_date,best_bid,applicants,closing_date,link
2024-03-01T08:00:00,900,,Unit A,Lappis,Körsbärsvägen 4,studio,2,22.5,4500,2024-04-01,812,14,2024-03-15,
2024-03-01T08:00:00,900,,Unit B,Lappis,Körsbärsvägen 4,castle,,,,,,,,
2024-03-02T08:00:00,,x|room,Unit C,Strix,Strix 1,room,,,,,,,,
";
        let snapshots = read_history_csv(csv.as_bytes()).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].len(), 1);
        assert_eq!(snapshots[0].member_credit_days(), Some(900));
        let first = &snapshots[0].records()[0];
        assert_eq!(
            first.identity_key,
            identity_key("Körsbärsvägen 4", HousingType::Studio, "Unit A")
        );
        assert_eq!(first.living_space_sqm, Some(22.5));
        assert_eq!(snapshots[1].records()[0].identity_key, "x|room");
    }
}
