//! Folding a new snapshot into the stored history.

use crate::error::MergeError;
use crate::models::{History, Snapshot};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Keys not present in the previous latest snapshot.
    pub inserted: usize,
    /// Keys present in both.
    pub updated: usize,
    /// Keys of the previous latest snapshot that are gone now.
    pub no_longer_available: usize,
    /// Closing dates taken from history because the detail page was skipped.
    pub closing_dates_carried: usize,
}

#[derive(Debug, Clone)]
pub struct Merged {
    pub history: History,
    pub summary: MergeSummary,
}

/// Append `current` to `previous`.
///
/// A snapshot from the same calendar day as the latest one replaces it.
/// A snapshot older than the latest one is rejected. Listings whose detail
/// page could not be fetched this run keep their last known closing date.
pub fn merge(previous: &History, current: Snapshot) -> Result<Merged, MergeError> {
    let baseline = previous.latest();

    if let Some(latest) = baseline {
        if current.taken_at() < latest.taken_at() {
            return Err(MergeError::OutOfOrder {
                latest: latest.taken_at(),
                current: current.taken_at(),
            });
        }
    }

    let known = known_closing_dates(previous);
    let mut carried = 0;
    let records = current
        .records()
        .iter()
        .cloned()
        .map(|mut record| {
            if record.closing_date.is_none() && !record.detail_fetched {
                if let Some(&date) = known.get(&record.identity_key) {
                    debug!("{}: keeping closing date {} from history", record.identity_key, date);
                    record.closing_date = Some(date);
                    carried += 1;
                }
            }
            record
        })
        .collect();

    let snapshot = Snapshot::new(
        current.taken_at(),
        current.member_credit_days(),
        current.skipped_details(),
        records,
    );

    let mut summary = MergeSummary {
        closing_dates_carried: carried,
        ..MergeSummary::default()
    };
    match baseline {
        Some(base) => {
            let before: HashSet<&str> = base.records().iter().map(|r| r.identity_key.as_str()).collect();
            let now: HashSet<&str> = snapshot.records().iter().map(|r| r.identity_key.as_str()).collect();
            summary.updated = now.intersection(&before).count();
            summary.inserted = now.len() - summary.updated;
            summary.no_longer_available = before.difference(&now).count();
        }
        None => summary.inserted = snapshot.len(),
    }

    let mut history = previous.clone();
    if baseline.is_some_and(|b| b.date() == snapshot.date()) {
        info!("Replacing earlier snapshot of {}", snapshot.date());
    }
    history.push_or_replace(snapshot);

    Ok(Merged { history, summary })
}

/// Last closing date seen for each key, oldest snapshot first so that newer
/// values win.
fn known_closing_dates(history: &History) -> HashMap<String, NaiveDate> {
    let mut known = HashMap::new();
    for snapshot in history.snapshots() {
        for record in snapshot.records() {
            if let Some(date) = record.closing_date {
                known.insert(record.identity_key.clone(), date);
            }
        }
    }
    known
}
