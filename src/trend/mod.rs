//! Per-day competition statistics over a trailing window.

use crate::models::{History, Snapshot};
use chrono::{Duration, NaiveDate};
use serde::Serialize;

/// Best-bid distribution of one day's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub listings: usize,
    pub min_best_bid: Option<u32>,
    pub median_best_bid: Option<f64>,
    pub max_best_bid: Option<u32>,
    /// The member's own credit days that day, for comparison.
    pub member_credit_days: Option<u32>,
}

/// One listing's best bid across the window.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingSeries {
    pub identity_key: String,
    pub name: String,
    pub points: Vec<(NaiveDate, Option<u32>)>,
}

/// First day of a `window_days` window ending at the latest snapshot.
fn window_start(history: &History, window_days: u32) -> Option<NaiveDate> {
    if window_days == 0 {
        return None;
    }
    let latest = history.latest()?.date();
    Some(latest - Duration::days(i64::from(window_days) - 1))
}

fn in_window(history: &History, window_days: u32) -> impl Iterator<Item = &Snapshot> {
    let start = window_start(history, window_days);
    history
        .snapshots()
        .iter()
        .filter(move |s| start.is_some_and(|d| s.date() >= d))
}

/// One point per day that has a snapshot, oldest first.
///
/// The window is anchored at the most recent snapshot's date and includes it;
/// days without a snapshot are absent rather than zero.
pub fn aggregate(history: &History, window_days: u32) -> Vec<TrendPoint> {
    in_window(history, window_days).map(point_for).collect()
}

fn point_for(snapshot: &Snapshot) -> TrendPoint {
    let mut bids: Vec<u32> = snapshot.records().iter().filter_map(|r| r.best_bid_days).collect();
    bids.sort_unstable();

    TrendPoint {
        date: snapshot.date(),
        listings: snapshot.len(),
        min_best_bid: bids.first().copied(),
        median_best_bid: median(&bids),
        max_best_bid: bids.last().copied(),
        member_credit_days: snapshot.member_credit_days(),
    }
}

fn median(sorted: &[u32]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    if n % 2 == 1 {
        Some(f64::from(sorted[mid]))
    } else {
        Some((f64::from(sorted[mid - 1]) + f64::from(sorted[mid])) / 2.0)
    }
}

/// Best bid per listing per day, for listings seen in the window. Listings
/// are ordered by first appearance; a day a listing was absent is skipped.
pub fn listing_series(history: &History, window_days: u32) -> Vec<ListingSeries> {
    let mut series: Vec<ListingSeries> = Vec::new();

    for snapshot in in_window(history, window_days) {
        for record in snapshot.records() {
            let point = (snapshot.date(), record.best_bid_days);
            match series.iter_mut().find(|s| s.identity_key == record.identity_key) {
                Some(existing) => {
                    existing.name = record.name.clone();
                    existing.points.push(point);
                }
                None => series.push(ListingSeries {
                    identity_key: record.identity_key.clone(),
                    name: record.name.clone(),
                    points: vec![point],
                }),
            }
        }
    }

    series
}
