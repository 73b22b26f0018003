//! Rendering listings and trends for the terminal or other tools.

use crate::models::ListingRecord;
use crate::trend::{ListingSeries, TrendPoint};
use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
}

/// Flat listing row with the exported field names.
#[derive(Debug, Clone, Serialize)]
pub struct ListingRow {
    pub name: String,
    pub area: String,
    pub address: String,
    #[serde(rename = "type")]
    pub housing_type: String,
    pub floor: Option<i32>,
    pub living_space: Option<f64>,
    pub rent: Option<u32>,
    pub move_in_date: Option<NaiveDate>,
    pub best_bid: Option<u32>,
    pub applicants: Option<u32>,
    pub closing_date: Option<NaiveDate>,
    pub link: Option<String>,
}

impl From<&ListingRecord> for ListingRow {
    fn from(r: &ListingRecord) -> Self {
        Self {
            name: r.name.clone(),
            area: r.area_name.clone(),
            address: r.address.clone(),
            housing_type: r.housing_type.to_string(),
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
}

#[derive(Serialize)]
struct ListingsDocument<'a> {
    timestamp: NaiveDateTime,
    total: usize,
    listings: &'a [ListingRow],
}

pub fn render_listings(
    records: &[ListingRecord],
    taken_at: NaiveDateTime,
    format: OutputFormat,
) -> Result<String> {
    let rows: Vec<ListingRow> = records.iter().map(ListingRow::from).collect();
    match format {
        OutputFormat::Table => Ok(listings_table(&rows)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&ListingsDocument {
            timestamp: taken_at,
            total: rows.len(),
            listings: &rows,
        })?),
        OutputFormat::Csv => to_csv(&rows),
    }
}

fn to_csv<T: Serialize>(rows: &[T]) -> Result<String> {
    let mut out = csv::Writer::from_writer(Vec::new());
    for row in rows {
        out.serialize(row)?;
    }
    let bytes = out.into_inner().map_err(|e| anyhow::anyhow!("csv flush: {}", e))?;
    Ok(String::from_utf8(bytes)?)
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

fn clip(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

fn listings_table(rows: &[ListingRow]) -> String {
    if rows.is_empty() {
        return "No listings match.\n".to_string();
    }
    let mut out = format!(
        "{:<28} {:<18} {:<10} {:>5} {:>6} {:>7} {:>8} {:>5} {:<10}\n",
        "Name", "Area", "Type", "Floor", "m²", "Rent", "Best bid", "Appl", "Closes"
    );
    out.push_str(&"-".repeat(104));
    out.push('\n');
    for r in rows {
        out.push_str(&format!(
            "{:<28} {:<18} {:<10} {:>5} {:>6} {:>7} {:>8} {:>5} {:<10}\n",
            clip(&r.name, 28),
            clip(&r.area, 18),
            r.housing_type,
            opt(r.floor),
            opt(r.living_space),
            opt(r.rent),
            opt(r.best_bid),
            opt(r.applicants),
            opt(r.closing_date),
        ));
    }
    out.push_str(&format!("\n{} listing(s)\n", rows.len()));
    out
}

// ── Trends ────────────────────────────────────────────────────────────────────

pub fn render_trend(points: &[TrendPoint], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Csv => to_csv(points),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(points)?),
        OutputFormat::Table => {
            if points.is_empty() {
                return Ok("No snapshots in the window.\n".to_string());
            }
            let mut out = format!(
                "{:<10} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
                "Date", "Listings", "Min", "Median", "Max", "Own"
            );
            for p in points {
                out.push_str(&format!(
                    "{:<10} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
                    p.date,
                    p.listings,
                    opt(p.min_best_bid),
                    opt(p.median_best_bid.map(|m| format!("{:.1}", m))),
                    opt(p.max_best_bid),
                    opt(p.member_credit_days),
                ));
            }
            Ok(out)
        }
    }
}

#[derive(Serialize)]
struct SeriesRow<'a> {
    date: NaiveDate,
    identity_key: &'a str,
    name: &'a str,
    best_bid: Option<u32>,
}

/// Long format: one row per listing per day.
pub fn render_series(series: &[ListingSeries], format: OutputFormat) -> Result<String> {
    let rows: Vec<SeriesRow<'_>> = series
        .iter()
        .flat_map(|s| {
            s.points.iter().map(move |&(date, best_bid)| SeriesRow {
                date,
                identity_key: &s.identity_key,
                name: &s.name,
                best_bid,
            })
        })
        .collect();

    match format {
        OutputFormat::Csv => to_csv(&rows),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&rows)?),
        OutputFormat::Table => {
            let mut out = String::new();
            for s in series {
                let bids: Vec<String> = s
                    .points
                    .iter()
                    .map(|(d, b)| format!("{} {}", d.format("%m-%d"), opt(*b)))
                    .collect();
                out.push_str(&format!("{:<28} {}\n", clip(&s.name, 28), bids.join("  ")));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HousingType;
    use crate::models::tests::{at, record};

    fn sample() -> Vec<ListingRecord> {
        let mut a = record("Körsbärsvägen 4", "Unit A", HousingType::Studio);
        a.monthly_rent = Some(4500);
        a.best_bid_days = Some(812);
        a.applicant_count = Some(14);
        a.closing_date = NaiveDate::from_ymd_opt(2024, 3, 15);
        vec![a, record("Forskarbacken 2", "Unit B", HousingType::Room)]
    }

    #[test]
    fn json_carries_timestamp_total_and_listings() {
        let out = render_listings(&sample(), at("2024-03-01"), OutputFormat::Json).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["total"], 2);
        assert_eq!(doc["timestamp"], "2024-03-01T08:00:00");
        assert_eq!(doc["listings"][0]["best_bid"], 812);
        assert_eq!(doc["listings"][0]["type"], "Studio");
        assert!(doc["listings"][1]["rent"].is_null());
    }

    #[test]
    fn csv_header_uses_export_field_names() {
        let out = render_listings(&sample(), at("2024-03-01"), OutputFormat::Csv).unwrap();
        let header = out.lines().next().unwrap();
        assert_eq!(
            header,
            "name,area,address,type,floor,living_space,rent,move_in_date,best_bid,applicants,closing_date,link"
        );
        assert_eq!(out.lines().count(), 3);
    }

    #[test]
    fn table_marks_unknown_values() {
        let out = render_listings(&sample(), at("2024-03-01"), OutputFormat::Table).unwrap();
        assert!(out.contains("Unit A"));
        assert!(out.contains("2024-03-15"));
        assert!(out.contains("2 listing(s)"));
        let empty = render_listings(&[], at("2024-03-01"), OutputFormat::Table).unwrap();
        assert_eq!(empty, "No listings match.\n");
    }

    #[test]
    fn trend_csv_has_one_row_per_day() {
        let points = vec![TrendPoint {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            listings: 3,
            min_best_bid: Some(10),
            median_best_bid: Some(20.0),
            max_best_bid: Some(30),
            member_credit_days: None,
        }];
        let out = render_trend(&points, OutputFormat::Csv).unwrap();
        let mut lines = out.lines();
        assert_eq!(
            lines.next(),
            Some("date,listings,min_best_bid,median_best_bid,max_best_bid,member_credit_days")
        );
        assert_eq!(lines.next(), Some("2024-03-01,3,10,20.0,30,"));
    }
}
