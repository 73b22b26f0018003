use crate::error::NormalizeError;
use crate::models::{HousingType, ListingRecord, RawListing, identity_key};
use chrono::NaiveDate;
use tracing::debug;

// ── Field parsers ─────────────────────────────────────────────────────────────

const UNIT_MARKERS: &[&str] = &["m²", "m2", "kvm", "sqm", "sek", "kr/mån", "kr", ":-"];

fn is_blank(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || s == "-" || s == "—" || s.eq_ignore_ascii_case("n/a")
}

/// Parse a decimal amount with thousand separators and unit markers.
/// "4 500 kr" → 4500.0 | "25,5 m²" → 25.5 | "4,500 SEK" → 4500.0
pub fn parse_amount(s: &str) -> Option<f64> {
    if is_blank(s) {
        return None;
    }
    let mut s = s.to_lowercase();
    for marker in UNIT_MARKERS {
        s = s.replace(marker, "");
    }
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let has_dot = cleaned.contains('.');
    let has_comma = cleaned.contains(',');
    let canonical = match (has_dot, has_comma) {
        (true, true) => {
            // The later separator is the decimal one.
            let decimal = if cleaned.rfind('.') > cleaned.rfind(',') { '.' } else { ',' };
            cleaned
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == decimal)
                .map(|c| if c == decimal { '.' } else { c })
                .collect()
        }
        (true, false) => resolve_single_separator(&cleaned, '.'),
        (false, true) => resolve_single_separator(&cleaned, ','),
        (false, false) => cleaned,
    };

    canonical.parse().ok()
}

/// A separator that only ever precedes groups of exactly three digits is a
/// thousands separator; otherwise it is the decimal mark.
fn resolve_single_separator(s: &str, sep: char) -> String {
    let groups: Vec<&str> = s.split(sep).collect();
    let thousands = groups.len() > 1
        && !groups[0].is_empty()
        && groups[1..].iter().all(|g| g.len() == 3);

    if thousands {
        groups.concat()
    } else if groups.len() == 2 {
        format!("{}.{}", groups[0], groups[1])
    } else {
        // "1.2.3" style garbage
        String::new()
    }
}

/// Monthly rent in whole currency units.
pub fn parse_rent(s: &str) -> Option<u32> {
    let v = parse_amount(s)?;
    if v.is_finite() && v >= 0.0 && v <= u32::MAX as f64 {
        Some(v.round() as u32)
    } else {
        None
    }
}

/// Living space in square metres; must be positive.
pub fn parse_living_space(s: &str) -> Option<f64> {
    parse_amount(s).filter(|v| v.is_finite() && *v > 0.0)
}

/// First non-negative integer in the text. "1234 (5 st)" → 1234
pub fn parse_count(s: &str) -> Option<u32> {
    let digits: String = s
        .trim()
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ' ' || *c == '\u{a0}' || *c == '\u{202f}')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Split "1234 (5 st)" into best bid and applicant count.
pub fn parse_queue_info(s: &str) -> (Option<u32>, Option<u32>) {
    match s.split_once('(') {
        Some((bid, rest)) => {
            let applicants = rest.split(')').next().and_then(parse_count);
            (parse_count(bid), applicants)
        }
        None => (parse_count(s), None),
    }
}

/// Floor number; ground floor spellings map to 0.
pub fn parse_floor(s: &str) -> Option<i32> {
    let t = s.trim().to_lowercase();
    if is_blank(&t) {
        return None;
    }
    if t == "bv" || t.starts_with("botten") || t.starts_with("ground") || t.starts_with("entr") {
        return Some(0);
    }
    let signed: String = t
        .chars()
        .skip_while(|c| !c.is_ascii_digit() && *c != '-')
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    signed.parse().ok()
}

/// Parse dates: ISO, day-first numeric, or "15 Jan 2024"; also finds an ISO
/// date embedded in longer text ("Application deadline 2024-01-15 at 12:00").
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if is_blank(s) {
        return None;
    }

    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%Y/%m/%d", "%d %b %Y", "%b %d, %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }

    find_iso_date(s)
}

/// Scan for the first `YYYY-MM-DD` substring that is a valid date.
pub fn find_iso_date(s: &str) -> Option<NaiveDate> {
    let bytes = s.as_bytes();
    if bytes.len() < 10 {
        return None;
    }
    (0..=bytes.len() - 10).find_map(|i| {
        let w = &bytes[i..i + 10];
        let shape = w.iter().enumerate().all(|(j, b)| match j {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
        if !shape {
            return None;
        }
        std::str::from_utf8(w)
            .ok()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    })
}

/// Map the portal's free-text type (Swedish or English) to a housing type.
pub fn parse_housing_type(s: &str) -> Option<HousingType> {
    let t = s.trim().to_lowercase();
    if let Some(kind) = [HousingType::Room, HousingType::Studio, HousingType::Apartment]
        .into_iter()
        .find(|k| t.eq_ignore_ascii_case(k.portal_code()))
    {
        return Some(kind);
    }

    if t.contains("studio") || t.contains("kokvrå") || t.contains("1 rok") || t.contains("1 rum och kök") {
        Some(HousingType::Studio)
    } else if t.contains("apartment")
        || t.contains("lägenhet")
        || t.contains("rok")
        || t.contains("rum och kök")
    {
        Some(HousingType::Apartment)
    } else if t.contains("room") || t.contains("korridor") || t.contains("rum") {
        Some(HousingType::Room)
    } else {
        None
    }
}

fn text(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

// ── RawListing → ListingRecord ────────────────────────────────────────────────

/// Normalise one scraped entry. Only a missing address or housing type
/// rejects the entry; every other unparseable field becomes unknown.
pub fn normalize(raw: &RawListing) -> Result<ListingRecord, NormalizeError> {
    let address = text(&raw.address).ok_or(NormalizeError::MissingAddress)?;
    let type_text = text(&raw.housing_type).ok_or(NormalizeError::MissingHousingType)?;
    let housing_type = parse_housing_type(type_text)
        .ok_or_else(|| NormalizeError::UnknownHousingType(type_text.to_string()))?;

    let area_name = text(&raw.area).unwrap_or_default().to_string();
    let name = match text(&raw.name) {
        Some(n) => n.to_string(),
        None if area_name.is_empty() => address.to_string(),
        None => format!("{} - {}", area_name, address),
    };

    let (best_bid_days, applicant_count) = text(&raw.queue_info)
        .map(parse_queue_info)
        .unwrap_or((None, None));

    let record = ListingRecord {
        identity_key: identity_key(address, housing_type, text(&raw.name).unwrap_or_default()),
        name,
        area_name,
        address: address.to_string(),
        housing_type,
        floor: text(&raw.floor).and_then(parse_floor),
        living_space_sqm: text(&raw.living_space).and_then(parse_living_space),
        monthly_rent: text(&raw.rent).and_then(parse_rent),
        move_in_date: text(&raw.move_in_date).and_then(parse_date),
        best_bid_days,
        applicant_count,
        closing_date: None,
        listing_url: text(&raw.link).map(str::to_string),
        detail_fetched: false,
    };

    debug!("normalised {} → {}", record.name, record.identity_key);
    Ok(record)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
