//! Predicate filtering over normalised listings.

use crate::models::{HousingType, ListingRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TypeFilter {
    Room,
    Studio,
    Apartment,
    #[default]
    All,
}

impl TypeFilter {
    pub fn matches(&self, kind: HousingType) -> bool {
        self.housing_type().is_none_or(|t| t == kind)
    }

    pub fn housing_type(&self) -> Option<HousingType> {
        match self {
            TypeFilter::All => None,
            TypeFilter::Room => Some(HousingType::Room),
            TypeFilter::Studio => Some(HousingType::Studio),
            TypeFilter::Apartment => Some(HousingType::Apartment),
        }
    }
}

/// Conjunction of the supported predicates. The default matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pub housing_type: TypeFilter,
    /// Excludes listings whose rent is known and above the limit.
    pub max_rent: Option<u32>,
    /// Case-insensitive substring of the area name.
    pub area: Option<String>,
}

impl FilterSet {
    pub fn of_type(kind: TypeFilter) -> Self {
        Self {
            housing_type: kind,
            ..Self::default()
        }
    }

    pub fn max_rent(limit: u32) -> Self {
        Self {
            max_rent: Some(limit),
            ..Self::default()
        }
    }

    pub fn area(needle: impl Into<String>) -> Self {
        Self {
            area: Some(needle.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ListingRecord) -> bool {
        if !self.housing_type.matches(record.housing_type) {
            return false;
        }
        if let (Some(limit), Some(rent)) = (self.max_rent, record.monthly_rent) {
            if rent > limit {
                return false;
            }
        }
        if let Some(needle) = &self.area {
            let needle = needle.to_lowercase();
            if !record.area_name.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// Records matching every predicate in `filters`, in input order.
pub fn filter(records: &[ListingRecord], filters: &FilterSet) -> Vec<ListingRecord> {
    records
        .iter()
        .filter(|r| filters.matches(r))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::record;

    fn sample() -> Vec<ListingRecord> {
        let mut a = record("Street 1", "Unit A", HousingType::Apartment);
        a.monthly_rent = Some(4500);
        a.area_name = "Lappis".into();
        let mut b = record("Street 2", "Unit B", HousingType::Room);
        b.monthly_rent = Some(6000);
        b.area_name = "Kungshamra".into();
        let mut c = record("Street 3", "Unit C", HousingType::Apartment);
        c.monthly_rent = Some(7200);
        c.area_name = "Lappis".into();
        let mut d = record("Street 4", "Unit D", HousingType::Apartment);
        d.monthly_rent = None;
        d.area_name = "Strix".into();
        vec![a, b, c, d]
    }

    fn names(records: &[ListingRecord]) -> Vec<&str> {
        records.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn empty_filter_keeps_everything_in_order() {
        let records = sample();
        assert_eq!(filter(&records, &FilterSet::default()), records);
    }

    #[test]
    fn type_filter_restricts_housing_type() {
        let out = filter(&sample(), &FilterSet::of_type(TypeFilter::Apartment));
        assert_eq!(names(&out), vec!["Unit A", "Unit C", "Unit D"]);
        let out = filter(&sample(), &FilterSet::of_type(TypeFilter::Studio));
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_rent_is_never_excluded() {
        for limit in [0, 1, 4500, 5000, u32::MAX] {
            let out = filter(&sample(), &FilterSet::max_rent(limit));
            assert!(out.iter().any(|r| r.name == "Unit D"), "limit {}", limit);
        }
        let out = filter(&sample(), &FilterSet::max_rent(5000));
        assert_eq!(names(&out), vec!["Unit A", "Unit D"]);
    }

    #[test]
    fn area_match_is_case_insensitive_substring() {
        let out = filter(&sample(), &FilterSet::area("lapp"));
        assert_eq!(names(&out), vec!["Unit A", "Unit C"]);
        let out = filter(&sample(), &FilterSet::area("HAMRA"));
        assert_eq!(names(&out), vec!["Unit B"]);
    }

    #[test]
    fn filters_compose_by_conjunction() {
        let records = sample();
        let stepwise = filter(
            &filter(&records, &FilterSet::of_type(TypeFilter::Apartment)),
            &FilterSet::max_rent(5000),
        );
        let combined = FilterSet {
            housing_type: TypeFilter::Apartment,
            max_rent: Some(5000),
            area: None,
        };
        assert_eq!(stepwise, filter(&records, &combined));
        assert_eq!(names(&stepwise), vec!["Unit A", "Unit D"]);
    }
}
