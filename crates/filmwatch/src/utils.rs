use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::types::SeenRecord;

#[derive(Debug, Default)]
pub struct RecordFilter {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl RecordFilter {
    fn covers(&self, day: NaiveDate) -> bool {
        self.since.is_none_or(|since| day >= since) && self.until.is_none_or(|until| day <= until)
    }

    /// Keeps records first seen within the date range, then pages through them.
    /// An offset of 0 skips nothing.
    pub fn apply(self, records: Vec<SeenRecord>) -> Vec<SeenRecord> {
        records
            .into_iter()
            .filter(|r| self.covers(r.first_seen.date_naive()))
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn validate(self) -> Result<Self, String> {
        if let Some(since) = self.since
            && let Some(until) = self.until
            && since > until
        {
            return Err(format!(
                "Since date ({since}) cannot be after until date ({until})"
            ));
        }
        if self.limit == Some(0) {
            return Err("Limit must be greater than 0".to_string());
        }
        Ok(self)
    }
}

#[derive(Debug)]
pub struct RecordStats {
    pub total: usize,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub per_day: BTreeMap<NaiveDate, usize>,
}

impl RecordStats {
    pub fn from_records(records: &[SeenRecord]) -> RecordStats {
        let mut per_day = BTreeMap::new();
        for record in records {
            *per_day.entry(record.first_seen.date_naive()).or_insert(0) += 1;
        }
        RecordStats {
            total: records.len(),
            earliest: records.iter().map(|r| r.first_seen).min(),
            latest: records.iter().map(|r| r.first_seen).max(),
            per_day,
        }
    }
}

impl std::fmt::Display for RecordStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\nStatistics:")?;
        if let (Some(earliest), Some(latest)) = (self.earliest, self.latest) {
            writeln!(f, "  First seen from: {}", earliest.format("%Y-%m-%d %H:%M"))?;
            writeln!(f, "  First seen to:   {}", latest.format("%Y-%m-%d %H:%M"))?;
        }
        writeln!(f, "  Days with new slugs: {}", self.per_day.len())?;
        if let Some((day, count)) = self.per_day.iter().max_by_key(|(_, count)| **count) {
            writeln!(f, "  Busiest day:         {} ({})", day, count)?;
        }
        writeln!(f, "  Total:               {}", self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(slug: &str, day: u32, hour: u32) -> SeenRecord {
        SeenRecord::new(slug, Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).unwrap())
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn sample() -> Vec<SeenRecord> {
        vec![
            record("a", 1, 6),
            record("b", 1, 18),
            record("c", 2, 6),
            record("d", 4, 6),
            record("e", 4, 12),
            record("f", 4, 18),
        ]
    }

    #[test]
    fn test_filter_by_date_range_is_inclusive() {
        let filter = RecordFilter {
            since: Some(date(2)),
            until: Some(date(4)),
            ..Default::default()
        };
        let slugs: Vec<_> = filter.apply(sample()).into_iter().map(|r| r.slug).collect();
        assert_eq!(slugs, vec!["c", "d", "e", "f"]);
    }

    #[test]
    fn test_filter_offset_and_limit() {
        let filter = RecordFilter {
            offset: Some(1),
            limit: Some(2),
            ..Default::default()
        };
        let slugs: Vec<_> = filter.apply(sample()).into_iter().map(|r| r.slug).collect();
        assert_eq!(slugs, vec!["b", "c"]);
    }

    #[test]
    fn test_zero_offset_skips_nothing() {
        let filter = RecordFilter {
            offset: Some(0),
            limit: Some(2),
            ..Default::default()
        }
        .validate()
        .unwrap();
        let slugs: Vec<_> = filter.apply(sample()).into_iter().map(|r| r.slug).collect();
        assert_eq!(slugs, vec!["a", "b"]);
    }

    #[test]
    fn test_validate_rejects_bad_filters() {
        let inverted = RecordFilter {
            since: Some(date(5)),
            until: Some(date(1)),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let zero_limit = RecordFilter {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(
            zero_limit.validate().unwrap_err(),
            "Limit must be greater than 0"
        );

        assert!(RecordFilter::default().validate().is_ok());
    }

    #[test]
    fn test_stats() {
        let stats = RecordStats::from_records(&sample());
        assert_eq!(stats.total, 6);
        assert_eq!(stats.earliest, Some(record("a", 1, 6).first_seen));
        assert_eq!(stats.latest, Some(record("f", 4, 18).first_seen));
        assert_eq!(stats.per_day.get(&date(4)), Some(&3));
        assert_eq!(stats.per_day.len(), 3);

        let text = stats.to_string();
        assert!(text.contains("Busiest day:         2025-06-04 (3)"), "{text}");
    }

    #[test]
    fn test_stats_empty() {
        let stats = RecordStats::from_records(&[]);
        assert_eq!(stats.total, 0);
        assert!(stats.earliest.is_none());
        assert!(!stats.to_string().contains("Busiest"));
    }
}
