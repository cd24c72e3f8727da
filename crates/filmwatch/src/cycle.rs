use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::source::{ObservationSource, SourceError};
use crate::tracker::NoveltyTracker;
use crate::types::{Film, SeenRecord, merge_observations, rank_films};

/// One externally triggered run of the scrape routine.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeCycle {
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub observed: usize,
    /// One entry per slug, highest rated first.
    pub films: Vec<Film>,
    /// Records this cycle inserted, as stored.
    pub new_records: Vec<SeenRecord>,
    /// `false` when the store could not be used and the cycle ran without it.
    pub novelty_detection: bool,
}

impl CycleReport {
    pub fn distinct(&self) -> usize {
        self.films.len()
    }

    pub fn is_new(&self, slug: &str) -> bool {
        self.new_records.iter().any(|r| r.slug == slug)
    }
}

impl ScrapeCycle {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self { started_at }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Merges the source's observations per slug and feeds one candidate per
    /// slug to `tracker`.
    ///
    /// A failing or empty source fails the cycle. A missing or failing tracker is
    /// logged and the cycle completes with novelty detection turned off.
    pub async fn run<S: ObservationSource + ?Sized>(
        &self,
        tracker: Option<&NoveltyTracker>,
        source: &mut S,
    ) -> Result<CycleReport, SourceError> {
        let observations = source.observations()?;
        if observations.is_empty() {
            return Err(SourceError::NoObservations);
        }
        let observed = observations.len();

        let mut films = merge_observations(observations, self.started_at);
        log::info!(
            "Cycle {}: {} observation(s), {} unique film(s)",
            self.started_at.format("%Y-%m-%d %H:%M"),
            observed,
            films.len()
        );

        let candidates: Vec<SeenRecord> = films
            .iter()
            .map(|f| SeenRecord::new(f.slug.clone(), f.observed_at))
            .collect();
        rank_films(&mut films);

        let mut report = CycleReport {
            started_at: self.started_at,
            observed,
            films,
            new_records: Vec::new(),
            novelty_detection: false,
        };

        let Some(tracker) = tracker else {
            log::warn!("Seen store unavailable; skipping novelty detection");
            return Ok(report);
        };

        match tracker.record_all(&candidates).await {
            Ok(new_records) => {
                for record in &new_records {
                    log::info!("New: {}", record.slug);
                }
                report.new_records = new_records;
                report.novelty_detection = true;
            }
            Err(e) => log::warn!("Skipping novelty detection: {e}"),
        }

        Ok(report)
    }
}

impl Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Cycle {}: {} observation(s), {} unique film(s)",
            self.started_at.format("%Y-%m-%d %H:%M"),
            self.observed,
            self.distinct()
        )?;
        for film in &self.films {
            let marker = if self.is_new(&film.slug) { "+" } else { " " };
            writeln!(f, "  {marker} {film}")?;
        }
        if !self.novelty_detection {
            return writeln!(f, "Novelty detection skipped (seen store unavailable)");
        }
        match self.new_records.len() {
            0 => writeln!(f, "No new films."),
            n => writeln!(f, "{n} new film(s)."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VecSource;
    use crate::types::Observation;
    use chrono::{NaiveDate, TimeZone};

    struct FailingSource;

    impl ObservationSource for FailingSource {
        fn observations(&mut self) -> Result<Vec<Observation>, SourceError> {
            Err(SourceError::EmptySlug(1))
        }
    }

    fn cycle_at(hour: u32) -> ScrapeCycle {
        ScrapeCycle::new(Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_cycles_report_only_new_slugs() {
        let tracker = NoveltyTracker::open_in_memory().await.unwrap();

        let mut first = VecSource(vec![Observation::new("sinners"), Observation::new("flow")]);
        let report = cycle_at(6).run(Some(&tracker), &mut first).await.unwrap();
        assert!(report.novelty_detection);
        assert_eq!(report.new_records.len(), 2);

        let mut second = VecSource(vec![
            Observation::new("flow"),
            Observation::new("conclave"),
            Observation::new("conclave"),
        ]);
        let report = cycle_at(12).run(Some(&tracker), &mut second).await.unwrap();
        assert_eq!(report.observed, 3);
        assert_eq!(report.distinct(), 2);
        assert_eq!(
            report.new_records,
            vec![SeenRecord::new(
                "conclave",
                Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
            )]
        );
        assert!(report.is_new("conclave"));
        assert!(!report.is_new("flow"));

        let flow = tracker.get("flow").await.unwrap().unwrap();
        assert_eq!(flow.first_seen, cycle_at(6).started_at());
    }

    #[tokio::test]
    async fn test_new_records_match_store_at_nanosecond_precision() {
        let tracker = NoveltyTracker::open_in_memory().await.unwrap();
        let started = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let cycle = ScrapeCycle::new(started);

        let mut source = VecSource(vec![Observation::new("b")]);
        let report = cycle.run(Some(&tracker), &mut source).await.unwrap();

        let since = tracker.seen_since(cycle.started_at()).await.unwrap();
        assert_eq!(since, report.new_records);
        assert_eq!(tracker.list_all().await.unwrap(), report.new_records);
        assert_eq!(report.new_records[0].first_seen, started);
    }

    #[tokio::test]
    async fn test_per_theater_listings_merge_into_films() {
        let tracker = NoveltyTracker::open_in_memory().await.unwrap();
        let june = |d| NaiveDate::from_ymd_opt(2025, 6, d).unwrap();

        let mut source = VecSource(vec![
            Observation::from_title("Elio").in_theater("Pathé Spuimarkt").next(june(20)),
            Observation::from_title("Sinners").in_theater("Pathé Buitenhof").rated(7.8),
            Observation::from_title("Elio").in_theater("Pathé Ypenburg").next(june(18)),
            Observation::from_title("Sinners").in_theater("Pathé Scheveningen"),
        ]);
        let report = cycle_at(6).run(Some(&tracker), &mut source).await.unwrap();

        assert_eq!(report.observed, 4);
        assert_eq!(report.distinct(), 2);
        assert_eq!(report.new_records.len(), 2);

        let sinners = &report.films[0];
        assert_eq!(sinners.slug, "sinners");
        assert_eq!(sinners.theaters.len(), 2);
        assert_eq!(sinners.rating, Some(7.8));

        let elio = &report.films[1];
        assert_eq!(elio.title.as_deref(), Some("Elio"));
        assert_eq!(elio.next, Some(june(18)));
        assert_eq!(elio.theaters.len(), 2);

        let text = report.to_string();
        assert!(text.contains("+  7.8  Sinners"), "{text}");
        assert!(text.contains("2 new film(s)."), "{text}");
    }

    #[tokio::test]
    async fn test_explicit_observed_at_overrides_cycle_time() {
        let tracker = NoveltyTracker::open_in_memory().await.unwrap();
        let seen = Utc.with_ymd_and_hms(2025, 5, 31, 23, 45, 0).unwrap();

        let mut source = VecSource(vec![Observation::new("anora").at(seen)]);
        cycle_at(6).run(Some(&tracker), &mut source).await.unwrap();

        assert_eq!(tracker.get("anora").await.unwrap().unwrap().first_seen, seen);
    }

    #[tokio::test]
    async fn test_missing_tracker_is_not_fatal() {
        let mut source = VecSource(vec![Observation::new("wicked")]);
        let report = cycle_at(6).run(None, &mut source).await.unwrap();

        assert!(!report.novelty_detection);
        assert!(report.new_records.is_empty());
        assert_eq!(report.observed, 1);
        assert_eq!(report.films.len(), 1);
        assert!(report.to_string().contains("skipped"));
    }

    #[tokio::test]
    async fn test_closed_tracker_is_not_fatal() {
        let tracker = NoveltyTracker::open_in_memory().await.unwrap();
        tracker.close().await;

        let mut source = VecSource(vec![Observation::new("wicked")]);
        let report = cycle_at(6).run(Some(&tracker), &mut source).await.unwrap();

        assert!(!report.novelty_detection);
        assert!(report.new_records.is_empty());
    }

    #[tokio::test]
    async fn test_source_error_fails_cycle() {
        let tracker = NoveltyTracker::open_in_memory().await.unwrap();
        let result = cycle_at(6).run(Some(&tracker), &mut FailingSource).await;

        assert!(matches!(result, Err(SourceError::EmptySlug(1))));
        assert_eq!(tracker.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_cycle_fails() {
        let tracker = NoveltyTracker::open_in_memory().await.unwrap();
        let result = cycle_at(6).run(Some(&tracker), &mut VecSource::default()).await;

        assert!(matches!(result, Err(SourceError::NoObservations)));
    }

    #[test]
    fn test_report_display() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).unwrap();
        let films = merge_observations(
            vec![Observation::new("flow").rated(7.9), Observation::new("elio")],
            at,
        );
        let report = CycleReport {
            started_at: at,
            observed: 4,
            films,
            new_records: vec![SeenRecord::new("flow", at)],
            novelty_detection: true,
        };

        let text = report.to_string();
        assert!(text.starts_with("Cycle 2025-06-01 06:00: 4 observation(s), 2 unique film(s)"));
        assert!(text.contains("  +  7.9  flow"), "{text}");
        assert!(text.contains("     n/a  elio"), "{text}");
        assert!(text.contains("1 new film(s)."));
    }
}
