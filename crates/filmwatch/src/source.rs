use std::collections::BTreeSet;
use std::io::Read;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::types::{Observation, slugify};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to read observations: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid observation JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Observation #{0} has no usable slug or title")]
    EmptySlug(usize),
    #[error("Scrape routine returned no observations")]
    NoObservations,
}

/// Where a scrape cycle gets its observations from.
pub trait ObservationSource {
    fn observations(&mut self) -> Result<Vec<Observation>, SourceError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawObservation {
    Slug(String),
    Entry {
        #[serde(default)]
        slug: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        theaters: BTreeSet<String>,
        #[serde(default)]
        next: Option<NaiveDate>,
        #[serde(default)]
        rating: Option<f64>,
        #[serde(default)]
        observed_at: Option<DateTime<Utc>>,
    },
}

impl RawObservation {
    fn into_observation(self, index: usize) -> Result<Observation, SourceError> {
        let (slug, title, theaters, next, rating, observed_at) = match self {
            RawObservation::Slug(slug) => (Some(slug), None, BTreeSet::new(), None, None, None),
            RawObservation::Entry {
                slug,
                title,
                theaters,
                next,
                rating,
                observed_at,
            } => (slug, title, theaters, next, rating, observed_at),
        };

        let slug = match (slug, &title) {
            (Some(slug), _) if !slug.trim().is_empty() => slug.trim().to_string(),
            (_, Some(title)) => slugify(title),
            _ => String::new(),
        };
        if slug.is_empty() {
            return Err(SourceError::EmptySlug(index));
        }

        Ok(Observation {
            slug,
            title: title.map(|t| t.trim().to_string()),
            theaters: theaters
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            next,
            rating,
            observed_at,
        })
    }
}

/// Reads a JSON array of observations.
///
/// Each element is either a bare slug string or an object with `slug` and/or
/// `title`, plus optional `theaters`, `next` (`YYYY-MM-DD`), `rating` and an
/// RFC 3339 `observed_at`. A missing slug is derived from the title.
pub struct JsonSource<R> {
    reader: R,
}

impl<R: Read> JsonSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read> ObservationSource for JsonSource<R> {
    fn observations(&mut self) -> Result<Vec<Observation>, SourceError> {
        let mut text = String::new();
        self.reader.read_to_string(&mut text)?;

        let raw: Vec<RawObservation> = serde_json::from_str(&text)?;
        let observations = raw
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.into_observation(i + 1))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!("Read {} observation(s) from JSON", observations.len());
        Ok(observations)
    }
}

/// Observations already in memory.
#[derive(Debug, Default, Clone)]
pub struct VecSource(pub Vec<Observation>);

impl ObservationSource for VecSource {
    fn observations(&mut self) -> Result<Vec<Observation>, SourceError> {
        Ok(std::mem::take(&mut self.0))
    }
}
