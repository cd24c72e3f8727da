use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Storage format for `first_seen`. Fixed width so that text order is time order,
/// and nanosecond precision so that a stored value reads back unchanged.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

static RE_SLUG_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\p{Alphabetic}\p{Nd}]+").expect("invalid regex: slug separator")
});

/// The first time a slug was observed. Never updated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub slug: String,
    pub first_seen: DateTime<Utc>,
}

impl SeenRecord {
    pub fn new(slug: impl Into<String>, first_seen: DateTime<Utc>) -> Self {
        Self {
            slug: slug.into(),
            first_seen,
        }
    }
}

impl Display for SeenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} — {}",
            self.first_seen.format("%Y-%m-%d %H:%M"),
            self.slug
        )
    }
}

/// One item seen by a scrape cycle, usually one film as listed by one theater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub theaters: BTreeSet<String>,
    /// Release date of an upcoming film.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    /// Filled in with the cycle timestamp when the scrape routine leaves it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl Observation {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            title: None,
            theaters: BTreeSet::new(),
            next: None,
            rating: None,
            observed_at: None,
        }
    }

    pub fn from_title(title: &str) -> Self {
        Self {
            title: Some(title.trim().to_string()),
            ..Self::new(slugify(title))
        }
    }

    pub fn at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = Some(observed_at);
        self
    }

    pub fn in_theater(mut self, theater: impl Into<String>) -> Self {
        self.theaters.insert(theater.into());
        self
    }

    pub fn next(mut self, next: NaiveDate) -> Self {
        self.next = Some(next);
        self
    }

    pub fn rated(mut self, rating: f64) -> Self {
        self.rating = Some(rating);
        self
    }
}

/// Every observation of one slug within a cycle, merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Film {
    pub slug: String,
    pub title: Option<String>,
    pub theaters: BTreeSet<String>,
    /// Earliest upcoming release date across theaters.
    pub next: Option<NaiveDate>,
    pub rating: Option<f64>,
    /// Earliest observation of the slug in the cycle.
    pub observed_at: DateTime<Utc>,
}

impl Film {
    fn from_observation(obs: Observation, default_at: DateTime<Utc>) -> Self {
        Self {
            observed_at: obs.observed_at.unwrap_or(default_at),
            slug: obs.slug,
            title: obs.title,
            theaters: obs.theaters,
            next: obs.next,
            rating: obs.rating,
        }
    }

    fn absorb(&mut self, obs: Observation, default_at: DateTime<Utc>) {
        if self.title.is_none() {
            self.title = obs.title;
        }
        self.theaters.extend(obs.theaters);
        self.next = match (self.next, obs.next) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if self.rating.is_none() {
            self.rating = obs.rating;
        }
        self.observed_at = self.observed_at.min(obs.observed_at.unwrap_or(default_at));
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.slug)
    }
}

impl Display for Film {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.rating {
            Some(rating) => write!(f, "{rating:>4.1}")?,
            None => write!(f, " n/a")?,
        }
        write!(f, "  {}", self.display_title())?;
        if !self.theaters.is_empty() {
            let theaters = self.theaters.iter().cloned().collect::<Vec<_>>();
            write!(f, " • {}", theaters.join(", "))?;
        }
        if let Some(next) = self.next {
            write!(f, " (from {})", next.format("%d-%m-%Y"))?;
        }
        Ok(())
    }
}

/// Merges observations into one [`Film`] per slug, in order of first appearance.
///
/// Theater sets are unioned and the earliest `next` date wins. Title and rating
/// come from the first observation that has one.
pub fn merge_observations(
    observations: Vec<Observation>,
    default_at: DateTime<Utc>,
) -> Vec<Film> {
    let mut films: Vec<Film> = Vec::new();
    for obs in observations {
        match films.iter_mut().find(|f| f.slug == obs.slug) {
            Some(film) => film.absorb(obs, default_at),
            None => films.push(Film::from_observation(obs, default_at)),
        }
    }
    films
}

/// Orders films by rating, highest first. Unrated films go last; ties keep their order.
pub fn rank_films(films: &mut [Film]) {
    films.sort_by(|a, b| match (a.rating, b.rating) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Lowercases `text` and collapses every run of non-alphanumeric characters into `-`.
///
/// ```
/// assert_eq!(filmwatch::types::slugify("Dune: Part Two"), "dune-part-two");
/// ```
pub fn slugify(text: &str) -> String {
    RE_SLUG_SEPARATOR
        .replace_all(&text.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses a stored `first_seen`. Rows written by older tooling may use RFC 3339 or
/// a plain `YYYY-MM-DD HH:MM:SS`, both of which are read as UTC.
pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT) {
        return Some(naive.and_utc());
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}
