//! Domain-specific shared validations and formatting utilities

use chrono::{SecondsFormat, Utc};

use crate::domain::catalog::{CatalogError, Movie};

pub const MIN_YEAR: i32 = 1878;
pub const MAX_YEAR: i32 = 3000;

pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn normalize_title(title: &str, empty_message: &'static str) -> Result<String, CatalogError> {
    let normalized = title.trim();
    if normalized.is_empty() {
        return Err(CatalogError::InvalidInput(empty_message.to_string()));
    }
    Ok(normalized.to_string())
}

pub fn validate_year(year: i32) -> Result<i32, CatalogError> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(CatalogError::InvalidInput("year looks invalid.".to_string()));
    }
    Ok(year)
}

/// Trims, drops empty entries and removes case-insensitive duplicates while
/// keeping the first spelling.
pub fn normalize_genres(genres: Option<Vec<String>>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    genres
        .unwrap_or_default()
        .into_iter()
        .map(|genre| genre.trim().to_string())
        .filter(|genre| !genre.is_empty())
        .filter(|genre| seen.insert(genre.to_lowercase()))
        .collect()
}

pub fn normalize_director(director: Option<String>) -> Option<String> {
    director
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn sort_movies(movies: &mut [Movie]) {
    movies.sort_by(|left, right| {
        left.title
            .to_lowercase()
            .cmp(&right.title.to_lowercase())
            .then(left.year.cmp(&right.year))
            .then_with(|| left.id.cmp(&right.id))
    });
}

fn normalize_needle(value: Option<&str>) -> Option<String> {
    value
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Default, Clone)]
pub struct MovieFilter {
    query: Option<String>,
    year: Option<i32>,
    genre: Option<String>,
    director: Option<String>,
    pub only_available: bool,
}

impl MovieFilter {
    pub fn new(
        query: Option<&str>,
        year: Option<i32>,
        genre: Option<&str>,
        director: Option<&str>,
        only_available: bool,
    ) -> Self {
        Self {
            query: normalize_needle(query),
            year,
            genre: normalize_needle(genre),
            director: normalize_needle(director),
            only_available,
        }
    }

    pub fn matches(&self, movie: &Movie) -> bool {
        if self.only_available && movie.borrowed {
            return false;
        }
        if let Some(query) = &self.query {
            if !movie.title.to_lowercase().contains(query) {
                return false;
            }
        }
        if self.year.is_some_and(|year| year != movie.year) {
            return false;
        }
        if let Some(genre) = &self.genre {
            if !movie.genres.iter().any(|candidate| candidate.to_lowercase() == *genre) {
                return false;
            }
        }
        if let Some(director) = &self.director {
            let Some(name) = &movie.director else {
                return false;
            };
            if !name.to_lowercase().contains(director) {
                return false;
            }
        }
        true
    }
}
