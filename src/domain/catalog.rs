use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::utils::{
    normalize_director, normalize_genres, normalize_title, now_utc, sort_movies, validate_year,
};
use crate::errors::HandlerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    pub id: String,
    pub title: String,
    pub year: i32,
    pub genres: Vec<String>,
    pub director: Option<String>,
    pub borrowed: bool,
    pub borrowed_by: Option<String>,
    pub borrowed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewMovie {
    pub title: String,
    pub year: i32,
    pub genres: Option<Vec<String>>,
    pub director: Option<String>,
}

/// Fields left `None` are unchanged. An empty `director` clears it.
#[derive(Debug, Clone, Default)]
pub struct MovieUpdate {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub genres: Option<Vec<String>>,
    pub director: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Movie not found: {0}")]
    NotFound(String),
    #[error("Movie is already borrowed by {0}.")]
    AlreadyBorrowed(String),
    #[error("Movie is not borrowed.")]
    NotBorrowed,
}

impl From<CatalogError> for HandlerError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::InvalidInput(message) => HandlerError::InvalidArguments(message),
            other => HandlerError::Failed(other.to_string()),
        }
    }
}

#[async_trait]
pub trait MovieCatalog: Send + Sync {
    async fn add(&self, movie: NewMovie) -> Result<Movie, CatalogError>;
    async fn get(&self, id: &str) -> Result<Movie, CatalogError>;
    /// All movies, or only the ones not borrowed, in display order.
    async fn list(&self, only_available: bool) -> Result<Vec<Movie>, CatalogError>;
    async fn update(&self, id: &str, update: MovieUpdate) -> Result<Movie, CatalogError>;
    async fn delete(&self, id: &str) -> Result<(), CatalogError>;
    async fn borrow(&self, id: &str, borrower: &str) -> Result<Movie, CatalogError>;
    async fn return_movie(&self, id: &str) -> Result<Movie, CatalogError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    movies: RwLock<HashMap<String, Movie>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn require<'a>(movies: &'a mut HashMap<String, Movie>, id: &str) -> Result<&'a mut Movie, CatalogError> {
    movies
        .get_mut(id)
        .ok_or_else(|| CatalogError::NotFound(id.to_string()))
}

#[async_trait]
impl MovieCatalog for InMemoryCatalog {
    async fn add(&self, movie: NewMovie) -> Result<Movie, CatalogError> {
        let title = normalize_title(&movie.title, "title is required.")?;
        let year = validate_year(movie.year)?;
        let now = now_utc();
        let record = Movie {
            id: Uuid::new_v4().to_string(),
            title,
            year,
            genres: normalize_genres(movie.genres),
            director: normalize_director(movie.director),
            borrowed: false,
            borrowed_by: None,
            borrowed_at: None,
            created_at: now.clone(),
            updated_at: now,
        };

        self.movies
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Movie, CatalogError> {
        self.movies
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    async fn list(&self, only_available: bool) -> Result<Vec<Movie>, CatalogError> {
        let mut movies = self
            .movies
            .read()
            .values()
            .filter(|movie| !only_available || !movie.borrowed)
            .cloned()
            .collect::<Vec<_>>();
        sort_movies(&mut movies);
        Ok(movies)
    }

    async fn update(&self, id: &str, update: MovieUpdate) -> Result<Movie, CatalogError> {
        let title = update
            .title
            .as_deref()
            .map(|title| normalize_title(title, "title cannot be empty."))
            .transpose()?;
        let year = update.year.map(validate_year).transpose()?;

        let mut movies = self.movies.write();
        let movie = require(&mut movies, id)?;
        if let Some(title) = title {
            movie.title = title;
        }
        if let Some(year) = year {
            movie.year = year;
        }
        if update.genres.is_some() {
            movie.genres = normalize_genres(update.genres);
        }
        if update.director.is_some() {
            movie.director = normalize_director(update.director);
        }
        movie.updated_at = now_utc();
        Ok(movie.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), CatalogError> {
        self.movies
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    async fn borrow(&self, id: &str, borrower: &str) -> Result<Movie, CatalogError> {
        let borrower = borrower.trim();
        if borrower.is_empty() {
            return Err(CatalogError::InvalidInput("borrower is required.".to_string()));
        }

        let mut movies = self.movies.write();
        let movie = require(&mut movies, id)?;
        if movie.borrowed {
            return Err(CatalogError::AlreadyBorrowed(
                movie.borrowed_by.clone().unwrap_or_default(),
            ));
        }
        let now = now_utc();
        movie.borrowed = true;
        movie.borrowed_by = Some(borrower.to_string());
        movie.borrowed_at = Some(now.clone());
        movie.updated_at = now;
        Ok(movie.clone())
    }

    async fn return_movie(&self, id: &str) -> Result<Movie, CatalogError> {
        let mut movies = self.movies.write();
        let movie = require(&mut movies, id)?;
        if !movie.borrowed {
            return Err(CatalogError::NotBorrowed);
        }
        movie.borrowed = false;
        movie.borrowed_by = None;
        movie.borrowed_at = None;
        movie.updated_at = now_utc();
        Ok(movie.clone())
    }
}
