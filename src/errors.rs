use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("alias invalid: {0}")]
    AliasInvalid(String),
    #[error("coordinates out of range: {lat}, {lon}")]
    InvalidCoordinates { lat: f64, lon: f64 },
    #[error("address key is empty after normalization")]
    EmptyKey,
    #[error("geocoder failure: {0}")]
    Geocoder(String),
}
