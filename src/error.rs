use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Transformation error: {0}")]
    Transform(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Load error: {0}")]
    Load(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
