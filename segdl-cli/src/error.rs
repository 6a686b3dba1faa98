use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Download error: {0}")]
    Download(#[from] segdl_engine::DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
