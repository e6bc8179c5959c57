use thiserror::Error;

use crate::models::{BanVariant, Period, Region};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Data format error in {source_name}: {reason}")]
    DataFormat { source_name: String, reason: String },

    #[error("Insufficient data: no active {region} users in the {period} period ({variant})")]
    InsufficientData {
        region: Region,
        period: Period,
        variant: BanVariant,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
