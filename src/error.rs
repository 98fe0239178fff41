use thiserror::Error;

/// Failures from talking to the Flume cloud API.
///
/// None of these propagate past the collector loop: each call site catches,
/// logs, counts, and continues with an empty/absent result.
#[derive(Debug, Error)]
pub enum FlumeError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("unexpected response shape: {0}")]
    Shape(String),
}

impl FlumeError {
    /// Stable label value for the `flume_api_errors_total` counter.
    pub fn kind(&self) -> &'static str {
        match self {
            FlumeError::Authentication(_) => "authentication",
            FlumeError::Upstream(_) => "upstream",
            FlumeError::Shape(_) => "shape",
        }
    }
}
