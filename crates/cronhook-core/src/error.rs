use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronhookError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CronhookError {
    /// Short error code string used in CLI output and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            CronhookError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CronhookError>;
