/// Centralized error types for the bar synchronizer
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    // Network Errors
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("WebSocket connection failed: {0}")]
    WebSocketError(String),

    #[error("WebSocket disconnected: {0}")]
    WebSocketDisconnected(String),

    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    // Upstream Errors
    #[error("Upstream API error: {code} - {message}")]
    UpstreamApi { code: u16, message: String },

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    // Data Errors
    #[error("Malformed feed update: {0}")]
    MalformedUpdate(String),

    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Unknown resolution: {0}")]
    UnknownResolution(String),

    // Storage Errors
    #[error("Store operation failed: {0}")]
    StoreError(String),

    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // Reconciliation Errors
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Supervisor gave up on {operation} after {restarts} restarts")]
    SupervisorGaveUp { operation: String, restarts: u32 },

    // Pipeline Errors
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("System shutdown: {0}")]
    SystemShutdown(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<config::ConfigError> for SyncError {
    fn from(e: config::ConfigError) -> Self {
        SyncError::ConfigError(e.to_string())
    }
}

impl SyncError {
    /// Check if error is transient and worth another attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::HttpError(_)
                | SyncError::NetworkTimeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::WebSocketDisconnected(_)
                | SyncError::RateLimitExceeded(_)
                | SyncError::UpstreamApi { .. }
                | SyncError::StoreError(_)
                | SyncError::FileError(_)
        )
    }

    /// Check if error means the pipeline should stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::ConfigError(_) | SyncError::SystemShutdown(_) | SyncError::ChannelClosed(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            SyncError::HttpError(_) => "NET_001",
            SyncError::WebSocketError(_) => "NET_002",
            SyncError::WebSocketDisconnected(_) => "NET_003",
            SyncError::NetworkTimeout(_) => "NET_004",
            SyncError::UpstreamApi { .. } => "API_001",
            SyncError::RateLimitExceeded(_) => "API_002",
            SyncError::MalformedUpdate(_) => "DATA_001",
            SyncError::InvalidBarData(_) => "DATA_002",
            SyncError::DeserializationError(_) => "DATA_003",
            SyncError::UnknownResolution(_) => "DATA_004",
            SyncError::StoreError(_) => "STORE_001",
            SyncError::FileError(_) => "STORE_002",
            SyncError::ConfigError(_) => "CFG_001",
            SyncError::InvalidParameter(_) => "CFG_002",
            SyncError::RetriesExhausted { .. } => "REC_001",
            SyncError::SupervisorGaveUp { .. } => "REC_002",
            SyncError::ChannelClosed(_) => "SYS_001",
            SyncError::SystemShutdown(_) => "SYS_002",
            SyncError::InternalError(_) => "INT_001",
        }
    }
}
