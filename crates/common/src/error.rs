//! Error types for the feed client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid collection slug '{0}': expected [a-z0-9-]+")]
    InvalidSlug(String),

    #[error("subscriber {subscriber} already holds {limit} subscriptions")]
    CapacityExceeded { subscriber: String, limit: usize },

    #[error("subscriber {subscriber} is already subscribed to {collection}")]
    AlreadySubscribed { subscriber: String, collection: String },

    #[error("subscriber {subscriber} is not subscribed to {collection}")]
    NotSubscribed { subscriber: String, collection: String },

    #[error("join for {0} was not acknowledged in time; it stays recorded and will be retried")]
    AckTimeout(String),

    #[error("upstream rejected join for {collection}: {detail}")]
    AckRejected { collection: String, detail: String },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("reconnection exhausted after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("operation cancelled: feed client stopped")]
    Cancelled,

    #[error("persistence error: {0}")]
    Store(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Short label used for the `error_type` metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidSlug(_) => "invalid_slug",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::AlreadySubscribed { .. } => "already_subscribed",
            Error::NotSubscribed { .. } => "not_subscribed",
            Error::AckTimeout(_) => "ack_timeout",
            Error::AckRejected { .. } => "ack_rejected",
            Error::TransportFailure(_) => "transport",
            Error::ReconnectionExhausted { .. } => "reconnection_exhausted",
            Error::MalformedFrame(_) => "malformed_frame",
            Error::Cancelled => "cancelled",
            Error::Store(_) => "store",
            Error::WebSocket(_) => "websocket",
            Error::Json(_) => "json",
            Error::UrlParse(_) => "url",
            Error::ConnectionClosed => "disconnect",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
