use std::net::SocketAddr;

use {
    axum::{
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    pubrelay_broker::BrokerError,
    pubrelay_plugins::PluginError,
};

/// Everything a request handler can fail with.
///
/// Clients only ever see an empty `400 Bad Request`; the variant is for
/// logs.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown or expired ticket")]
    UnknownTicket,

    #[error("ticket issued to {requester} presented from {peer}")]
    AddressMismatch {
        requester: SocketAddr,
        peer: SocketAddr,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("publish queue closed")]
    QueueClosed,
}

impl From<BrokerError> for GatewayError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::InvalidRange { .. } => Self::BadRequest(e.to_string()),
            BrokerError::Unavailable(_) | BrokerError::Protocol(_) => {
                Self::UpstreamUnavailable(e.to_string())
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::debug!(error = %self, "request rejected");
        StatusCode::BAD_REQUEST.into_response()
    }
}
