use thiserror::Error;

use crate::gateway::GatewayError;

/// Errors returned by session, playback and service operations.
///
/// Only `Connection` affects every group at once; the other kinds are local to
/// the group a command targeted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BotError {
    /// Login against the gateway failed. The session stays disconnected and the
    /// next access retries.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A join, leave or logout acknowledgement did not arrive in time.
    #[error("timed out waiting for {0} acknowledgement")]
    AckTimeout(&'static str),

    /// The request was rejected before any state was touched.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl BotError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<GatewayError> for BotError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::UnknownGroup(_) | GatewayError::UnknownChannel { .. } => {
                Self::NotFound(e.to_string())
            }
            GatewayError::Login(_) | GatewayError::Closed | GatewayError::Request(_) => {
                Self::Connection(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            BotError::Connection("refused".into()).to_string(),
            "connection failed: refused"
        );
        assert_eq!(
            BotError::AckTimeout("join").to_string(),
            "timed out waiting for join acknowledgement"
        );
        assert_eq!(
            BotError::validation("bad path").to_string(),
            "invalid request: bad path"
        );
        assert_eq!(
            BotError::not_found("no voice connection").to_string(),
            "not found: no voice connection"
        );
    }

    #[test]
    fn test_gateway_errors_map_to_kinds() {
        let unknown = BotError::from(GatewayError::UnknownChannel {
            group_id: "g1".into(),
            channel_id: "c9".into(),
        });
        assert!(matches!(unknown, BotError::NotFound(_)));
        assert!(matches!(
            BotError::from(GatewayError::Closed),
            BotError::Connection(_)
        ));
    }
}
