use chrono::{DateTime, Utc};
use lib_tokenwise::model::TransactionEvent;
use serde::{Deserialize, Serialize};

/// Default and upper bound for `get_recent_transactions`.
pub const DEFAULT_RECENT_LIMIT: usize = 10;
pub const MAX_RECENT_LIMIT: usize = 100;

/// Commands a websocket client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    GetStatus,
    GetRecentTransactions {
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl ClientMessage {
    pub fn recent_limit(limit: Option<usize>) -> usize {
        limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT)
    }
}

/// Frames the server sends to one client. Broadcast frames come from the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        message: &'static str,
        monitoring_token: String,
        tracked_wallets: usize,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Status {
        monitoring_active: bool,
        connected_clients: usize,
        tracked_wallets: usize,
        timestamp: DateTime<Utc>,
    },
    RecentTransactions {
        transactions: Vec<TransactionEvent>,
        timestamp: DateTime<Utc>,
    },
    Keepalive {
        timestamp: DateTime<Utc>,
    },
}

pub const GREETING: &str = "Connected to TokenWise real-time feed";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_commands() {
        assert_eq!(serde_json::from_str::<ClientMessage>(r#"{"command":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"command":"get_recent_transactions","limit":5}"#).unwrap(),
            ClientMessage::GetRecentTransactions { limit: Some(5) }
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"command":"get_recent_transactions"}"#).unwrap(),
            ClientMessage::GetRecentTransactions { limit: None }
        );
    }

    #[test]
    fn rejects_unknown_commands() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"command":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("ping").is_err());
    }

    #[test]
    fn recent_limit_is_bounded() {
        assert_eq!(ClientMessage::recent_limit(None), 10);
        assert_eq!(ClientMessage::recent_limit(Some(500)), 100);
        assert_eq!(ClientMessage::recent_limit(Some(0)), 1);
    }

    #[test]
    fn server_messages_carry_type_tag() {
        let timestamp = Utc::now();
        let value = serde_json::to_value(ServerMessage::Status {
            monitoring_active: true,
            connected_clients: 3,
            tracked_wallets: 60,
            timestamp,
        })
        .unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["connected_clients"], 3);

        let value = serde_json::to_value(ServerMessage::ConnectionEstablished {
            message: GREETING,
            monitoring_token: "mint".to_string(),
            tracked_wallets: 0,
            timestamp,
        })
        .unwrap();
        assert_eq!(value["type"], "connection_established");
        assert_eq!(value["message"], json!(GREETING));
    }
}
