use serde::{Deserialize, Serialize};

use crate::crawler::{Request, Response};
use crate::error::Result;

/// Everything that travels over the message bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Request dispatched to an agent
    Request(Box<Request>),

    /// Response returned to the owning crawl
    Response(Box<Response>),

    SpiderExit {
        spider_id: String,
    },

    AgentExit {
        agent_id: String,
    },

    AgentRegister {
        agent_id: String,
        agent_name: String,
        processor_count: usize,
        memory: u64,
    },

    AgentHeartbeat {
        agent_id: String,
        agent_name: String,
        available_memory: u64,
        cpu_load: u32,
    },

    StatisticsStart {
        spider_id: String,
        spider_name: String,
    },

    StatisticsExit {
        spider_id: String,
    },

    StatisticsTotal {
        spider_id: String,
        count: u64,
    },

    StatisticsSuccess {
        spider_id: String,
    },

    StatisticsFailure {
        spider_id: String,
    },

    StatisticsRegisterAgent {
        agent_id: String,
        agent_name: String,
    },

    StatisticsAgentSuccess {
        agent_id: String,
        elapsed_ms: u64,
    },

    StatisticsAgentFailure {
        agent_id: String,
        elapsed_ms: u64,
    },

    StatisticsPrint {
        spider_id: String,
    },

    /// A message type this build does not know
    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::SpiderExit { .. } => "spider_exit",
            Message::AgentExit { .. } => "agent_exit",
            Message::AgentRegister { .. } => "agent_register",
            Message::AgentHeartbeat { .. } => "agent_heartbeat",
            Message::StatisticsStart { .. } => "statistics_start",
            Message::StatisticsExit { .. } => "statistics_exit",
            Message::StatisticsTotal { .. } => "statistics_total",
            Message::StatisticsSuccess { .. } => "statistics_success",
            Message::StatisticsFailure { .. } => "statistics_failure",
            Message::StatisticsRegisterAgent { .. } => "statistics_register_agent",
            Message::StatisticsAgentSuccess { .. } => "statistics_agent_success",
            Message::StatisticsAgentFailure { .. } => "statistics_agent_failure",
            Message::StatisticsPrint { .. } => "statistics_print",
            Message::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_wire_format() {
        let message = Message::StatisticsTotal {
            spider_id: "crawl".to_string(),
            count: 4,
        };
        let json: serde_json::Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "statistics_total");
        assert_eq!(json["count"], 4);
    }

    #[test]
    fn test_request_payload() {
        let request = Request::new("http://example.test/page").unwrap();
        let bytes = Message::Request(Box::new(request)).to_bytes().unwrap();

        match Message::from_bytes(&bytes).unwrap() {
            Message::Request(decoded) => assert_eq!(decoded.url.as_str(), "http://example.test/page"),
            other => panic!("unexpected message {}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let message = Message::from_bytes(br#"{"type":"from_the_future"}"#).unwrap();
        assert!(matches!(message, Message::Unknown));
    }

    #[test]
    fn test_malformed_bytes_error() {
        assert!(Message::from_bytes(b"not json").is_err());
    }
}
