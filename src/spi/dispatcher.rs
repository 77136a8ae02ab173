//! Protocol messages exchanged with the counterparty connector

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StatusResult;
use super::address::DataAddress;

/// Consumer → provider: request a transfer under a contract agreement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequestMessage {
    /// Consumer's transfer process id
    pub process_id: String,
    pub protocol: String,
    /// Recipient address
    pub counter_party_address: String,
    /// Where the provider sends its replies
    pub callback_address: String,
    pub contract_id: String,
    pub asset_id: String,
    pub transfer_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_destination: Option<DataAddress>,
}

/// Provider → consumer: the transfer has started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStartMessage {
    /// Recipient's transfer process id
    pub process_id: String,
    pub protocol: String,
    pub counter_party_address: String,
    /// Endpoint for pull transfers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_address: Option<DataAddress>,
}

/// Completion, suspension or termination notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEventMessage {
    /// Recipient's transfer process id
    pub process_id: String,
    pub protocol: String,
    pub counter_party_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Message sent to the counterparty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum RemoteMessage {
    TransferRequestMessage(TransferRequestMessage),
    TransferStartMessage(TransferStartMessage),
    TransferCompletionMessage(TransferEventMessage),
    TransferSuspensionMessage(TransferEventMessage),
    TransferTerminationMessage(TransferEventMessage),
}

impl RemoteMessage {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteMessage::TransferRequestMessage(_) => "TransferRequestMessage",
            RemoteMessage::TransferStartMessage(_) => "TransferStartMessage",
            RemoteMessage::TransferCompletionMessage(_) => "TransferCompletionMessage",
            RemoteMessage::TransferSuspensionMessage(_) => "TransferSuspensionMessage",
            RemoteMessage::TransferTerminationMessage(_) => "TransferTerminationMessage",
        }
    }

    pub fn counter_party_address(&self) -> &str {
        match self {
            RemoteMessage::TransferRequestMessage(m) => &m.counter_party_address,
            RemoteMessage::TransferStartMessage(m) => &m.counter_party_address,
            RemoteMessage::TransferCompletionMessage(m)
            | RemoteMessage::TransferSuspensionMessage(m)
            | RemoteMessage::TransferTerminationMessage(m) => &m.counter_party_address,
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            RemoteMessage::TransferRequestMessage(m) => &m.protocol,
            RemoteMessage::TransferStartMessage(m) => &m.protocol,
            RemoteMessage::TransferCompletionMessage(m)
            | RemoteMessage::TransferSuspensionMessage(m)
            | RemoteMessage::TransferTerminationMessage(m) => &m.protocol,
        }
    }

    pub fn process_id(&self) -> &str {
        match self {
            RemoteMessage::TransferRequestMessage(m) => &m.process_id,
            RemoteMessage::TransferStartMessage(m) => &m.process_id,
            RemoteMessage::TransferCompletionMessage(m)
            | RemoteMessage::TransferSuspensionMessage(m)
            | RemoteMessage::TransferTerminationMessage(m) => &m.process_id,
        }
    }
}

/// Counterparty acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAck {
    /// Counterparty's own process id, returned for transfer requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Sends protocol messages to counterparties
#[async_trait]
pub trait RemoteMessageDispatcher: Send + Sync {
    async fn dispatch(&self, message: RemoteMessage) -> StatusResult<MessageAck>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_tagged_by_type() {
        let message = RemoteMessage::TransferCompletionMessage(TransferEventMessage {
            process_id: "tp-1".into(),
            protocol: "dataspace-protocol-http".into(),
            counter_party_address: "http://provider/protocol".into(),
            reason: None,
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["@type"], "TransferCompletionMessage");
        assert_eq!(json["processId"], "tp-1");

        let back: RemoteMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.name(), "TransferCompletionMessage");
        assert_eq!(back.counter_party_address(), "http://provider/protocol");
    }
}
