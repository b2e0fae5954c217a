//! Protobuf messages the queue needs to look into
//!
//! Only the fields used to locate the group context of a message are
//! declared; unknown fields are skipped by the decoder.

use crate::types::ServiceAddress;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(string, optional, tag = "1")]
    pub source_uuid: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub source_e164: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub source_device: Option<u32>,
    #[prost(uint64, optional, tag = "4")]
    pub timestamp: Option<u64>,
    /// Encrypted `Content`, only checked for presence
    #[prost(bytes = "vec", optional, tag = "5")]
    pub content: Option<Vec<u8>>,
}

impl Envelope {
    pub fn source_address(&self) -> Option<ServiceAddress> {
        if self.source_uuid.is_none() && self.source_e164.is_none() {
            return None;
        }
        Some(ServiceAddress {
            uuid: self.source_uuid.clone(),
            e164: self.source_e164.clone(),
        })
    }
}

/// Decrypted payload of an [`Envelope`]
#[derive(Clone, PartialEq, prost::Message)]
pub struct Content {
    #[prost(message, optional, tag = "1")]
    pub data_message: Option<DataMessage>,
    #[prost(message, optional, tag = "2")]
    pub sync_message: Option<SyncMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DataMessage {
    #[prost(string, optional, tag = "1")]
    pub body: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub group_v2: Option<GroupContextV2>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncMessage {
    #[prost(message, optional, tag = "1")]
    pub sent: Option<SyncMessageSent>,
}

/// A message the local user sent from another device
#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncMessageSent {
    #[prost(string, optional, tag = "1")]
    pub destination_uuid: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub message: Option<DataMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GroupContextV2 {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub master_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "2")]
    pub revision: Option<u32>,
    /// Signed change that moves the group to `revision`
    #[prost(bytes = "vec", optional, tag = "3")]
    pub group_change: Option<Vec<u8>>,
}

impl Content {
    /// The group context, looked up in the data message first and in the
    /// sent sync message second
    pub fn group_context(&self) -> Option<&GroupContextV2> {
        self.data_message
            .as_ref()
            .and_then(|data| data.group_v2.as_ref())
            .or_else(|| {
                self.sync_message
                    .as_ref()
                    .and_then(|sync| sync.sent.as_ref())
                    .and_then(|sent| sent.message.as_ref())
                    .and_then(|data| data.group_v2.as_ref())
            })
    }
}
