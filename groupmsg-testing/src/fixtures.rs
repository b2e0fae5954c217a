use std::sync::Arc;
use std::time::Duration;

use groupmsg_core::db::mem_impl::MemDatabase;
use groupmsg_core::db::{Database, IRawDatabaseExt as _};
use groupmsg_core::task::TaskGroup;
use groupmsg_queue::proto::{
    Content, DataMessage, Envelope, GroupContextV2, SyncMessage, SyncMessageSent,
};
use groupmsg_queue::types::{GroupId, ServiceAddress};
use groupmsg_queue::{GroupMessageProcessor, JobId, QueueCollaborators, QueueConfig};
use prost::Message as _;

use crate::mock::{CountingNotifier, FakeBlockList, FakeGateway, FakeHost, RecordingSink};

pub const LOCAL_USER: &str = "local-user";

/// A 32 byte master key, which [`FakeGateway`] also uses as group id
pub fn master_key(tag: u8) -> Vec<u8> {
    vec![tag; 32]
}

pub fn group_id(tag: u8) -> GroupId {
    GroupId(master_key(tag))
}

pub fn address(uuid: &str) -> ServiceAddress {
    ServiceAddress::from_uuid(uuid)
}

/// Builder for the envelope and plaintext of one group message
#[derive(Debug, Clone)]
pub struct GroupMessage {
    sender: String,
    master_key: Vec<u8>,
    revision: Option<u32>,
    group_change: Option<Vec<u8>>,
    body: String,
    via_sync: bool,
}

impl GroupMessage {
    pub fn new(sender: &str, group_tag: u8, revision: u32) -> Self {
        Self {
            sender: sender.to_owned(),
            master_key: master_key(group_tag),
            revision: Some(revision),
            group_change: None,
            body: format!("hello from {sender}"),
            via_sync: false,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_group_change(mut self, change: Vec<u8>) -> Self {
        self.group_change = Some(change);
        self
    }

    pub fn with_master_key(mut self, master_key: Vec<u8>) -> Self {
        self.master_key = master_key;
        self
    }

    pub fn without_revision(mut self) -> Self {
        self.revision = None;
        self
    }

    /// Sent by the local user from another device
    pub fn via_sync(mut self) -> Self {
        self.via_sync = true;
        self
    }

    pub fn envelope_bytes(&self) -> Vec<u8> {
        Envelope {
            source_uuid: Some(self.sender.clone()),
            source_e164: None,
            source_device: Some(1),
            timestamp: Some(1_700_000_000_000),
            content: Some(b"ciphertext".to_vec()),
        }
        .encode_to_vec()
    }

    pub fn plaintext_bytes(&self) -> Vec<u8> {
        let data_message = DataMessage {
            body: Some(self.body.clone()),
            group_v2: Some(GroupContextV2 {
                master_key: Some(self.master_key.clone()),
                revision: self.revision,
                group_change: self.group_change.clone(),
            }),
        };
        let content = if self.via_sync {
            Content {
                data_message: None,
                sync_message: Some(SyncMessage {
                    sent: Some(SyncMessageSent {
                        destination_uuid: None,
                        message: Some(data_message),
                    }),
                }),
            }
        } else {
            Content {
                data_message: Some(data_message),
                sync_message: None,
            }
        };
        content.encode_to_vec()
    }
}

/// Queue config for tests: short spacing, predictable backoff
pub fn test_config() -> QueueConfig {
    QueueConfig {
        batch_spacing: Duration::from_millis(10),
        retry_base_delay: Duration::from_secs(1),
        retry_max_delay: Duration::from_secs(60),
        ..QueueConfig::default()
    }
}

/// A database plus fakes for every collaborator of the queue
#[derive(Debug, Clone)]
pub struct Fixtures {
    pub db: Database,
    pub gateway: FakeGateway,
    pub sink: RecordingSink,
    pub notifier: CountingNotifier,
    pub blocking: FakeBlockList,
    pub host: FakeHost,
    pub task_group: TaskGroup,
}

impl Default for Fixtures {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixtures {
    pub fn new() -> Self {
        Self::with_db(MemDatabase::new().into_database())
    }

    pub fn with_db(db: Database) -> Self {
        Self {
            db,
            gateway: FakeGateway::new(),
            sink: RecordingSink::new(),
            notifier: CountingNotifier::new(),
            blocking: FakeBlockList::new(),
            host: FakeHost::new(address(LOCAL_USER)),
            task_group: TaskGroup::new(),
        }
    }

    pub fn collaborators(&self) -> QueueCollaborators {
        QueueCollaborators {
            gateway: Arc::new(self.gateway.clone()),
            sink: Arc::new(self.sink.clone()),
            notifier: Arc::new(self.notifier.clone()),
            blocking: Arc::new(self.blocking.clone()),
            host: Arc::new(self.host.clone()),
        }
    }

    pub fn start(&self, config: QueueConfig) -> GroupMessageProcessor {
        GroupMessageProcessor::new(
            self.db.clone(),
            config,
            self.collaborators(),
            &self.task_group,
        )
    }

    /// Make group `tag` known locally at `revision`, with the local user and
    /// `members` in it
    pub fn local_group(&self, tag: u8, revision: u32, members: &[&str]) {
        self.gateway
            .set_local_group(&group_id(tag), revision, &Self::members(members));
    }

    /// Make group `tag` available from the service at `revision`
    pub fn service_group(&self, tag: u8, revision: u32, members: &[&str]) {
        self.gateway
            .set_service_group(&group_id(tag), revision, &Self::members(members));
    }

    fn members(members: &[&str]) -> Vec<ServiceAddress> {
        std::iter::once(LOCAL_USER)
            .chain(members.iter().copied())
            .map(address)
            .collect()
    }

    /// Enqueue `messages` in one committed transaction
    pub async fn enqueue(
        &self,
        processor: &GroupMessageProcessor,
        messages: &[GroupMessage],
    ) -> Vec<JobId> {
        let mut dbtx = self.db.begin_write_transaction().await;
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let id = processor
                .enqueue(
                    &mut dbtx,
                    &message.envelope_bytes(),
                    Some(message.plaintext_bytes().as_slice()),
                    true,
                )
                .await
                .expect("valid group message")
                .expect("queue is enabled");
            ids.push(id);
        }
        dbtx.commit_tx().await;
        ids
    }

    pub async fn shutdown(self) {
        self.task_group
            .shutdown_join_all(Duration::from_secs(5))
            .await
            .expect("queue shuts down cleanly");
    }
}
