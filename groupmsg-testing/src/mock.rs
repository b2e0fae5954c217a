//! In-memory stand-ins for everything the queue depends on

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use groupmsg_core::db::{DatabaseTransaction, IWriteDatabaseTransactionOpsTyped as _};
use groupmsg_core::encoding::{Decodable, DecodeError, Encodable};
use groupmsg_core::{impl_db_lookup, impl_db_record};
use groupmsg_logging::LOG_TEST;
use groupmsg_queue::types::{
    GroupContextInfo, GroupId, GroupSecretParams, GroupSnapshot, ServiceAddress,
    VerifiedGroupChange,
};
use groupmsg_queue::{
    BlockingPolicy, Delivery, DeliverySink, DrainTrigger, ErrorNotifier, GroupMessageProcessor,
    GroupStateGateway, GroupsError, HostState, JobId,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Body of a group change as understood by [`FakeGateway`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeGroupChange {
    pub revision: u32,
    pub add_members: Vec<ServiceAddress>,
    pub signed: bool,
}

impl FakeGroupChange {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializable")
    }
}

/// Calls that reached the group state gateway, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    VerifyChange,
    ApplyChange { revision: u32 },
    Refresh { revision: u32 },
}

#[derive(Debug, Default)]
struct GatewayState {
    local: BTreeMap<GroupId, GroupSnapshot>,
    /// What the group service would return
    service: BTreeMap<GroupId, GroupSnapshot>,
    verify_errors: VecDeque<GroupsError>,
    apply_errors: VecDeque<GroupsError>,
    refresh_errors: VecDeque<GroupsError>,
    /// Fired at the processor from inside every refresh
    refresh_trigger: Option<(DrainTrigger, GroupMessageProcessor)>,
    calls: Vec<GatewayCall>,
}

/// Group state kept in memory
///
/// Master keys double as group ids, so any 32 byte master key is valid.
#[derive(Clone, Debug, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn secret_params_for(group_id: &GroupId) -> GroupSecretParams {
        GroupSecretParams(group_id.0.iter().rev().copied().collect())
    }

    fn snapshot(group_id: &GroupId, revision: u32, members: &[ServiceAddress]) -> GroupSnapshot {
        GroupSnapshot {
            group_id: group_id.clone(),
            revision,
            members: members.to_vec(),
            secret_params: Self::secret_params_for(group_id),
        }
    }

    pub fn set_local_group(&self, group_id: &GroupId, revision: u32, members: &[ServiceAddress]) {
        self.state
            .lock()
            .unwrap()
            .local
            .insert(group_id.clone(), Self::snapshot(group_id, revision, members));
    }

    pub fn set_service_group(
        &self,
        group_id: &GroupId,
        revision: u32,
        members: &[ServiceAddress],
    ) {
        self.state
            .lock()
            .unwrap()
            .service
            .insert(group_id.clone(), Self::snapshot(group_id, revision, members));
    }

    pub fn local_revision(&self, group_id: &GroupId) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .local
            .get(group_id)
            .map(|group| group.revision)
    }

    pub fn fail_next_verify(&self, err: GroupsError) {
        self.state.lock().unwrap().verify_errors.push_back(err);
    }

    pub fn fail_next_apply(&self, err: GroupsError) {
        self.state.lock().unwrap().apply_errors.push_back(err);
    }

    pub fn fail_next_refresh(&self, err: GroupsError) {
        self.state.lock().unwrap().refresh_errors.push_back(err);
    }

    /// Send `trigger` to `processor` while each refresh is in flight
    pub fn trigger_during_refresh(&self, trigger: DrainTrigger, processor: GroupMessageProcessor) {
        self.state.lock().unwrap().refresh_trigger = Some((trigger, processor));
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl GroupStateGateway for FakeGateway {
    fn context_info(&self, master_key: &[u8]) -> Result<GroupContextInfo, GroupsError> {
        if master_key.len() != 32 {
            return Err(GroupsError::Other(anyhow::anyhow!(
                "master key has {} bytes",
                master_key.len()
            )));
        }
        let group_id = GroupId(master_key.to_vec());
        Ok(GroupContextInfo {
            secret_params: Self::secret_params_for(&group_id),
            group_id,
        })
    }

    async fn local_group(&self, group_id: &GroupId) -> Option<GroupSnapshot> {
        self.state.lock().unwrap().local.get(group_id).cloned()
    }

    async fn parse_and_verify_change(
        &self,
        change: &[u8],
    ) -> Result<VerifiedGroupChange, GroupsError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::VerifyChange);
        if let Some(err) = state.verify_errors.pop_front() {
            return Err(err);
        }

        let parsed: FakeGroupChange = serde_json::from_slice(change)
            .map_err(|err| GroupsError::InvalidChange(err.to_string()))?;
        if !parsed.signed {
            return Err(GroupsError::InvalidSignature);
        }
        Ok(VerifiedGroupChange {
            revision: parsed.revision,
            actions: change.to_vec(),
        })
    }

    async fn apply_change(
        &self,
        group_id: &GroupId,
        secret_params: &GroupSecretParams,
        change: VerifiedGroupChange,
    ) -> Result<GroupSnapshot, GroupsError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::ApplyChange {
            revision: change.revision,
        });
        if let Some(err) = state.apply_errors.pop_front() {
            return Err(err);
        }

        let parsed: FakeGroupChange = serde_json::from_slice(&change.actions)
            .map_err(|err| GroupsError::InvalidChange(err.to_string()))?;
        let group = state
            .local
            .get_mut(group_id)
            .ok_or(GroupsError::UnknownGroup)?;
        if group.secret_params != *secret_params {
            return Err(GroupsError::InvalidChange("wrong secret params".into()));
        }
        group.revision = parsed.revision;
        group.members.extend(parsed.add_members);
        Ok(group.clone())
    }

    async fn refresh_to_revision(
        &self,
        group_id: &GroupId,
        _secret_params: &GroupSecretParams,
        revision: u32,
    ) -> Result<GroupSnapshot, GroupsError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::Refresh { revision });
        if let Some((trigger, processor)) = &state.refresh_trigger {
            processor.trigger(*trigger);
        }
        if let Some(err) = state.refresh_errors.pop_front() {
            return Err(err);
        }

        let mut group = state
            .service
            .get(group_id)
            .cloned()
            .ok_or(GroupsError::UnknownGroup)?;
        group.revision = group.revision.max(revision);
        state.local.insert(group_id.clone(), group.clone());
        Ok(group)
    }
}

#[repr(u8)]
#[derive(Clone, Debug)]
pub enum SinkDbKeyPrefix {
    DeliveredMessage = 0x70,
}

impl std::fmt::Display for SinkDbKeyPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Written by [`RecordingSink`] in the delivery transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredMessageKey(pub JobId);

#[derive(Debug)]
pub struct DeliveredMessagePrefix;

impl Encodable for DeliveredMessageKey {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for DeliveredMessageKey {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(DeliveredMessageKey(JobId::consensus_decode(r)?))
    }
}

impl Encodable for DeliveredMessagePrefix {
    fn consensus_encode<W: Write>(&self, _writer: &mut W) -> std::io::Result<usize> {
        Ok(0)
    }
}

impl_db_record!(
    key = DeliveredMessageKey,
    value = Vec<u8>,
    db_prefix = SinkDbKeyPrefix::DeliveredMessage,
);
impl_db_lookup!(key = DeliveredMessageKey, query_prefix = DeliveredMessagePrefix);

#[derive(Debug, Default)]
struct SinkState {
    delivered: Vec<Delivery>,
    failing_senders: BTreeSet<String>,
    /// Switch the processor to the background after this many deliveries
    background_after: Option<(usize, GroupMessageProcessor)>,
}

/// Delivery sink that remembers everything it was handed
///
/// Each delivery also writes a [`DeliveredMessageKey`] record, before failing
/// if the sender is configured to fail, so rollbacks are observable.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_deliveries_from(&self, sender_uuid: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_senders
            .insert(sender_uuid.to_owned());
    }

    pub fn enter_background_after(&self, deliveries: usize, processor: GroupMessageProcessor) {
        self.state.lock().unwrap().background_after = Some((deliveries, processor));
    }

    /// Every successful delivery so far
    pub fn delivered(&self) -> Vec<Delivery> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn delivered_jobs(&self) -> Vec<JobId> {
        self.delivered()
            .iter()
            .map(|delivery| delivery.job_id)
            .collect()
    }

    pub fn max_concurrent_deliveries(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        delivery: &Delivery,
    ) -> anyhow::Result<()> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        dbtx.insert_entry(
            &DeliveredMessageKey(delivery.job_id),
            &delivery.plaintext.clone().unwrap_or_default(),
        )
        .await;
        tokio::task::yield_now().await;

        let result = {
            let mut state = self.state.lock().unwrap();
            let sender = delivery.envelope.source_uuid.clone().unwrap_or_default();
            if state.failing_senders.contains(&sender) {
                Err(anyhow::anyhow!("delivery from {sender} rejected"))
            } else {
                state.delivered.push(delivery.clone());
                debug!(target: LOG_TEST, job_id = %delivery.job_id, "Recorded delivery");
                if let Some((after, processor)) = &state.background_after {
                    if state.delivered.len() >= *after {
                        processor.trigger(DrainTrigger::EnteredBackground);
                    }
                }
                Ok(())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Counts corrupted message notifications
#[derive(Clone, Debug, Default)]
pub struct CountingNotifier {
    count: Arc<AtomicUsize>,
}

impl CountingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ErrorNotifier for CountingNotifier {
    async fn notify_corrupted_message(&self, _dbtx: &mut DatabaseTransaction<'_>) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeBlockList {
    addresses: Arc<Mutex<Vec<ServiceAddress>>>,
    groups: Arc<Mutex<BTreeSet<GroupId>>>,
}

impl FakeBlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_address(&self, address: ServiceAddress) {
        self.addresses.lock().unwrap().push(address);
    }

    pub fn block_group(&self, group_id: GroupId) {
        self.groups.lock().unwrap().insert(group_id);
    }
}

impl BlockingPolicy for FakeBlockList {
    fn is_address_blocked(&self, address: &ServiceAddress) -> bool {
        self.addresses
            .lock()
            .unwrap()
            .iter()
            .any(|blocked| blocked.matches(address))
    }

    fn is_group_blocked(&self, group_id: &GroupId) -> bool {
        self.groups.lock().unwrap().contains(group_id)
    }
}

/// Host application state, ready by default
#[derive(Clone, Debug)]
pub struct FakeHost {
    registered: Arc<AtomicBool>,
    should_process: Arc<AtomicBool>,
    local_address: Arc<Mutex<Option<ServiceAddress>>>,
}

impl FakeHost {
    pub fn new(local_address: ServiceAddress) -> Self {
        Self {
            registered: Arc::new(AtomicBool::new(true)),
            should_process: Arc::new(AtomicBool::new(true)),
            local_address: Arc::new(Mutex::new(Some(local_address))),
        }
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    pub fn set_should_process(&self, should_process: bool) {
        self.should_process.store(should_process, Ordering::SeqCst);
    }
}

impl HostState for FakeHost {
    fn is_registered_and_ready(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn should_process_incoming_messages(&self) -> bool {
        self.should_process.load(Ordering::SeqCst)
    }

    fn local_address(&self) -> Option<ServiceAddress> {
        self.local_address.lock().unwrap().clone()
    }
}
