//! The drain loop of the incoming group message queue
//!
//! A single worker task owns draining. It sleeps until a trigger arrives or
//! a timer it armed itself expires, then runs one step at a time:
//!
//! * fetch up to a batch of the oldest jobs
//! * resolve them in order, collecting jobs that need no group update
//! * deliver that prefix in one transaction, or reconcile the group for a
//!   lone job at the head of the queue that does need an update
//! * remove what was processed and arm the next step
//!
//! Triggers are coalesced through a `watch` channel, so any number of them
//! while a drain is in flight results in at most one extra step.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use groupmsg_core::db::{AutocommitError, Database, DatabaseTransaction};
use groupmsg_core::runtime::{Instant, sleep_until};
use groupmsg_core::task::{TaskGroup, TaskHandle};
use groupmsg_core::util::backoff_util::doubling_backoff;
use groupmsg_logging::{LOG_QUEUE, LOG_QUEUE_DELIVERY};
use prost::Message as _;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, trace, warn};

use crate::collaborators::{Delivery, QueueCollaborators};
use crate::config::QueueConfig;
use crate::db::{IReadJobStore as _, IWriteJobStore as _, IncomingGroupJob, JobId};
use crate::eligibility::{MembershipCheck, can_process_without_update, must_discard};
use crate::error::EnqueueError;
use crate::metrics::{
    QUEUE_BATCH_JOBS, QUEUE_CORRUPTED_NOTIFICATIONS_TOTAL, QUEUE_JOBS_DELIVERED_TOTAL,
    QUEUE_JOBS_DISCARDED_TOTAL, QUEUE_JOBS_ENQUEUED_TOTAL, QUEUE_RETRY_WAITS_TOTAL,
};
use crate::proto::Envelope;
use crate::reconcile::{UpdateOutcome, UpdateReconciler};
use crate::resolve::{JobInfo, group_context_for, resolve};
use crate::types::GroupId;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Commits of a batch transaction that may conflict before the queue halts
const MAX_BATCH_COMMIT_ATTEMPTS: usize = 5;

/// Signals from the host that may let a drain start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    EnteredForeground,
    EnteredBackground,
    RegistrationStateChanged,
    SocketStateChanged,
    ConnectivityChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Draining,
    /// Committing a batch kept failing, nothing is drained anymore
    Halted,
}

/// Broadcast to observers of the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A drain found no pending jobs
    Drained,
    /// A batch was committed, `jobs` have left the queue
    BatchCompleted { jobs: Vec<JobId>, remaining: usize },
    /// A group update has to be retried, the next attempt is after `delay`
    RetryScheduled { delay: Duration },
    Halted,
}

/// How a drain step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Continue,
    Retry,
    Drained,
}

/// Jobs picked for one step
#[derive(Debug)]
enum Batch {
    NoUpdate(Vec<JobInfo>),
    Update(JobInfo),
}

/// What a batch transaction does with its jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchAction {
    /// Deliver or discard each job
    Process,
    /// Remove jobs whose group update failed for good
    DropFailedUpdate,
}

/// What the worker is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    /// Next step of the drain in flight
    Continue,
    /// Retry after a backoff, no drain is in flight meanwhile
    Retry,
}

/// Handle to the incoming group message queue
///
/// Cloning is cheap and every clone talks to the same worker.
#[derive(Debug, Clone)]
pub struct GroupMessageProcessor {
    inner: Arc<ProcessorInner>,
}

#[derive(Debug)]
struct ProcessorInner {
    db: Database,
    config: QueueConfig,
    collaborators: QueueCollaborators,
    reconciler: UpdateReconciler,
    state: Mutex<DrainState>,
    in_background: AtomicBool,
    wakeup_tx: watch::Sender<()>,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl GroupMessageProcessor {
    /// Start the queue worker in `task_group`
    ///
    /// The worker checks for pending jobs right away and stops when the task
    /// group shuts down.
    pub fn new(
        db: Database,
        config: QueueConfig,
        collaborators: QueueCollaborators,
        task_group: &TaskGroup,
    ) -> Self {
        let (wakeup_tx, wakeup_rx) = watch::channel(());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let reconciler =
            UpdateReconciler::new(collaborators.gateway.clone(), config.apply_embedded_changes);

        let inner = Arc::new(ProcessorInner {
            db,
            config,
            collaborators,
            reconciler,
            state: Mutex::new(DrainState::Idle),
            in_background: AtomicBool::new(false),
            wakeup_tx,
            events_tx,
        });

        task_group.spawn("group message queue", {
            let inner = inner.clone();
            move |task_handle| inner.run_drain_loop(task_handle, wakeup_rx)
        });
        inner.request_drain();

        Self { inner }
    }

    pub fn trigger(&self, trigger: DrainTrigger) {
        trace!(target: LOG_QUEUE, ?trigger, "Drain trigger");
        match trigger {
            DrainTrigger::EnteredForeground => {
                self.inner.in_background.store(false, Ordering::SeqCst);
            }
            DrainTrigger::EnteredBackground => {
                self.inner.in_background.store(true, Ordering::SeqCst);
            }
            DrainTrigger::RegistrationStateChanged
            | DrainTrigger::SocketStateChanged
            | DrainTrigger::ConnectivityChanged => {}
        }
        self.inner.request_drain();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn drain_state(&self) -> DrainState {
        self.inner.state()
    }

    pub async fn has_pending_jobs(&self) -> bool {
        self.inner
            .db
            .begin_read_transaction()
            .await
            .has_pending_jobs()
            .await
    }

    /// Queue a decrypted group message as part of the caller's transaction
    ///
    /// The group is derived from the message itself. Returns `None` when the
    /// queue is disabled and the message was dropped. A drain is requested
    /// once `dbtx` commits.
    pub async fn enqueue(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        envelope: &[u8],
        plaintext: Option<&[u8]>,
        was_sealed_sender: bool,
    ) -> Result<Option<JobId>, EnqueueError> {
        if envelope.is_empty() {
            return Err(EnqueueError::EmptyEnvelope);
        }
        if !self.inner.config.enabled {
            warn!(target: LOG_QUEUE, "Group message queue is disabled, dropping message");
            return Ok(None);
        }

        let decoded = Envelope::decode(envelope)?;
        let context =
            group_context_for(&decoded, plaintext).ok_or(EnqueueError::NotAGroupMessage)?;
        let context_info = self
            .inner
            .collaborators
            .gateway
            .context_info(context.master_key.as_deref().unwrap_or_default())
            .map_err(EnqueueError::InvalidGroupContext)?;

        let job_id = self
            .enqueue_job(
                dbtx,
                envelope.to_vec(),
                plaintext.map(<[u8]>::to_vec),
                context_info.group_id,
                was_sealed_sender,
            )
            .await;
        Ok(Some(job_id))
    }

    /// Append a job for an already identified group
    pub async fn enqueue_job(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        envelope: Vec<u8>,
        plaintext: Option<Vec<u8>>,
        group_id: GroupId,
        was_sealed_sender: bool,
    ) -> JobId {
        let job = IncomingGroupJob {
            envelope,
            plaintext,
            group_id,
            was_sealed_sender,
            created_at: groupmsg_core::time::now(),
        };
        let job_id = dbtx.add_job(&job).await;
        debug!(target: LOG_QUEUE, %job_id, group_id = %job.group_id, "Enqueued group message");

        let inner = self.inner.clone();
        dbtx.on_commit(move || {
            QUEUE_JOBS_ENQUEUED_TOTAL.inc();
            inner.request_drain();
        });
        job_id
    }
}

impl ProcessorInner {
    fn request_drain(&self) {
        self.wakeup_tx.send_replace(());
    }

    fn state(&self) -> DrainState {
        *self.state.lock().expect("lock poison")
    }

    fn set_state(&self, state: DrainState) {
        *self.state.lock().expect("lock poison") = state;
    }

    fn in_background(&self) -> bool {
        self.in_background.load(Ordering::SeqCst)
    }

    fn emit(&self, event: QueueEvent) {
        // nobody listening is fine
        let _ = self.events_tx.send(event);
    }

    fn is_ready(&self) -> bool {
        let host = &self.collaborators.host;
        self.config.enabled
            && host.should_process_incoming_messages()
            && host.is_registered_and_ready()
    }

    async fn run_drain_loop(
        self: Arc<Self>,
        task_handle: TaskHandle,
        mut wakeup_rx: watch::Receiver<()>,
    ) {
        let mut shutdown_rx = task_handle.make_shutdown_rx();
        let mut timer: Option<(Instant, Timer)> = None;
        let mut backoff = None;

        loop {
            let woken_by_trigger = {
                let timer_expired = async {
                    match timer {
                        Some((deadline, _)) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    () = &mut shutdown_rx => {
                        debug!(target: LOG_QUEUE, "Shutting down group message queue");
                        break;
                    }
                    res = wakeup_rx.changed() => {
                        if res.is_err() {
                            break;
                        }
                        true
                    }
                    () = timer_expired => false,
                }
            };

            if woken_by_trigger {
                if self.state() == DrainState::Draining {
                    trace!(target: LOG_QUEUE, "Drain already in flight");
                    continue;
                }
                if !self.is_ready() {
                    trace!(target: LOG_QUEUE, "Not ready to drain");
                    continue;
                }
                if matches!(timer, Some((_, Timer::Retry))) {
                    debug!(target: LOG_QUEUE, "Draining before the retry timer expired");
                }
            } else if !self.is_ready() {
                debug!(target: LOG_QUEUE, "No longer ready, pausing drain");
                self.set_state(DrainState::Idle);
                timer = None;
                continue;
            }

            self.set_state(DrainState::Draining);
            match self.drain_step().await {
                Ok(StepOutcome::Continue) => {
                    backoff = None;
                    timer = Some((Instant::now() + self.config.batch_spacing, Timer::Continue));
                }
                Ok(StepOutcome::Drained) => {
                    backoff = None;
                    timer = None;
                    self.set_state(DrainState::Idle);
                    self.emit(QueueEvent::Drained);
                }
                Ok(StepOutcome::Retry) => {
                    let delay = backoff
                        .get_or_insert_with(|| {
                            doubling_backoff(
                                self.config.retry_base_delay,
                                self.config.retry_max_delay,
                            )
                        })
                        .next()
                        .unwrap_or(self.config.retry_max_delay);
                    warn!(target: LOG_QUEUE, ?delay, "Group update failed, retrying later");
                    QUEUE_RETRY_WAITS_TOTAL.inc();
                    // triggers that came in during the failed attempt must not cut the wait short
                    wakeup_rx.borrow_and_update();
                    timer = Some((Instant::now() + delay, Timer::Retry));
                    self.set_state(DrainState::Idle);
                    self.emit(QueueEvent::RetryScheduled { delay });
                }
                Err(err) => {
                    error!(
                        target: LOG_QUEUE,
                        err = %err,
                        "Giving up on committing group message batch, halting queue"
                    );
                    self.set_state(DrainState::Halted);
                    self.emit(QueueEvent::Halted);
                    break;
                }
            }
        }
    }

    async fn drain_step(&self) -> anyhow::Result<StepOutcome> {
        let batch_size = self.config.batch_size_for(self.in_background());
        let jobs = self
            .db
            .begin_read_transaction()
            .await
            .next_jobs(batch_size)
            .await;
        if jobs.is_empty() {
            debug!(target: LOG_QUEUE, "Group message queue drained");
            return Ok(StepOutcome::Drained);
        }
        let fetched = jobs.len();

        match self.plan_batch(jobs).await {
            Batch::NoUpdate(infos) => {
                self.commit_batch(&infos, BatchAction::Process, fetched)
                    .await?;
                Ok(StepOutcome::Continue)
            }
            Batch::Update(info) => match self.reconciler.reconcile(&info).await {
                UpdateOutcome::SuccessShouldProcess => {
                    self.commit_batch(std::slice::from_ref(&info), BatchAction::Process, 1)
                        .await?;
                    Ok(StepOutcome::Continue)
                }
                UpdateOutcome::FailureShouldDiscard => {
                    info!(
                        target: LOG_QUEUE,
                        job_id = %info.job_id,
                        "Group update failed permanently, dropping message"
                    );
                    self.commit_batch(
                        std::slice::from_ref(&info),
                        BatchAction::DropFailedUpdate,
                        1,
                    )
                    .await?;
                    Ok(StepOutcome::Continue)
                }
                UpdateOutcome::FailureShouldRetry => Ok(StepOutcome::Retry),
            },
        }
    }

    /// Run `action` on `infos` in a write transaction and commit it
    ///
    /// A failed commit (e.g. a write conflict with the host) reruns the whole
    /// batch in a fresh transaction, so nothing the sink or notifier wrote in
    /// the failed attempt survives. Errors only once
    /// [`MAX_BATCH_COMMIT_ATTEMPTS`] commits failed.
    async fn commit_batch(
        &self,
        infos: &[JobInfo],
        action: BatchAction,
        batch_size: usize,
    ) -> anyhow::Result<()> {
        let (processed, remaining) = self
            .db
            .autocommit(
                |dbtx| {
                    Box::pin(async move {
                        let processed = match action {
                            BatchAction::Process => self.process_locally(dbtx, infos).await,
                            BatchAction::DropFailedUpdate => {
                                dbtx.on_commit(|| {
                                    QUEUE_JOBS_DISCARDED_TOTAL
                                        .with_label_values(&["group_update_failed"])
                                        .inc();
                                });
                                infos.iter().map(|info| info.job_id).collect()
                            }
                        };
                        let remaining = self.remove_processed(dbtx, &processed, batch_size).await;
                        Ok::<_, Infallible>((processed, remaining))
                    })
                },
                Some(MAX_BATCH_COMMIT_ATTEMPTS),
            )
            .await
            .map_err(|err| match err {
                AutocommitError::CommitFailed {
                    attempts,
                    last_error,
                } => last_error.context(format!("Batch commit failed {attempts} times")),
                AutocommitError::ClosureError { error, .. } => match error {},
            })?;

        QUEUE_BATCH_JOBS.observe(processed.len() as f64);
        self.emit(QueueEvent::BatchCompleted {
            jobs: processed,
            remaining,
        });
        Ok(())
    }

    /// Resolve jobs in order until one needs a group update
    ///
    /// That job is only processed on its own, when it is at the head of the
    /// queue.
    async fn plan_batch(&self, jobs: Vec<(JobId, IncomingGroupJob)>) -> Batch {
        let gateway = self.collaborators.gateway.as_ref();
        let mut accepted = Vec::with_capacity(jobs.len());

        for (job_id, job) in jobs {
            let info = resolve(job_id, &job, gateway);
            let local_group = match info.group_id() {
                Some(group_id) => gateway.local_group(group_id).await,
                None => None,
            };

            if can_process_without_update(
                &info,
                self.collaborators.blocking.as_ref(),
                local_group.as_ref(),
            ) {
                accepted.push(info);
                continue;
            }

            if accepted.is_empty() {
                debug!(target: LOG_QUEUE, %job_id, "Job needs a group update");
                return Batch::Update(info);
            }
            debug!(
                target: LOG_QUEUE,
                %job_id,
                accepted = accepted.len(),
                "Job needs a group update, processing the jobs before it first"
            );
            break;
        }

        Batch::NoUpdate(accepted)
    }

    /// Deliver or discard each job, returning the ids that are done
    async fn process_locally(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        infos: &[JobInfo],
    ) -> Vec<JobId> {
        let gateway = self.collaborators.gateway.as_ref();
        let local_address = self.collaborators.host.local_address();
        let mut processed = Vec::with_capacity(infos.len());

        for info in infos {
            let local_group = match info.group_id() {
                Some(group_id) => gateway.local_group(group_id).await,
                None => None,
            };
            let membership = MembershipCheck::Enforce {
                local_address: local_address.as_ref(),
                local_group: local_group.as_ref(),
            };

            if let Some(reason) =
                must_discard(info, self.collaborators.blocking.as_ref(), membership)
            {
                info!(
                    target: LOG_QUEUE,
                    job_id = %info.job_id,
                    reason = reason.as_str(),
                    "Discarding group message"
                );
                dbtx.on_commit(move || {
                    QUEUE_JOBS_DISCARDED_TOTAL
                        .with_label_values(&[reason.as_str()])
                        .inc();
                });
                if reason.is_resolution_failure() {
                    self.notify_corrupted(dbtx).await;
                }
            } else {
                self.deliver(dbtx, info).await;
            }
            processed.push(info.job_id);

            if self.in_background() && processed.len() < infos.len() {
                info!(
                    target: LOG_QUEUE,
                    remaining = infos.len() - processed.len(),
                    "Entered background, stopping batch early"
                );
                break;
            }
        }

        processed
    }

    async fn deliver(&self, dbtx: &mut DatabaseTransaction<'_>, info: &JobInfo) {
        let (Some(envelope), Some(group_id)) = (&info.envelope, info.group_id()) else {
            // ruled out by `must_discard`
            return;
        };
        let delivery = Delivery {
            job_id: info.job_id,
            envelope: envelope.clone(),
            plaintext: info.job.plaintext.clone(),
            group_id: group_id.clone(),
            was_sealed_sender: info.job.was_sealed_sender,
        };

        dbtx.set_tx_savepoint()
            .await
            .expect("Setting transaction savepoint failed");
        match self.collaborators.sink.deliver(dbtx, &delivery).await {
            Ok(()) => {
                trace!(target: LOG_QUEUE_DELIVERY, job_id = %info.job_id, "Delivered group message");
                dbtx.on_commit(|| QUEUE_JOBS_DELIVERED_TOTAL.inc());
            }
            Err(err) => {
                warn!(
                    target: LOG_QUEUE_DELIVERY,
                    job_id = %info.job_id,
                    err = %err,
                    "Failed to deliver group message"
                );
                dbtx.rollback_tx_to_savepoint()
                    .await
                    .expect("Rolling back transaction to savepoint failed");
                self.notify_corrupted(dbtx).await;
            }
        }
    }

    async fn notify_corrupted(&self, dbtx: &mut DatabaseTransaction<'_>) {
        self.collaborators
            .notifier
            .notify_corrupted_message(dbtx)
            .await;
        dbtx.on_commit(|| QUEUE_CORRUPTED_NOTIFICATIONS_TOTAL.inc());
    }

    /// Remove processed jobs, returning how many are left in the queue
    async fn remove_processed(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        processed: &[JobId],
        batch_size: usize,
    ) -> usize {
        dbtx.remove_jobs(processed).await;
        let remaining = dbtx.job_count().await;
        info!(
            target: LOG_QUEUE,
            processed = processed.len(),
            batch_size,
            remaining,
            "Processed group message batch"
        );
        remaining
    }
}
