//! The tracker actor.
//!
//! Mutations and queries flow through bounded mailboxes into writer
//! shards. An instance id always hashes to the same shard, so per-id
//! ordering holds; distinct ids spread across
//! `instance_tracker_num_parallel_updates` shards and proceed in
//! parallel. Each shard persists an effect before replying and before
//! touching the next operation for that id, then publishes the effect's
//! events.
//!
//! A full mailbox fails the submission immediately instead of blocking;
//! a persistence failure stops the shard (fail-stop), and every later
//! caller sees `Stopped` — the driver treats that as a crash signal.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use strider_core::instance::{Instance, InstanceId};
use strider_core::{AbsolutePathId, SchedulerConfig};
use strider_events::EventBus;
use strider_state::InstanceRepository;

use crate::error::{TrackerError, TrackerResult};
use crate::updater::{apply, Effect, Op};

/// Tracker sizing and deadlines.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Total mailbox capacity, split across shards.
    pub queue_size: usize,
    /// Writer shards; per-id ordering holds within a shard.
    pub parallel_updates: usize,
    /// Deadline for both queries and update replies.
    pub timeout: Duration,
}

impl TrackerConfig {
    pub fn from_scheduler(config: &SchedulerConfig) -> Self {
        Self {
            queue_size: config.instance_tracker_update_queue_size,
            parallel_updates: config.instance_tracker_num_parallel_updates.max(1),
            timeout: Duration::from_millis(config.instance_tracker_query_timeout_millis),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from_scheduler(&SchedulerConfig::default())
    }
}

enum Request {
    Process {
        op: Op,
        reply: oneshot::Sender<TrackerResult<Effect>>,
    },
    Get {
        id: InstanceId,
        reply: oneshot::Sender<Option<Instance>>,
    },
    List {
        reply: oneshot::Sender<Vec<Instance>>,
    },
}

/// Handle to the tracker. Cheap to clone.
#[derive(Clone)]
pub struct InstanceTracker {
    shards: Arc<Vec<mpsc::Sender<Request>>>,
    timeout: Duration,
}

impl InstanceTracker {
    /// Recover persisted instances and start the writer shards.
    pub fn spawn(
        config: TrackerConfig,
        repository: InstanceRepository,
        bus: EventBus,
    ) -> TrackerResult<Self> {
        let shard_count = config.parallel_updates.max(1);
        let per_shard_capacity = (config.queue_size / shard_count).max(1);
        let version_counter = Arc::new(AtomicU64::new(strider_core::now_millis()));

        // Distribute recovered records to the shards that own them.
        let mut initial: Vec<HashMap<InstanceId, Instance>> =
            (0..shard_count).map(|_| HashMap::new()).collect();
        let recovered = repository.all()?;
        let recovered_count = recovered.len();
        for instance in recovered {
            let shard = shard_index(&instance.id, shard_count);
            initial[shard].insert(instance.id.clone(), instance);
        }

        let mut shards = Vec::with_capacity(shard_count);
        for instances in initial {
            let (tx, rx) = mpsc::channel(per_shard_capacity);
            let worker = ShardWorker {
                instances,
                repository: repository.clone(),
                bus: bus.clone(),
                version_counter: version_counter.clone(),
            };
            tokio::spawn(worker.run(rx));
            shards.push(tx);
        }

        info!(
            shards = shard_count,
            recovered = recovered_count,
            "instance tracker started"
        );
        Ok(Self {
            shards: Arc::new(shards),
            timeout: config.timeout,
        })
    }

    fn shard_for(&self, id: &InstanceId) -> &mpsc::Sender<Request> {
        &self.shards[shard_index(id, self.shards.len())]
    }

    fn submit(
        &self,
        shard: &mpsc::Sender<Request>,
        request: Request,
        id: &InstanceId,
    ) -> TrackerResult<()> {
        shard.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TrackerError::QueueFull(id.to_string()),
            mpsc::error::TrySendError::Closed(_) => TrackerError::Stopped,
        })
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>) -> TrackerResult<T> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TrackerError::Stopped),
            Err(_) => Err(TrackerError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    /// Serialize one operation. Accepted operations run even if this
    /// caller times out waiting.
    pub async fn process(&self, op: Op) -> TrackerResult<Effect> {
        let id = op.instance_id().clone();
        let (reply, rx) = oneshot::channel();
        self.submit(self.shard_for(&id), Request::Process { op, reply }, &id)?;
        self.await_reply(rx).await?
    }

    /// A consistent snapshot of one instance.
    pub async fn get(&self, id: &InstanceId) -> TrackerResult<Option<Instance>> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            self.shard_for(id),
            Request::Get {
                id: id.clone(),
                reply,
            },
            id,
        )?;
        self.await_reply(rx).await
    }

    /// All instances, merged across shards.
    pub async fn list(&self) -> TrackerResult<Vec<Instance>> {
        let mut receivers = Vec::with_capacity(self.shards.len());
        for shard in self.shards.iter() {
            let (reply, rx) = oneshot::channel();
            shard
                .try_send(Request::List { reply })
                .map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => {
                        TrackerError::QueueFull("list".to_string())
                    }
                    mpsc::error::TrySendError::Closed(_) => TrackerError::Stopped,
                })?;
            receivers.push(rx);
        }
        let mut out = Vec::new();
        for rx in receivers {
            out.extend(self.await_reply(rx).await?);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Instances of one run spec.
    pub async fn by_run_spec(&self, run_spec_id: &AbsolutePathId) -> TrackerResult<Vec<Instance>> {
        let all = self.list().await?;
        Ok(all
            .into_iter()
            .filter(|i| i.run_spec_id() == run_spec_id)
            .collect())
    }
}

fn shard_index(id: &InstanceId, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

struct ShardWorker {
    instances: HashMap<InstanceId, Instance>,
    repository: InstanceRepository,
    bus: EventBus,
    version_counter: Arc<AtomicU64>,
}

impl ShardWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Get { id, reply } => {
                    let _ = reply.send(self.instances.get(&id).cloned());
                }
                Request::List { reply } => {
                    let _ = reply.send(self.instances.values().cloned().collect());
                }
                Request::Process { op, reply } => {
                    let id = op.instance_id().clone();
                    let result = self.apply_and_persist(op);
                    let fatal = matches!(result, Err(TrackerError::State(_)));
                    if fatal {
                        // Diverging in-memory and durable state is not
                        // recoverable; stop the shard so the driver
                        // fail-stops the leader.
                        error!(instance = %id, "persistence failed, stopping tracker shard");
                        let _ = reply.send(result);
                        return;
                    }
                    let _ = reply.send(result);
                }
            }
        }
        debug!("tracker shard mailbox closed");
    }

    fn apply_and_persist(&mut self, op: Op) -> TrackerResult<Effect> {
        let id = op.instance_id().clone();
        let current = self.instances.get(&id);
        let effect = apply(current, op)?;
        match &effect {
            Effect::Update {
                instance, events, ..
            } => {
                let version = self.version_counter.fetch_add(1, Ordering::Relaxed);
                self.repository.put(instance, version)?;
                self.instances.insert(id, instance.clone());
                for event in events {
                    self.bus.publish(event.clone());
                }
            }
            Effect::Expunge { instance, events } => {
                self.repository.delete(&instance.id)?;
                self.instances.remove(&id);
                debug!(instance = %instance.id, "instance expunged");
                for event in events {
                    self.bus.publish(event.clone());
                }
            }
            Effect::Noop => {}
        }
        Ok(effect)
    }
}
