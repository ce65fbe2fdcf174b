//! Pull and push of sparse embeddings from the worker side.
//!
//! Ids are grouped by the shard router, one request is sent to each shard concurrently, and the
//! responses are merged. Every push to a shard carries a sequence token, retries of the same push
//! reuse the token so the shard can drop a replay.
//!
//! A push runs in its own task. If the caller stops waiting, the push still goes on, and its
//! result is reported by the next `pull`, `flush` or `checkpoint` of the client.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use hashbrown::HashMap;
use log::{error, info, warn};
use parking_lot::Mutex;
use prost::{Message, Name};
use tokio::task::{JoinHandle, JoinSet};

use grpc::embedding::{
    CheckpointResult, CreateOption, InitializerOption, InitializerType, OptimizerOption,
    PullOption, PushOption, PushResult, RestoreOption, Role, SaveOption, TensorMessage,
    TensorProto,
};
use grpc::tool::get_request_inner_options;
use ps::WorkerView;
use util::vector::split_rows;
use util::{error_bail, EmbeddingError, ShardRouter};

use crate::retry::{call_with_retry, RetryPolicy};
use crate::transport::{GrpcTransport, ShardMethod, ShardTransport};

/// Configuration of an embedding table, set when the model is compiled.
#[derive(Clone, Debug, PartialEq)]
pub struct TableConfig {
    pub varname: String,

    /// Dimension of each embedding vector.
    pub dim: usize,

    /// Ids must be less than vocabulary_size, 0 means unbounded.
    pub vocabulary_size: u64,

    pub initializer: InitializerOption,

    pub optimizer: OptimizerOption,
}

impl TableConfig {
    /// Table with uniform(-0.05, 0.05) initializer and sgd.
    pub fn new(varname: &str, dim: usize) -> Self {
        Self {
            varname: varname.to_string(),
            dim,
            vocabulary_size: 0,
            initializer: InitializerOption {
                r#type: InitializerType::InitUniform.into(),
                min: -0.05,
                max: 0.05,
                ..Default::default()
            },
            optimizer: OptimizerOption {
                name: "sgd".to_string(),
                learning_rate: 0.01,
                ..Default::default()
            },
        }
    }

    pub fn with_vocabulary_size(mut self, vocabulary_size: u64) -> Self {
        self.vocabulary_size = vocabulary_size;
        self
    }

    pub fn with_initializer(mut self, initializer: InitializerOption) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn with_constant_initializer(self, value: f32) -> Self {
        self.with_initializer(InitializerOption {
            r#type: InitializerType::InitConstant.into(),
            value,
            ..Default::default()
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.initializer.seed = Some(seed);
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerOption) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Optimizer with default hyper parameters except learning rate.
    pub fn with_optimizer_name(self, name: &str, learning_rate: f32) -> Self {
        self.with_optimizer(OptimizerOption {
            name: name.to_string(),
            learning_rate,
            ..Default::default()
        })
    }

    pub fn create_option(&self, shard_idx: u32, shard_num: u32) -> CreateOption {
        CreateOption {
            emb_size: self.dim as u32,
            vocabulary_size: self.vocabulary_size,
            shard_num,
            shard_idx,
            initializer: Some(self.initializer.clone()),
            optimizer: Some(self.optimizer.clone()),
            delete_var: false,
        }
    }
}

/// Result of one push over all shards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushAck {
    /// Number of distinct ids updated.
    pub updated_keys: u64,

    /// Number of gradient rows sent.
    pub contributions: u64,

    /// Shards that reported the push as a replay.
    pub duplicate_shards: usize,
}

impl PushAck {
    pub fn merge(&mut self, other: &PushAck) {
        self.updated_keys += other.updated_keys;
        self.contributions += other.contributions;
        self.duplicate_shards += other.duplicate_shards;
    }
}

/// Push dispatched to the shards whose result is not reported yet.
struct PendingPush {
    varname: String,
    step: u64,
    handle: JoinHandle<Result<PushAck>>,
}

/// Waits a push for the caller. If the caller goes away first, the push is handed to the client.
struct PushWaiter<'a> {
    client: &'a EmbeddingClient,
    pending: Option<PendingPush>,
}

impl PushWaiter<'_> {
    async fn wait(&mut self) -> Result<PushAck> {
        let res = match self.pending.as_mut() {
            Some(x) => (&mut x.handle).await,
            None => return Ok(PushAck::default()),
        };

        match self.pending.take() {
            Some(x) => join_push(&x, res),
            None => Ok(PushAck::default()),
        }
    }
}

impl Drop for PushWaiter<'_> {
    fn drop(&mut self) {
        if let Some(x) = self.pending.take() {
            warn!(
                "stop waiting push, varname: {}, step: {}, result is reported by next pull or flush",
                x.varname, x.step,
            );

            self.client.pending.lock().push_back(x);
        }
    }
}

fn join_push(
    pending: &PendingPush,
    res: Result<Result<PushAck>, tokio::task::JoinError>,
) -> Result<PushAck> {
    let res = match res {
        Ok(x) => x,
        Err(err) => Err(anyhow!("push task panic, error: {}", err)),
    };

    if let Err(err) = res.as_ref() {
        error!(
            "push failed, varname: {}, step: {}, error: {:#}",
            pending.varname, pending.step, err,
        );
    }

    res
}

pub struct EmbeddingClient {
    /// Rank of the worker, sent as role_id of push.
    rank: u32,

    transport: Arc<dyn ShardTransport>,

    router: ShardRouter,

    policy: RetryPolicy,

    checkpoint_policy: RetryPolicy,

    /// Next push token of each shard.
    seq_ids: Vec<AtomicU64>,

    /// Dimension of known tables.
    dims: DashMap<String, usize>,

    /// Pushes nobody is waiting for, in dispatch order.
    pending: Mutex<VecDeque<PendingPush>>,
}

impl EmbeddingClient {
    pub fn new(rank: u32, transport: Arc<dyn ShardTransport>, policy: RetryPolicy) -> Result<Self> {
        let router = ShardRouter::new(transport.shard_num())?;

        // Tokens start from a random base, so a restarted worker does not collide with the tokens
        // remembered by the shards.
        let seq_ids = (0..router.shard_num())
            .map(|_| AtomicU64::new(((rand::random::<u32>() as u64) | 1) << 32))
            .collect();

        Ok(Self {
            rank,
            transport,
            router,
            policy,
            checkpoint_policy: RetryPolicy::checkpoint(),
            seq_ids,
            dims: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Client of the ps servers in the view.
    pub async fn connect(rank: u32, view: &WorkerView, policy: RetryPolicy) -> Result<Self> {
        let transport = GrpcTransport::connect(view).await?;
        Self::new(rank, Arc::new(transport), policy)
    }

    pub fn with_checkpoint_policy(mut self, policy: RetryPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    #[inline]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    #[inline]
    pub fn shard_num(&self) -> usize {
        self.router.shard_num()
    }

    pub fn dim(&self, varname: &str) -> Result<usize> {
        match self.dims.get(varname) {
            Some(x) => Ok(*x),
            None => Err(EmbeddingError::UnknownTable(varname.to_string()).into()),
        }
    }

    fn next_seq_id(&self, shard: usize) -> u64 {
        self.seq_ids[shard].fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn pending_pushes(&self) -> usize {
        self.pending.lock().len()
    }

    async fn fan_out(
        &self,
        method: ShardMethod,
        requests: Vec<(usize, TensorMessage)>,
        policy: &RetryPolicy,
    ) -> Result<Vec<(usize, TensorMessage)>> {
        fan_out(self.transport.clone(), method, requests, policy.clone()).await
    }

    /// Same option to every shard.
    fn broadcast<M: Message + Name>(&self, varname: &str, option: &M) -> Result<Vec<(usize, TensorMessage)>> {
        let mut requests = Vec::with_capacity(self.shard_num());

        for shard in 0..self.shard_num() {
            requests.push((
                shard,
                TensorMessage::with_option(Role::Trainer, self.rank, varname, option)?,
            ));
        }

        Ok(requests)
    }

    /// Create the table on every shard. Creating an existing table with the same config is a no-op,
    /// so every worker may call it.
    pub async fn create_table(&self, config: &TableConfig) -> Result<()> {
        if config.dim == 0 || config.varname.is_empty() {
            return Err(EmbeddingError::invalid_config(format!(
                "table must have a name and dim > 0, varname: {}, dim: {}",
                config.varname, config.dim
            ))
            .into());
        }

        let shard_num = self.shard_num() as u32;

        let mut requests = Vec::with_capacity(self.shard_num());
        for shard in 0..shard_num {
            let option = config.create_option(shard, shard_num);
            requests.push((
                shard as usize,
                TensorMessage::with_option(Role::Trainer, self.rank, &config.varname, &option)?,
            ));
        }

        self.fan_out(ShardMethod::Create, requests, &self.policy).await?;
        self.dims.insert(config.varname.clone(), config.dim);

        info!(
            "create table done, varname: {}, dim: {}, optimizer: {}, shard_num: {}",
            config.varname, config.dim, config.optimizer.name, shard_num,
        );

        Ok(())
    }

    /// Lookup vectors of ids, one vector for each distinct id.
    ///
    /// Pending pushes are finished first, the error of a failed one is returned.
    pub async fn pull(&self, varname: &str, ids: &[u64], step: u64) -> Result<HashMap<u64, Vec<f32>>> {
        let dim = self.dim(varname)?;

        self.flush().await?;

        let groups = self.router.regroup_unique(ids);
        let unique_count: usize = groups.values().map(|x| x.len()).sum();

        let mut requests = Vec::with_capacity(groups.len());
        for (shard, shard_ids) in groups.into_iter() {
            let mut request =
                TensorMessage::with_option(Role::Trainer, self.rank, varname, &PullOption { step })?;
            request.tensor1 = Some(TensorProto::with_u64_vec(shard_ids));

            requests.push((shard, request));
        }

        let responses = self.fan_out(ShardMethod::Pull, requests, &self.policy).await?;

        let mut res: HashMap<u64, Vec<f32>> = HashMap::with_capacity(unique_count);

        for (shard, response) in responses.iter() {
            let shard_ids = response.ids();
            let values = response.values();

            if values.len() != shard_ids.len() * dim {
                return Err(EmbeddingError::dimension_mismatch(
                    dim,
                    values.len() / shard_ids.len().max(1),
                )
                .into());
            }

            for (id, row) in shard_ids.iter().zip(split_rows(values, dim)?) {
                if self.router.route(*id) != *shard {
                    error_bail!("shard {} returned id {} of other shard", shard, id);
                }

                res.insert(*id, row);
            }
        }

        if res.len() != unique_count {
            error_bail!(
                "pull returned {} ids, requested {}, varname: {}",
                res.len(),
                unique_count,
                varname,
            );
        }

        Ok(res)
    }

    /// Send the push in a new task, `None` if there is nothing to push.
    fn dispatch_push(&self, varname: &str, ids: &[u64], grads: &[f32], step: u64) -> Result<Option<PendingPush>> {
        let dim = self.dim(varname)?;

        if grads.len() != ids.len() * dim {
            let actual = grads.len() / ids.len().max(1);
            return Err(EmbeddingError::dimension_mismatch(dim, actual).into());
        }

        if ids.is_empty() {
            return Ok(None);
        }

        let groups = self.router.regroup_with_values(ids, grads, dim)?;

        let mut requests = Vec::with_capacity(groups.len());
        for (shard, (shard_ids, shard_grads)) in groups.into_iter() {
            let mut request =
                TensorMessage::with_option(Role::Trainer, self.rank, varname, &PushOption { step })?;
            request.seq_id = self.next_seq_id(shard);
            request.tensor1 = Some(TensorProto::with_u64_vec(shard_ids));
            request.tensor2 = Some(TensorProto::with_f32_vec(shard_grads, dim));

            requests.push((shard, request));
        }

        let transport = self.transport.clone();
        let policy = self.policy.clone();
        let name = varname.to_string();

        let handle = tokio::spawn(async move {
            let responses = fan_out(transport, ShardMethod::Push, requests, policy).await?;
            merge_push_results(&name, step, &responses)
        });

        Ok(Some(PendingPush {
            varname: varname.to_string(),
            step,
            handle,
        }))
    }

    /// Push gradients, `grads` has `dim` floats for each id. Ids may repeat, the shard sums them.
    ///
    /// If the returned future is dropped before it finishes, the push goes on and its result is
    /// reported by the next `pull` or `flush`.
    pub async fn push(&self, varname: &str, ids: &[u64], grads: &[f32], step: u64) -> Result<PushAck> {
        let pending = self.dispatch_push(varname, ids, grads, step)?;

        let mut waiter = PushWaiter {
            client: self,
            pending,
        };

        waiter.wait().await
    }

    /// Push gradients without waiting, the result is reported by the next `pull` or `flush`.
    pub fn push_in_background(&self, varname: &str, ids: &[u64], grads: &[f32], step: u64) -> Result<()> {
        if let Some(x) = self.dispatch_push(varname, ids, grads, step)? {
            self.pending.lock().push_back(x);
        }

        Ok(())
    }

    /// Wait all pending pushes. The first error is returned after all of them finish.
    pub async fn flush(&self) -> Result<PushAck> {
        let mut ack = PushAck::default();
        let mut first_error: Option<anyhow::Error> = None;

        loop {
            let pending = self.pending.lock().pop_front();

            let mut waiter = match pending {
                Some(x) => PushWaiter {
                    client: self,
                    pending: Some(x),
                },
                None => break,
            };

            match waiter.wait().await {
                Ok(x) => ack.merge(&x),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(ack),
        }
    }

    async fn save(&self, path: &str, include_optimizer: bool) -> Result<u64> {
        let option = SaveOption {
            path: path.to_string(),
            include_optimizer,
        };

        let requests = self.broadcast("", &option)?;
        let responses = self.fan_out(ShardMethod::Save, requests, &self.checkpoint_policy).await?;

        sum_record_count(&responses)
    }

    /// Save all tables with optimizer state, after pending pushes of this client are finished.
    pub async fn checkpoint(&self, path: &str) -> Result<u64> {
        self.flush().await?;

        let record_count = self.save(path, true).await?;
        info!("checkpoint done, path: {}, record_count: {}", path, record_count);

        Ok(record_count)
    }

    /// Save all tables without optimizer state, for serving.
    pub async fn export(&self, path: &str) -> Result<u64> {
        self.flush().await?;

        let record_count = self.save(path, false).await?;
        info!("export done, path: {}, record_count: {}", path, record_count);

        Ok(record_count)
    }

    /// Restore all tables from checkpoint. Tables must be created first.
    pub async fn restore(&self, path: &str) -> Result<u64> {
        let option = RestoreOption {
            path: path.to_string(),
        };

        let requests = self.broadcast("", &option)?;
        let responses = self.fan_out(ShardMethod::Restore, requests, &self.checkpoint_policy).await?;

        let record_count = sum_record_count(&responses)?;
        info!("restore done, path: {}, record_count: {}", path, record_count);

        Ok(record_count)
    }
}

impl Drop for EmbeddingClient {
    fn drop(&mut self) {
        let pending = self.pending.get_mut();

        if !pending.is_empty() {
            error!(
                "embedding client dropped with {} pushes not reported, first varname: {}, step: {}",
                pending.len(),
                pending[0].varname,
                pending[0].step,
            );
        }
    }
}

/// Send requests concurrently, wait all of them. The first error is returned after all requests
/// finish.
async fn fan_out(
    transport: Arc<dyn ShardTransport>,
    method: ShardMethod,
    requests: Vec<(usize, TensorMessage)>,
    policy: RetryPolicy,
) -> Result<Vec<(usize, TensorMessage)>> {
    let mut tasks = JoinSet::new();

    for (shard, request) in requests {
        let transport = transport.clone();
        let policy = policy.clone();

        tasks.spawn(async move {
            let res = call_with_retry(transport.as_ref(), &policy, shard, method, request).await;
            (shard, res)
        });
    }

    let mut responses = Vec::with_capacity(tasks.len());
    let mut first_error: Option<anyhow::Error> = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((shard, Ok(response))) => responses.push((shard, response)),
            Ok((shard, Err(err))) => {
                error!("{} to shard {} failed, error: {:#}", method.as_str(), shard, err);
                first_error.get_or_insert(err);
            }
            Err(err) => {
                first_error.get_or_insert(anyhow!("{} task panic, error: {}", method.as_str(), err));
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(responses),
    }
}

fn merge_push_results(varname: &str, step: u64, responses: &[(usize, TensorMessage)]) -> Result<PushAck> {
    let mut ack = PushAck::default();

    for (shard, response) in responses.iter() {
        let result = match get_request_inner_options::<PushResult>(response) {
            Some(x) => x,
            None => {
                error_bail!("invalid push response from shard {}, varname: {}", shard, varname);
            }
        };

        if result.duplicate {
            warn!(
                "push to shard {} acknowledged as duplicate, varname: {}, step: {}",
                shard, varname, step,
            );
        }

        ack.merge(&PushAck {
            updated_keys: result.updated_keys as u64,
            contributions: result.contributions as u64,
            duplicate_shards: result.duplicate as usize,
        });
    }

    Ok(ack)
}

fn sum_record_count(responses: &[(usize, TensorMessage)]) -> Result<u64> {
    let mut total: u64 = 0;

    for (shard, response) in responses.iter() {
        match get_request_inner_options::<CheckpointResult>(response) {
            Some(x) => total += x.record_count,
            None => {
                error_bail!("invalid checkpoint response from shard {}", shard);
            }
        }
    }

    Ok(total)
}
