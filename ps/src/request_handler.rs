use std::sync::Arc;

use anyhow::{bail, Result};
use coarsetime::Instant;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use prost::{Message, Name};
use tonic::{Request, Response, Status};

use grpc::embedding::embedding_ps_server::EmbeddingPs;
use grpc::embedding::{
    CheckpointResult, CreateOption, PullOption, PushOption, PushResult, RegisterOption,
    RestoreOption, Role, SaveOption, TensorMessage, TensorProto, VoidMessage,
};
use grpc::tool::{get_request_inner_options, send_bad_request_error};
use util::histogram::{record_time, Histogram, HistogramType};
use util::{error_bail, EmbeddingError};

use crate::aggregator::aggregate;
use crate::checkpoint::restore_task::RestoreSparseFromLocalTask;
use crate::checkpoint::save_task::SaveSparseToLocalTask;
use crate::checkpoint::tool::CheckpointContext;
use crate::coordinator::{Coordinator, MembershipState};
use crate::embedding::Embedding;
use crate::env::Env;
use crate::push_tracker::{PushTicket, PushTracker};
use crate::tool::send_embedding_error;
use crate::variable_manager::EmbeddingManager;

/// Ps server.
///
/// Hosts one shard of every embedding table, handles create, pull, push and checkpoint requests
/// from trainers. The scheduler ps also handles the registration of workers.
pub struct Ps {
    /// Sparse embedding manager, add, remove, or update embedding parameters.
    embedding_manager: Arc<EmbeddingManager>,

    /// Recent push tokens of each worker.
    push_tracker: Arc<PushTracker>,

    /// Membership and in-flight requests.
    coordinator: Arc<Coordinator>,

    /// Global Env for all request.
    env: Arc<Env>,

    /// Time spent of requests.
    histogram: Mutex<Histogram>,
}

impl Ps {
    /// Ps whose statistics are kept locally.
    pub fn new(env: Env) -> Self {
        Self::with_histogram(env, Histogram::default())
    }

    pub fn with_histogram(env: Env, histogram: Histogram) -> Self {
        let push_tracker = Arc::new(PushTracker::new(env.max_push_record_size));
        let coordinator = Arc::new(Coordinator::new(env.expected_workers, env.elastic));

        Self {
            embedding_manager: Arc::new(EmbeddingManager::default()),
            push_tracker,
            coordinator,
            env: Arc::new(env),
            histogram: Mutex::new(histogram),
        }
    }

    #[inline]
    pub fn env(&self) -> Arc<Env> {
        self.env.clone()
    }

    #[inline]
    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    #[inline]
    pub fn embedding_manager(&self) -> Arc<EmbeddingManager> {
        self.embedding_manager.clone()
    }

    #[inline]
    fn record_time(&self, histogram_type: HistogramType, start: Instant) {
        record_time(&mut self.histogram.lock(), histogram_type, start);
    }

    /// Response envelope with options.
    fn response_with_option<M: Message + Name>(&self, varname: &str, option: &M) -> Result<TensorMessage> {
        TensorMessage::with_option(Role::Ps, self.env.rank, varname, option)
    }

    /// Create embedding variable by create_option.
    fn create_embedding_variable(&self, varname: &str, create_option: &CreateOption) -> Result<()> {
        if create_option.shard_num == self.env.expected_workers
            && create_option.shard_idx != self.env.rank
        {
            return Err(EmbeddingError::invalid_config(format!(
                "shard_idx must be rank of ps, varname: {}, shard_idx: {}, rank: {}",
                varname, create_option.shard_idx, self.env.rank
            ))
            .into());
        }

        self.embedding_manager.add_new_var(varname, create_option)
    }

    /// Pull sparse parameters, unseen signs are initialized.
    fn pull_sparse(&self, request: &TensorMessage) -> Result<TensorMessage> {
        let varname = &request.varname;
        let embedding = self.embedding_manager.get_or_err(varname)?;

        let signs = request.ids();

        let mut values: Vec<f32> = Vec::with_capacity(signs.len() * embedding.embedding_size);
        embedding.lookup(signs, &mut values)?;

        Ok(TensorMessage {
            role: Role::Ps.into(),
            role_id: self.env.rank,
            seq_id: request.seq_id,
            varname: varname.clone(),
            options: None,
            tensor1: Some(TensorProto::with_u64_vec(signs.to_vec())),
            tensor2: Some(TensorProto::with_f32_vec(values, embedding.embedding_size)),
        })
    }

    /// Push gradients of sparse parameters of training step `step`.
    ///
    /// Gradients of same sign are summed, then each sign gets one optimizer step. A push whose
    /// `seq_id` is already recorded for the worker is acknowledged with the result of the first
    /// copy without being applied again. If the first copy is still applying, the reply waits
    /// for it.
    async fn push_sparse(&self, request: &TensorMessage, step: u64) -> Result<PushResult> {
        let varname = &request.varname;
        let embedding = self.embedding_manager.get_or_err(varname)?;

        let grad_dim = request.tensor2.as_ref().map(|x| x.last_dim()).unwrap_or(0);
        if grad_dim != 0 && grad_dim != embedding.embedding_size {
            return Err(EmbeddingError::dimension_mismatch(embedding.embedding_size, grad_dim).into());
        }

        let aggregated = aggregate(request.ids(), request.values(), embedding.embedding_size)?;
        embedding.check_signs(&aggregated.signs)?;

        let worker = request.role_id;
        let seq_id = request.seq_id;

        loop {
            let first = match self.push_tracker.begin(worker, varname, seq_id) {
                PushTicket::Apply(guard) => {
                    // The guard forgets the token if apply fails.
                    let updated = embedding.apply_gradients(&aggregated, step)?;

                    let push_result = PushResult {
                        duplicate: false,
                        updated_keys: updated as u32,
                        contributions: aggregated.contributions as u32,
                    };
                    guard.finish(&push_result);

                    return Ok(push_result);
                }
                PushTicket::Applied(x) => x,
                PushTicket::Applying(receiver) => {
                    info!(
                        "push is applying, wait for it, worker: {}, seq_id: {}, varname: {}",
                        worker, seq_id, varname,
                    );

                    match PushTracker::wait(receiver).await {
                        Some(x) => x,
                        None => continue,
                    }
                }
            };

            warn!(
                "{}, varname: {}, ignored",
                EmbeddingError::DuplicatePush { worker, seq_id },
                varname,
            );

            return Ok(PushResult {
                duplicate: true,
                ..first
            });
        }
    }

    /// Embeddings selected by varname, all embeddings if varname is empty.
    fn select_embeddings(&self, varname: &str) -> Result<Vec<Arc<Embedding>>> {
        if varname.is_empty() {
            Ok(self
                .embedding_manager
                .varnames()
                .iter()
                .filter_map(|x| self.embedding_manager.get(x))
                .collect())
        } else {
            Ok(vec![self.embedding_manager.get_or_err(varname)?])
        }
    }

    fn checkpoint_context(&self, path: &str, embedding: &Embedding, include_optimizer: bool) -> CheckpointContext {
        CheckpointContext {
            path: path.to_string(),
            varname: embedding.varname.clone(),
            shard_index: embedding.shard_index as u32,
            shard_num: embedding.shard_num as u32,
            include_optimizer,
            max_record_iterate_count: self.env.max_record_iterate_count,
        }
    }

    /// Save sparse embedding.
    ///
    /// Each variable is saved in a blocking task, errors of all tasks are collected.
    async fn save_sparse_variables(&self, varname: &str, option: &SaveOption) -> Result<CheckpointResult> {
        if option.path.is_empty() {
            error_bail!("save path is empty, varname: {}", varname);
        }

        let start = Instant::now();
        let embeddings = self.select_embeddings(varname)?;

        let mut handles = Vec::with_capacity(embeddings.len());

        for embedding in embeddings {
            let context = self.checkpoint_context(&option.path, &embedding, option.include_optimizer);

            handles.push(tokio::task::spawn_blocking(move || {
                SaveSparseToLocalTask::new(&context).run(&embedding)
            }));
        }

        let record_count = collect_task_results("save", handles).await?;

        Ok(CheckpointResult {
            record_count,
            time_cost_in_ms: start.elapsed().as_millis() as i64,
        })
    }

    /// Restore sparse embedding.
    ///
    /// Tables must be created before restoring, the checkpoint must have the same shard num and
    /// embedding size.
    async fn restore_sparse_variables(
        &self,
        varname: &str,
        option: &RestoreOption,
    ) -> Result<CheckpointResult> {
        if option.path.is_empty() {
            error_bail!("restore path is empty, varname: {}", varname);
        }

        let start = Instant::now();
        let embeddings = self.select_embeddings(varname)?;

        let mut handles = Vec::with_capacity(embeddings.len());

        for embedding in embeddings {
            let context = self.checkpoint_context(&option.path, &embedding, true);

            handles.push(tokio::task::spawn_blocking(move || {
                RestoreSparseFromLocalTask::new(&context).run(&embedding)
            }));
        }

        let record_count = collect_task_results("restore", handles).await?;

        Ok(CheckpointResult {
            record_count,
            time_cost_in_ms: start.elapsed().as_millis() as i64,
        })
    }

    fn register_worker(&self, option: &RegisterOption) -> Result<TensorMessage> {
        if !self.env.is_scheduler {
            return Err(EmbeddingError::invalid_config(format!(
                "ps {} is not scheduler, scheduler: {}",
                self.env.rank, self.env.scheduler
            ))
            .into());
        }

        let mut view = self.coordinator.register(option.rank, &option.endpoint)?;

        info!(
            "register worker, rank: {}, endpoint: {}, state: {}, version: {}",
            option.rank, option.endpoint, view.state, view.version,
        );

        // Shards are not moved on join, the new view is complete once published.
        if view.state == MembershipState::Resharding {
            view = self.coordinator.finish_resharding()?;

            info!(
                "resharding done, workers: {}, version: {}",
                view.endpoints.len(),
                view.version,
            );
        }

        self.response_with_option("", &view.to_option())
    }
}

/// Wait all tasks, sum the record counts. The first error is returned after all tasks finish.
async fn collect_task_results(
    name: &str,
    handles: Vec<tokio::task::JoinHandle<Result<u64>>>,
) -> Result<u64> {
    let mut total: u64 = 0;
    let mut first_error: Option<anyhow::Error> = None;

    for handle in handles {
        let res = match handle.await {
            Ok(x) => x,
            Err(err) => Err(anyhow::anyhow!("{} task panic, error: {}", name, err)),
        };

        match res {
            Ok(count) => total += count,
            Err(err) => {
                error!("{} task failed, error: {:#}", name, err);

                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(total),
    }
}

#[tonic::async_trait]
impl EmbeddingPs for Ps {
    /// Create embedding table of current shard.
    async fn create(&self, request: Request<TensorMessage>) -> Result<Response<VoidMessage>, Status> {
        let start = Instant::now();
        let request_inner = request.into_inner();
        let varname = &request_inner.varname;

        // Get create_option from request.options.
        let create_option = match get_request_inner_options::<CreateOption>(&request_inner) {
            Some(x) => x,
            None => {
                return send_bad_request_error("options", "options is invalid CreateOption.");
            }
        };

        let res = self.create_embedding_variable(varname, &create_option);
        self.record_time(HistogramType::PsCreate, start);

        match res {
            Ok(_) => Ok(Response::new(VoidMessage::default())),
            Err(err) => send_embedding_error(&format!("create embedding variable {}", varname), err),
        }
    }

    /// Pull the parameters of signs in tensor1.
    async fn pull(&self, request: Request<TensorMessage>) -> Result<Response<TensorMessage>, Status> {
        let _guard = match self.coordinator.begin_request() {
            Ok(x) => x,
            Err(err) => return send_embedding_error("pull", err),
        };

        let request_inner = request.into_inner();

        if let Some(option) = get_request_inner_options::<PullOption>(&request_inner) {
            debug!("pull, varname: {}, step: {}", request_inner.varname, option.step);
        }

        let start = Instant::now();
        let res = self.pull_sparse(&request_inner);
        self.record_time(HistogramType::PsPull, start);

        match res {
            Ok(response) => Ok(Response::new(response)),
            Err(err) => send_embedding_error(&format!("pull sparse {}", request_inner.varname), err),
        }
    }

    /// Push the gradients of signs in tensor1, gradients are in tensor2.
    async fn push(&self, request: Request<TensorMessage>) -> Result<Response<TensorMessage>, Status> {
        let _guard = match self.coordinator.begin_request() {
            Ok(x) => x,
            Err(err) => return send_embedding_error("push", err),
        };

        let request_inner = request.into_inner();

        let step = match get_request_inner_options::<PushOption>(&request_inner) {
            Some(option) => option.step,
            None => 0,
        };
        debug!("push, varname: {}, step: {}", request_inner.varname, step);

        let varname = &request_inner.varname;

        let start = Instant::now();
        let res = match self.push_sparse(&request_inner, step).await {
            Ok(push_result) => self.response_with_option(varname, &push_result),
            Err(err) => Err(err),
        };
        self.record_time(HistogramType::PsPush, start);

        match res {
            Ok(response) => Ok(Response::new(response)),
            Err(err) => send_embedding_error(&format!("push sparse {}", varname), err),
        }
    }

    /// Save one table, or all tables when varname is empty.
    async fn save(&self, request: Request<TensorMessage>) -> Result<Response<TensorMessage>, Status> {
        let request_inner = request.into_inner();
        let varname = &request_inner.varname;

        let save_option = match get_request_inner_options::<SaveOption>(&request_inner) {
            Some(x) => x,
            None => {
                return send_bad_request_error("options", "options is invalid SaveOption!");
            }
        };

        let start = Instant::now();
        let res = match self.save_sparse_variables(varname, &save_option).await {
            Ok(x) => self.response_with_option(varname, &x),
            Err(err) => Err(err),
        };
        self.record_time(HistogramType::PsSave, start);

        match res {
            Ok(response) => Ok(Response::new(response)),
            Err(err) => send_embedding_error(&format!("save sparse variable {}", varname), err),
        }
    }

    /// Restore one table, or all tables when varname is empty.
    async fn restore(&self, request: Request<TensorMessage>) -> Result<Response<TensorMessage>, Status> {
        let request_inner = request.into_inner();
        let varname = &request_inner.varname;

        let restore_option = match get_request_inner_options::<RestoreOption>(&request_inner) {
            Some(x) => x,
            None => {
                return send_bad_request_error("options", "options is invalid RestoreOption!");
            }
        };

        let start = Instant::now();
        let res = match self.restore_sparse_variables(varname, &restore_option).await {
            Ok(x) => self.response_with_option(varname, &x),
            Err(err) => Err(err),
        };
        self.record_time(HistogramType::PsRestore, start);

        match res {
            Ok(response) => Ok(Response::new(response)),
            Err(err) => send_embedding_error(&format!("restore sparse variable {}", varname), err),
        }
    }

    /// Register a worker to scheduler.
    async fn register(&self, request: Request<TensorMessage>) -> Result<Response<TensorMessage>, Status> {
        let request_inner = request.into_inner();

        let register_option = match get_request_inner_options::<RegisterOption>(&request_inner) {
            Some(x) => x,
            None => {
                return send_bad_request_error("options", "options is invalid RegisterOption!");
            }
        };

        match self.register_worker(&register_option) {
            Ok(response) => Ok(Response::new(response)),
            Err(err) => send_embedding_error(&format!("register rank {}", register_option.rank), err),
        }
    }

    /// Current view of the cluster.
    async fn get_view(&self, _request: Request<TensorMessage>) -> Result<Response<TensorMessage>, Status> {
        let view = self.coordinator.view();

        match self.response_with_option("", &view.to_option()) {
            Ok(response) => Ok(Response::new(response)),
            Err(err) => send_embedding_error("get view", err),
        }
    }

    /// Stop accepting pull and push, in-flight requests are finished.
    async fn drain(&self, _request: Request<TensorMessage>) -> Result<Response<VoidMessage>, Status> {
        let state = self.coordinator.begin_drain();
        info!("drain requested, rank: {}, state: {}", self.env.rank, state);

        let coordinator = self.coordinator.clone();
        let timeout = self.env.drain_timeout;

        tokio::spawn(async move {
            if coordinator.wait_closed(timeout).await {
                info!("ps is closed");
            }
        });

        Ok(Response::new(VoidMessage::default()))
    }
}
