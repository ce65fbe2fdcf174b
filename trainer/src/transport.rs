//! Transports between the worker and the shards.
//!
//! `GrpcTransport` talks to remote ps servers, `LocalTransport` calls the handlers of `Ps` in the
//! same process. Both return `Status` so the retry layer handles them the same way.
use std::sync::Arc;

use anyhow::{bail, Result};
use log::{error, info};
use tonic::transport::Channel;
use tonic::{Request, Status};

use grpc::embedding::embedding_ps_client::EmbeddingPsClient;
use grpc::embedding::embedding_ps_server::EmbeddingPs;
use grpc::embedding::TensorMessage;
use ps::{get_ps_client, Ps, WorkerView};
use util::error_bail;

/// Rpc sent to one shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardMethod {
    Create,
    Pull,
    Push,
    Save,
    Restore,
}

impl ShardMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardMethod::Create => "create",
            ShardMethod::Pull => "pull",
            ShardMethod::Push => "push",
            ShardMethod::Save => "save",
            ShardMethod::Restore => "restore",
        }
    }
}

#[tonic::async_trait]
pub trait ShardTransport: Send + Sync {
    fn shard_num(&self) -> usize;

    /// Send one request to `shard`. `Create` replies with an empty `TensorMessage`.
    async fn call(
        &self,
        shard: usize,
        method: ShardMethod,
        request: TensorMessage,
    ) -> Result<TensorMessage, Status>;
}

fn shard_out_of_range(shard: usize, shard_num: usize) -> Status {
    Status::invalid_argument(format!(
        "shard {} out of range, shard_num: {}",
        shard, shard_num
    ))
}

/// One grpc client for each rank of the view.
pub struct GrpcTransport {
    clients: Vec<EmbeddingPsClient<Channel>>,
}

impl GrpcTransport {
    pub async fn connect(view: &WorkerView) -> Result<Self> {
        let endpoints = view.ordered_endpoints();

        if endpoints.len() != view.expected_workers as usize {
            error_bail!(
                "worker view is incomplete, expected_workers: {}, endpoints: {:?}",
                view.expected_workers,
                endpoints,
            );
        }

        let mut clients = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints.iter() {
            clients.push(get_ps_client(endpoint).await?);
        }

        info!(
            "connect to ps done, version: {}, endpoints: {}",
            view.version,
            endpoints.join(",")
        );

        Ok(Self { clients })
    }
}

#[tonic::async_trait]
impl ShardTransport for GrpcTransport {
    fn shard_num(&self) -> usize {
        self.clients.len()
    }

    async fn call(
        &self,
        shard: usize,
        method: ShardMethod,
        request: TensorMessage,
    ) -> Result<TensorMessage, Status> {
        let mut client = match self.clients.get(shard) {
            Some(x) => x.clone(),
            None => return Err(shard_out_of_range(shard, self.clients.len())),
        };

        let request = Request::new(request);

        match method {
            ShardMethod::Create => client.create(request).await.map(|_| TensorMessage::new()),
            ShardMethod::Pull => client.pull(request).await.map(|x| x.into_inner()),
            ShardMethod::Push => client.push(request).await.map(|x| x.into_inner()),
            ShardMethod::Save => client.save(request).await.map(|x| x.into_inner()),
            ShardMethod::Restore => client.restore(request).await.map(|x| x.into_inner()),
        }
    }
}

/// Shards served by `Ps` instances in the current process, index is the shard index.
pub struct LocalTransport {
    shards: Vec<Arc<Ps>>,
}

impl LocalTransport {
    pub fn new(shards: Vec<Arc<Ps>>) -> Self {
        Self { shards }
    }

    pub fn shard(&self, index: usize) -> Option<Arc<Ps>> {
        self.shards.get(index).cloned()
    }
}

#[tonic::async_trait]
impl ShardTransport for LocalTransport {
    fn shard_num(&self) -> usize {
        self.shards.len()
    }

    async fn call(
        &self,
        shard: usize,
        method: ShardMethod,
        request: TensorMessage,
    ) -> Result<TensorMessage, Status> {
        let ps = match self.shards.get(shard) {
            Some(x) => x.as_ref(),
            None => {
                error!("local shard {} not found", shard);
                return Err(shard_out_of_range(shard, self.shards.len()));
            }
        };

        let request = Request::new(request);

        match method {
            ShardMethod::Create => ps.create(request).await.map(|_| TensorMessage::new()),
            ShardMethod::Pull => ps.pull(request).await.map(|x| x.into_inner()),
            ShardMethod::Push => ps.push(request).await.map(|x| x.into_inner()),
            ShardMethod::Save => ps.save(request).await.map(|x| x.into_inner()),
            ShardMethod::Restore => ps.restore(request).await.map(|x| x.into_inner()),
        }
    }
}
