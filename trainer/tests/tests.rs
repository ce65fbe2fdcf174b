use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use log::info;
use rand::RngCore;
use tonic::Status;

use grpc::embedding::TensorMessage;
use tokio::time::timeout;
use ps::{Env, Ps};
use trainer::{
    EmbeddingClient, LocalTransport, RetryPolicy, ShardMethod, ShardTransport, TableConfig,
    WorkerSession,
};
use util::{init_log, EmbeddingError};

static INIT: Once = Once::new();

fn setup() {
    INIT.call_once(|| {
        init_log();
    });
}

fn temp_path(name: &str) -> String {
    let suffix = rand::thread_rng().next_u64();
    std::env::temp_dir()
        .join(format!("trainer_test_{}_{}", name, suffix))
        .to_string_lossy()
        .to_string()
}

fn local_cluster(shard_num: u32) -> Arc<LocalTransport> {
    let shards = (0..shard_num)
        .map(|rank| Arc::new(Ps::new(Env::with_rank(rank, shard_num))))
        .collect();

    Arc::new(LocalTransport::new(shards))
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_secs(1),
        max_retries: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

fn sgd_table(dim: usize) -> TableConfig {
    TableConfig::new("emb_0", dim)
        .with_constant_initializer(0.0)
        .with_optimizer_name("sgd", 1.0)
}

#[tokio::test]
async fn test_pull_push_two_shards() {
    setup();

    let client = EmbeddingClient::new(0, local_cluster(2), fast_policy()).unwrap();
    client.create_table(&sgd_table(4)).await.unwrap();

    let vectors = client.pull("emb_0", &[1, 2, 3, 2], 0).await.unwrap();
    assert_eq!(vectors.len(), 3);
    assert!(vectors.values().all(|x| x == &vec![0.0; 4]));

    // Same id twice in one push, one update with the summed gradient.
    let ack = client
        .push("emb_0", &[2, 2, 5], &[1.0; 12], 0)
        .await
        .unwrap();
    assert_eq!(ack.updated_keys, 2);
    assert_eq!(ack.contributions, 3);
    assert_eq!(ack.duplicate_shards, 0);

    let vectors = client.pull("emb_0", &[2, 5], 1).await.unwrap();
    assert_eq!(vectors[&2], vec![-2.0; 4]);
    assert_eq!(vectors[&5], vec![-1.0; 4]);
}

#[tokio::test]
async fn test_dimension_mismatch() {
    setup();

    let client = EmbeddingClient::new(0, local_cluster(2), fast_policy()).unwrap();
    client.create_table(&sgd_table(4)).await.unwrap();

    let err = client
        .push("emb_0", &[1, 2], &[1.0; 6], 0)
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<EmbeddingError>(),
        Some(&EmbeddingError::dimension_mismatch(4, 3))
    );

    let err = client.pull("emb_1", &[1], 0).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EmbeddingError>(),
        Some(EmbeddingError::UnknownTable(_))
    ));
}

#[tokio::test]
async fn test_seeded_tables_agree() {
    setup();

    let table = TableConfig::new("emb_0", 8).with_seed(11);

    let first = EmbeddingClient::new(0, local_cluster(2), fast_policy()).unwrap();
    first.create_table(&table).await.unwrap();

    let second = EmbeddingClient::new(0, local_cluster(3), fast_policy()).unwrap();
    second.create_table(&table).await.unwrap();

    let ids = [9u64, 4, 100, 7];
    let a = first.pull("emb_0", &ids, 0).await.unwrap();
    let b = second.pull("emb_0", &ids, 0).await.unwrap();

    for id in ids {
        assert_eq!(a[&id].len(), 8);
        assert_eq!(a[&id], b[&id]);
    }
}

/// Applies the first push, then reports it as lost.
struct LostReplyTransport {
    inner: Arc<LocalTransport>,
    lost: AtomicBool,
}

#[tonic::async_trait]
impl ShardTransport for LostReplyTransport {
    fn shard_num(&self) -> usize {
        self.inner.shard_num()
    }

    async fn call(
        &self,
        shard: usize,
        method: ShardMethod,
        request: TensorMessage,
    ) -> Result<TensorMessage, Status> {
        let response = self.inner.call(shard, method, request).await?;

        if method == ShardMethod::Push && !self.lost.swap(true, Ordering::SeqCst) {
            return Err(Status::unavailable("connection reset"));
        }

        Ok(response)
    }
}

#[tokio::test]
async fn test_retry_reuses_push_token() {
    setup();

    let transport = Arc::new(LostReplyTransport {
        inner: local_cluster(1),
        lost: AtomicBool::new(false),
    });

    let client = EmbeddingClient::new(0, transport, fast_policy()).unwrap();
    client.create_table(&sgd_table(4)).await.unwrap();

    let ack = client.push("emb_0", &[3], &[1.0; 4], 0).await.unwrap();
    assert_eq!(ack.duplicate_shards, 1);

    let vectors = client.pull("emb_0", &[3], 1).await.unwrap();
    assert_eq!(vectors[&3], vec![-1.0; 4]);

    // A new push gets a new token.
    let ack = client.push("emb_0", &[3], &[1.0; 4], 1).await.unwrap();
    assert_eq!(ack.duplicate_shards, 0);

    let vectors = client.pull("emb_0", &[3], 2).await.unwrap();
    assert_eq!(vectors[&3], vec![-2.0; 4]);
}

/// Shard 1 never answers.
struct DeadShardTransport {
    inner: Arc<LocalTransport>,
}

#[tonic::async_trait]
impl ShardTransport for DeadShardTransport {
    fn shard_num(&self) -> usize {
        self.inner.shard_num()
    }

    async fn call(
        &self,
        shard: usize,
        method: ShardMethod,
        request: TensorMessage,
    ) -> Result<TensorMessage, Status> {
        if shard == 1 && method != ShardMethod::Create {
            return std::future::pending().await;
        }

        self.inner.call(shard, method, request).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_shard() {
    setup();

    let transport = Arc::new(DeadShardTransport {
        inner: local_cluster(2),
    });

    let client = EmbeddingClient::new(0, transport, fast_policy()).unwrap();
    client.create_table(&sgd_table(4)).await.unwrap();

    let err = client.pull("emb_0", &[0, 1], 0).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EmbeddingError>(),
        Some(EmbeddingError::ShardUnreachable { shard: 1, attempts: 3, .. })
    ));

    let err = client.push("emb_0", &[1], &[1.0; 4], 0).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EmbeddingError>(),
        Some(EmbeddingError::ShardUnreachable { shard: 1, .. })
    ));

    // Shard 0 is not affected.
    let vectors = client.pull("emb_0", &[0, 2], 0).await.unwrap();
    assert_eq!(vectors.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_same_key() {
    setup();

    let transport = local_cluster(2);

    let worker_0 = Arc::new(EmbeddingClient::new(0, transport.clone(), fast_policy()).unwrap());
    let worker_1 = Arc::new(EmbeddingClient::new(1, transport.clone(), fast_policy()).unwrap());

    worker_0.create_table(&sgd_table(2)).await.unwrap();
    worker_1.create_table(&sgd_table(2)).await.unwrap();

    let mut handles = Vec::new();

    for worker in [worker_0.clone(), worker_1.clone()] {
        handles.push(tokio::spawn(async move {
            for step in 0..50u64 {
                worker.push("emb_0", &[7], &[1.0, 1.0], step).await.unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let vectors = worker_0.pull("emb_0", &[7], 50).await.unwrap();
    assert_eq!(vectors[&7], vec![-100.0, -100.0]);
}

#[tokio::test]
async fn test_session_push_before_pull() {
    setup();

    let client = Arc::new(EmbeddingClient::new(0, local_cluster(2), fast_policy()).unwrap());
    client.create_table(&sgd_table(2)).await.unwrap();

    let mut session = WorkerSession::new(client);

    let ctx = session.pull("emb_0", &[1, 2, 1]).await.unwrap();
    assert_eq!(ctx.gather(), vec![0.0; 6]);

    session.push_async(ctx, vec![1.0; 6]).unwrap();
    assert_eq!(session.pending_count(), 1);
    session.next_step();

    // Pull of next step sees the push of previous step.
    let ctx = session.pull("emb_0", &[1, 2]).await.unwrap();
    assert_eq!(session.pending_count(), 0);
    assert_eq!(ctx.step(), 1);
    assert_eq!(ctx.get(1), Some([-2.0f32, -2.0].as_slice()));
    assert_eq!(ctx.get(2), Some([-1.0f32, -1.0].as_slice()));

    // Wrong gradient size is rejected before sending.
    assert!(session.push_async(ctx.clone(), vec![1.0; 3]).is_err());

    let step = session.abort_step(vec![ctx]);
    assert_eq!(step, 2);

    let ack = session.flush().await.unwrap();
    assert_eq!(ack, Default::default());
}

#[tokio::test]
async fn test_checkpoint_restore_export() {
    setup();

    let path = temp_path("checkpoint");
    let export_path = temp_path("export");

    let table = TableConfig::new("emb_0", 4).with_optimizer_name("adam", 0.01);
    let ids = (0..64u64).collect::<Vec<_>>();

    let client = EmbeddingClient::new(0, local_cluster(2), fast_policy()).unwrap();
    client.create_table(&table).await.unwrap();

    client.pull("emb_0", &ids, 0).await.unwrap();
    client.push("emb_0", &ids, &vec![0.5; 256], 0).await.unwrap();

    assert_eq!(client.checkpoint(&path).await.unwrap(), 64);
    assert_eq!(client.export(&export_path).await.unwrap(), 64);

    let before = client.pull("emb_0", &ids, 1).await.unwrap();

    let restored = EmbeddingClient::new(0, local_cluster(2), fast_policy()).unwrap();
    restored.create_table(&table).await.unwrap();
    assert_eq!(restored.restore(&path).await.unwrap(), 64);

    let after = restored.pull("emb_0", &ids, 1).await.unwrap();
    assert_eq!(before, after);

    // Optimizer state is restored, so one more step gives the same result on both.
    client.push("emb_0", &[3], &[1.0; 4], 1).await.unwrap();
    restored.push("emb_0", &[3], &[1.0; 4], 1).await.unwrap();

    let a = client.pull("emb_0", &[3], 2).await.unwrap();
    let b = restored.pull("emb_0", &[3], 2).await.unwrap();
    assert_eq!(a, b);

    // Exported tables carry weights only.
    let served = EmbeddingClient::new(0, local_cluster(2), fast_policy()).unwrap();
    served.create_table(&table).await.unwrap();
    served.restore(&export_path).await.unwrap();

    let weights = served.pull("emb_0", &ids, 0).await.unwrap();
    assert_eq!(weights, before);

    // Different shard num needs repartition.
    let other = EmbeddingClient::new(0, local_cluster(3), fast_policy()).unwrap();
    other.create_table(&table).await.unwrap();

    let err = other.restore(&path).await.unwrap_err();
    info!("restore into 3 shards: {:#}", err);
    assert!(matches!(
        err.downcast_ref::<EmbeddingError>(),
        Some(EmbeddingError::CheckpointMismatch(_))
    ));

    let _ = std::fs::remove_dir_all(&path);
    let _ = std::fs::remove_dir_all(&export_path);
}

/// Pushes to shard 1 take 200ms, and fail when `reject` is set.
struct SlowShardTransport {
    inner: Arc<LocalTransport>,
    reject: bool,
}

#[tonic::async_trait]
impl ShardTransport for SlowShardTransport {
    fn shard_num(&self) -> usize {
        self.inner.shard_num()
    }

    async fn call(
        &self,
        shard: usize,
        method: ShardMethod,
        request: TensorMessage,
    ) -> Result<TensorMessage, Status> {
        if shard == 1 && method == ShardMethod::Push {
            tokio::time::sleep(Duration::from_millis(200)).await;

            if self.reject {
                return Err(Status::invalid_argument("push rejected"));
            }
        }

        self.inner.call(shard, method, request).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_push_is_finished() {
    setup();

    let transport = Arc::new(SlowShardTransport {
        inner: local_cluster(2),
        reject: false,
    });

    let client = EmbeddingClient::new(0, transport, fast_policy()).unwrap();
    client.create_table(&sgd_table(2)).await.unwrap();

    // Caller gives up before shard 1 answers.
    let res = timeout(
        Duration::from_millis(50),
        client.push("emb_0", &[0, 1], &[1.0; 4], 0),
    )
    .await;
    assert!(res.is_err());
    assert_eq!(client.pending_pushes(), 1);

    // Both shards are updated before the next pull is served.
    let vectors = client.pull("emb_0", &[0, 1], 1).await.unwrap();
    assert_eq!(vectors[&0], vec![-1.0, -1.0]);
    assert_eq!(vectors[&1], vec![-1.0, -1.0]);
    assert_eq!(client.pending_pushes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_push_error_is_reported() {
    setup();

    let transport = Arc::new(SlowShardTransport {
        inner: local_cluster(2),
        reject: true,
    });

    let client = Arc::new(EmbeddingClient::new(0, transport, fast_policy()).unwrap());
    client.create_table(&sgd_table(2)).await.unwrap();

    let res = timeout(
        Duration::from_millis(50),
        client.push("emb_0", &[0, 1], &[1.0; 4], 0),
    )
    .await;
    assert!(res.is_err());

    // Session dropped with a push in background.
    let mut session = WorkerSession::new(client.clone());
    let ctx = session.pull("emb_0", &[2]).await;
    assert!(ctx.is_err());

    let ctx = session.pull("emb_0", &[2, 3]).await.unwrap();
    session.push_async(ctx, vec![1.0; 4]).unwrap();
    drop(session);

    assert_eq!(client.pending_pushes(), 1);
    assert!(client.flush().await.is_err());
    assert_eq!(client.pending_pushes(), 0);

    // Shard 0 applied its part of both pushes.
    let vectors = client.pull("emb_0", &[0, 2], 1).await.unwrap();
    assert_eq!(vectors[&0], vec![-1.0, -1.0]);
    assert_eq!(vectors[&2], vec![-1.0, -1.0]);
}

#[tokio::test]
async fn test_repeated_ids_get_one_adam_step() {
    setup();

    let transport = local_cluster(2);

    let table = TableConfig::new("emb_0", 2)
        .with_constant_initializer(0.0)
        .with_optimizer_name("adam", 0.01);

    let client = EmbeddingClient::new(0, transport.clone(), fast_policy()).unwrap();
    client.create_table(&table).await.unwrap();

    let ack = client
        .push("emb_0", &[4, 4, 4, 5], &[1.0; 8], 0)
        .await
        .unwrap();
    assert_eq!(ack.updated_keys, 2);
    assert_eq!(ack.contributions, 4);

    for (id, shard) in [(4u64, 0usize), (5, 1)] {
        let embedding = transport
            .shard(shard)
            .unwrap()
            .embedding_manager()
            .get("emb_0")
            .unwrap();

        let param = embedding.get_parameter(id).unwrap();
        assert_eq!(param.state.map(|x| x.step), Some(1));

        // One bias corrected step moves each weight by about the learning rate.
        for x in param.weight {
            assert!((x + 0.01).abs() < 1e-4);
        }
    }
}
