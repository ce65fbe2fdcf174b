use std::sync::{Arc, Once};

use log::info;
use rand::RngCore;
use tonic::{Code, Request};

use grpc::embedding::embedding_ps_server::EmbeddingPs;
use grpc::embedding::{
    CheckpointResult, CreateOption, InitializerOption, InitializerType, OptimizerOption,
    PushOption, PushResult, RegisterOption, RestoreOption, Role, SaveOption, SparseShardData,
    SparseShardHeader, TensorMessage, TensorProto, VoidMessage, WorkerViewOption,
};
use grpc::tool::{get_error_reason, get_request_inner_options};
use ps::checkpoint::file_handler::LocalFileReader;
use ps::checkpoint::repartition::repartition_local;
use ps::checkpoint::restore_task::read_shard_file;
use ps::checkpoint::save_task::append_proto_base64_to_file;
use ps::checkpoint::tool::{get_shard_filename, push_record};
use ps::{Env, MembershipState, Ps, WorkerView};
use util::histogram::{Histogram, HistogramType};
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
        .join(format!("ps_test_{}_{}", name, suffix))
        .to_string_lossy()
        .to_string()
}

fn create_option(emb_size: u32, shard_num: u32, shard_idx: u32, optimizer: &str) -> CreateOption {
    CreateOption {
        emb_size,
        vocabulary_size: 0,
        shard_num,
        shard_idx,
        initializer: Some(InitializerOption {
            r#type: InitializerType::InitUniform.into(),
            min: -0.1,
            max: 0.1,
            seed: Some(7),
            ..Default::default()
        }),
        optimizer: Some(OptimizerOption {
            name: optimizer.to_string(),
            learning_rate: 0.1,
            ..Default::default()
        }),
        delete_var: false,
    }
}

async fn create(ps: &Ps, varname: &str, option: &CreateOption) {
    let request = TensorMessage::with_option(Role::Trainer, 0, varname, option).unwrap();
    ps.create(Request::new(request)).await.unwrap();
}

async fn pull(ps: &Ps, varname: &str, ids: &[u64]) -> Vec<f32> {
    let mut request = TensorMessage::new();
    request.varname = varname.to_string();
    request.tensor1 = Some(TensorProto::with_u64_vec(ids.to_vec()));

    let response = ps.pull(Request::new(request)).await.unwrap().into_inner();
    assert_eq!(response.ids(), ids);

    response.values().to_vec()
}

fn push_request(varname: &str, worker: u32, seq_id: u64, ids: &[u64], grads: Vec<f32>, dim: usize) -> TensorMessage {
    let mut request = TensorMessage::new();
    request.role_id = worker;
    request.seq_id = seq_id;
    request.varname = varname.to_string();
    request.tensor1 = Some(TensorProto::with_u64_vec(ids.to_vec()));
    request.tensor2 = Some(TensorProto::with_f32_vec(grads, dim));

    request
}

fn push_request_at_step(varname: &str, seq_id: u64, step: u64, ids: &[u64], grads: Vec<f32>, dim: usize) -> TensorMessage {
    let mut request = TensorMessage::with_option(Role::Trainer, 0, varname, &PushOption { step }).unwrap();
    request.seq_id = seq_id;
    request.tensor1 = Some(TensorProto::with_u64_vec(ids.to_vec()));
    request.tensor2 = Some(TensorProto::with_f32_vec(grads, dim));

    request
}

fn constant_option(emb_size: u32, shard_num: u32, shard_idx: u32, optimizer: &str) -> CreateOption {
    let mut option = create_option(emb_size, shard_num, shard_idx, optimizer);
    option.initializer = Some(InitializerOption {
        r#type: InitializerType::InitConstant.into(),
        value: 0.0,
        ..Default::default()
    });

    option
}

async fn push(ps: &Ps, request: TensorMessage) -> PushResult {
    let response = ps.push(Request::new(request)).await.unwrap().into_inner();
    get_request_inner_options::<PushResult>(&response).unwrap()
}

#[tokio::test]
async fn test_pull_initializes_with_seed() {
    setup();

    let ps = Ps::new(Env::with_rank(0, 1));
    create(&ps, "emb_0", &create_option(8, 1, 0, "sgd")).await;

    let first = pull(&ps, "emb_0", &[3, 1, 2]).await;
    assert_eq!(first.len(), 24);

    // Same seed, different order.
    let other = Ps::new(Env::with_rank(0, 1));
    create(&other, "emb_0", &create_option(8, 1, 0, "sgd")).await;

    let second = pull(&other, "emb_0", &[2, 1, 3]).await;
    assert_eq!(&first[0..8], &second[16..24]);
    assert_eq!(&first[8..16], &second[8..16]);
}

#[tokio::test]
async fn test_push_sgd_example() {
    setup();

    let ps = Ps::new(Env::with_rank(0, 1));

    let mut option = create_option(4, 1, 0, "sgd");
    option.initializer = Some(InitializerOption {
        r#type: InitializerType::InitConstant.into(),
        value: 0.0,
        ..Default::default()
    });
    create(&ps, "emb_0", &option).await;

    let res = push(&ps, push_request("emb_0", 0, 1, &[10], vec![1.0; 4], 4)).await;
    assert!(!res.duplicate);
    assert_eq!(res.updated_keys, 1);

    let values = pull(&ps, "emb_0", &[10]).await;
    for x in values {
        assert!((x + 0.1).abs() < 1e-6);
    }

    // Replay is acknowledged with the first result but not applied.
    let res = push(&ps, push_request("emb_0", 0, 1, &[10], vec![1.0; 4], 4)).await;
    assert!(res.duplicate);
    assert_eq!(res.updated_keys, 1);

    let values = pull(&ps, "emb_0", &[10]).await;
    for x in values {
        assert!((x + 0.1).abs() < 1e-6);
    }
}

#[tokio::test]
async fn test_push_errors() {
    setup();

    let ps = Ps::new(Env::with_rank(0, 1));
    create(&ps, "emb_0", &create_option(4, 1, 0, "adagrad")).await;

    let status = ps
        .push(Request::new(push_request("emb_0", 0, 1, &[1], vec![1.0; 3], 3)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(get_error_reason(&status), Some("DIMENSION_MISMATCH".to_string()));
    assert_eq!(
        EmbeddingError::from_reason("DIMENSION_MISMATCH", status.message()),
        Some(EmbeddingError::dimension_mismatch(4, 3))
    );

    // Failed push does not consume the token.
    let res = push(&ps, push_request("emb_0", 0, 1, &[1], vec![1.0; 4], 4)).await;
    assert!(!res.duplicate);

    let status = ps
        .push(Request::new(push_request("emb_1", 0, 2, &[1], vec![1.0; 4], 4)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(get_error_reason(&status), Some("UNKNOWN_TABLE".to_string()));
}

#[tokio::test]
async fn test_create_unknown_optimizer() {
    setup();

    let ps = Ps::new(Env::with_rank(0, 1));

    let request =
        TensorMessage::with_option(Role::Trainer, 0, "emb_0", &create_option(4, 1, 0, "lamb")).unwrap();
    let status = ps.create(Request::new(request)).await.unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(get_error_reason(&status), Some("UNKNOWN_OPTIMIZER".to_string()));
}

async fn save(ps: &Ps, path: &str, include_optimizer: bool) -> CheckpointResult {
    let option = SaveOption {
        path: path.to_string(),
        include_optimizer,
    };

    let request = TensorMessage::with_option(Role::Trainer, 0, "", &option).unwrap();
    let response = ps.save(Request::new(request)).await.unwrap().into_inner();

    get_request_inner_options::<CheckpointResult>(&response).unwrap()
}

fn restore_request(path: &str) -> TensorMessage {
    let option = RestoreOption {
        path: path.to_string(),
    };

    TensorMessage::with_option(Role::Trainer, 0, "", &option).unwrap()
}

#[tokio::test]
async fn test_checkpoint_round_trip() {
    setup();

    let path = temp_path("round_trip");
    let ids = (0..100u64).collect::<Vec<_>>();

    let ps = Ps::new(Env::with_rank(0, 1));
    create(&ps, "emb_0", &create_option(4, 1, 0, "adam")).await;

    push(&ps, push_request("emb_0", 0, 1, &ids, vec![0.5; 400], 4)).await;
    let before = pull(&ps, "emb_0", &ids).await;

    let res = save(&ps, &path, true).await;
    assert_eq!(res.record_count, 100);

    let embedding = ps.embedding_manager().get("emb_0").unwrap();
    let state_before = embedding.get_parameter(5).unwrap().state;
    assert_eq!(state_before.as_ref().map(|x| x.step), Some(1));

    let restored = Ps::new(Env::with_rank(0, 1));
    create(&restored, "emb_0", &create_option(4, 1, 0, "adam")).await;
    restored.restore(Request::new(restore_request(&path))).await.unwrap();

    let after = pull(&restored, "emb_0", &ids).await;
    assert_eq!(before, after);

    let embedding = restored.embedding_manager().get("emb_0").unwrap();
    assert_eq!(embedding.get_parameter(5).unwrap().state, state_before);

    let _ = std::fs::remove_dir_all(&path);
}

#[tokio::test]
async fn test_restore_needs_same_shard_num() {
    setup();

    let path = temp_path("shard_num");

    let ps = Ps::new(Env::with_rank(0, 1));
    create(&ps, "emb_0", &create_option(4, 1, 0, "sgd")).await;
    pull(&ps, "emb_0", &[1, 2, 3]).await;
    save(&ps, &path, true).await;

    let other = Ps::new(Env::with_rank(0, 2));
    create(&other, "emb_0", &create_option(4, 2, 0, "sgd")).await;

    let status = other.restore(Request::new(restore_request(&path))).await.unwrap_err();
    assert_eq!(get_error_reason(&status), Some("CHECKPOINT_MISMATCH".to_string()));

    // Repartition to 2 shards, then each shard restores its part.
    let dst = temp_path("shard_num_dst");
    let results = repartition_local(&path, &dst, 2, 2).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record_count, 3);

    other.restore(Request::new(restore_request(&dst))).await.unwrap();
    assert_eq!(other.embedding_manager().get("emb_0").unwrap().len(), 1);

    let second = Ps::new(Env::with_rank(1, 2));
    create(&second, "emb_0", &create_option(4, 2, 1, "sgd")).await;
    second.restore(Request::new(restore_request(&dst))).await.unwrap();
    assert_eq!(second.embedding_manager().get("emb_0").unwrap().len(), 2);

    let _ = std::fs::remove_dir_all(&path);
    let _ = std::fs::remove_dir_all(&dst);
}

#[tokio::test]
async fn test_export_without_optimizer() {
    setup();

    let path = temp_path("export");

    let ps = Ps::new(Env::with_rank(0, 1));
    create(&ps, "emb_0", &create_option(4, 1, 0, "adagrad")).await;
    push(&ps, push_request("emb_0", 0, 1, &[1, 2], vec![1.0; 8], 4)).await;

    save(&ps, &path, false).await;

    let restored = Ps::new(Env::with_rank(0, 1));
    create(&restored, "emb_0", &create_option(4, 1, 0, "adagrad")).await;
    restored.restore(Request::new(restore_request(&path))).await.unwrap();

    let embedding = restored.embedding_manager().get("emb_0").unwrap();
    let param = embedding.get_parameter(1).unwrap();
    assert_eq!(param.state, None);
    assert_eq!(
        param.weight,
        ps.embedding_manager().get("emb_0").unwrap().get_parameter(1).unwrap().weight
    );

    let _ = std::fs::remove_dir_all(&path);
}

#[tokio::test]
async fn test_register_and_drain() {
    setup();

    let ps = Ps::new(Env::with_rank(0, 2));

    for rank in 0..2u32 {
        let option = RegisterOption {
            rank,
            endpoint: format!("127.0.0.1:{}", 50062 + rank),
        };
        let request = TensorMessage::with_option(Role::Ps, rank, "", &option).unwrap();
        ps.register(Request::new(request)).await.unwrap();
    }

    let request = TensorMessage::with_option(Role::Trainer, 0, "", &VoidMessage::default()).unwrap();
    let response = ps.get_view(Request::new(request)).await.unwrap().into_inner();
    let view = WorkerView::from_option(&get_request_inner_options::<WorkerViewOption>(&response).unwrap());

    info!("view: {:?}", view);
    assert_eq!(view.state, MembershipState::Active);
    assert_eq!(view.endpoints.len(), 2);

    // Late join.
    let option = RegisterOption {
        rank: 2,
        endpoint: "127.0.0.1:50064".to_string(),
    };
    let request = TensorMessage::with_option(Role::Ps, 2, "", &option).unwrap();
    let status = ps.register(Request::new(request)).await.unwrap_err();
    assert_eq!(get_error_reason(&status), Some("LATE_JOIN".to_string()));

    create(&ps, "emb_0", &create_option(4, 2, 0, "sgd")).await;

    let request = TensorMessage::with_option(Role::Trainer, 0, "", &VoidMessage::default()).unwrap();
    ps.drain(Request::new(request)).await.unwrap();
    assert_eq!(ps.coordinator().state(), MembershipState::Closed);

    let mut request = TensorMessage::new();
    request.varname = "emb_0".to_string();
    request.tensor1 = Some(TensorProto::with_u64_vec(vec![2]));

    let status = ps.pull(Request::new(request)).await.unwrap_err();
    assert_eq!(get_error_reason(&status), Some("SHUTTING_DOWN".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replay_during_apply_waits() {
    setup();

    let ps = Arc::new(Ps::new(Env::with_rank(0, 1)));
    create(&ps, "emb_0", &create_option(8, 1, 0, "adam")).await;

    let ids = (0..100_000u64).collect::<Vec<_>>();
    let request = push_request("emb_0", 0, 1, &ids, vec![0.5; 800_000], 8);

    let mut handles = Vec::new();

    for _ in 0..2 {
        let ps = ps.clone();
        let request = request.clone();

        handles.push(tokio::spawn(async move {
            let res = push(&ps, request).await;
            let applied = ps.embedding_manager().get("emb_0").unwrap().len();

            (res, applied)
        }));
    }

    let mut duplicates = 0;

    for handle in handles {
        let (res, applied) = handle.await.unwrap();

        // Whichever copy is acked, all keys are applied by then.
        assert_eq!(applied, 100_000);
        assert_eq!(res.updated_keys, 100_000);

        if res.duplicate {
            duplicates += 1;
        }
    }

    assert_eq!(duplicates, 1);

    let embedding = ps.embedding_manager().get("emb_0").unwrap();
    for id in [0u64, 4999, 99_999] {
        let state = embedding.get_parameter(id).unwrap().state.unwrap();
        assert_eq!(state.step, 1);
    }
}

/// Write a shard file of `emb_0` with the given records, weights only.
fn write_shard_file(path: &str, shard_index: u32, shard_num: u32, records: &[(u64, Vec<f32>)]) {
    std::fs::create_dir_all(path).unwrap();

    let filename = get_shard_filename(path, "emb_0", shard_index);
    let mut writer = std::fs::File::create(&filename).unwrap();

    let header = SparseShardHeader {
        varname: "emb_0".to_string(),
        shard_index,
        shard_num,
        embedding_size: 4,
        optimizer: "sgd".to_string(),
        state_dim: 0,
        include_optimizer: false,
        step: 3,
    };
    append_proto_base64_to_file(&header, &mut writer).unwrap();

    let mut chunk = SparseShardData::default();
    for (id, weight) in records {
        push_record(&mut chunk, *id, weight, None);
    }
    append_proto_base64_to_file(&chunk, &mut writer).unwrap();
}

#[tokio::test]
async fn test_broken_restore_keeps_table() {
    setup();

    let ps = Ps::new(Env::with_rank(0, 2));
    create(&ps, "emb_0", &create_option(4, 2, 0, "sgd")).await;

    let ids = [0u64, 2, 4, 6];
    let before = pull(&ps, "emb_0", &ids).await;

    // Id 3 belongs to shard 1.
    let misrouted = temp_path("misrouted");
    write_shard_file(&misrouted, 0, 2, &[(8, vec![1.0; 4]), (3, vec![1.0; 4])]);

    let status = ps.restore(Request::new(restore_request(&misrouted))).await.unwrap_err();
    assert_eq!(get_error_reason(&status), Some("CHECKPOINT_MISMATCH".to_string()));

    let embedding = ps.embedding_manager().get("emb_0").unwrap();
    assert_eq!(embedding.len(), 4);
    assert_eq!(embedding.get_parameter(8), None);
    assert_eq!(pull(&ps, "emb_0", &ids).await, before);

    // Non finite weight fails the whole restore.
    let nan = temp_path("nan");
    write_shard_file(&nan, 0, 2, &[(8, vec![1.0; 4]), (10, vec![f32::NAN; 4])]);

    let status = ps.restore(Request::new(restore_request(&nan))).await.unwrap_err();
    assert_eq!(get_error_reason(&status), Some("CHECKPOINT_MISMATCH".to_string()));
    assert_eq!(embedding.len(), 4);
    assert_eq!(pull(&ps, "emb_0", &ids).await, before);

    // A valid file replaces the table and its step.
    let valid = temp_path("valid");
    write_shard_file(&valid, 0, 2, &[(8, vec![1.0; 4]), (10, vec![2.0; 4])]);

    ps.restore(Request::new(restore_request(&valid))).await.unwrap();
    assert_eq!(embedding.len(), 2);
    assert_eq!(embedding.applied_step(), 3);
    assert_eq!(pull(&ps, "emb_0", &[10]).await, vec![2.0; 4]);

    for path in [misrouted, nan, valid] {
        let _ = std::fs::remove_dir_all(&path);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_save_during_pushes() {
    setup();

    let ps = Arc::new(Ps::new(Env::with_rank(0, 1)));
    create(&ps, "emb_0", &constant_option(4, 1, 0, "sgd")).await;

    let ids = (0..2048u64).collect::<Vec<_>>();
    pull(&ps, "emb_0", &ids).await;

    let pusher = {
        let ps = ps.clone();
        let ids = ids.clone();

        tokio::spawn(async move {
            for step in 1..=100u64 {
                let request = push_request_at_step("emb_0", step, step, &ids, vec![1.0; 8192], 4);
                push(&ps, request).await;
            }
        })
    };

    let mut paths = Vec::new();

    for i in 0..8 {
        let path = temp_path(&format!("during_push_{}", i));
        save(&ps, &path, true).await;
        paths.push(path);
    }

    pusher.await.unwrap();

    for path in paths.iter() {
        let (header, records) =
            read_shard_file::<LocalFileReader>(&get_shard_filename(path, "emb_0", 0)).unwrap();
        assert_eq!(records.len(), 2048);

        // Every id sees the same number of steps.
        let first = records[0].weight.clone();
        assert!(records.iter().all(|x| x.weight == first));
        assert!((first[0] + 0.1 * header.step as f32).abs() < 1e-3);

        let _ = std::fs::remove_dir_all(path);
    }

    let path = temp_path("after_push");
    save(&ps, &path, true).await;

    let (header, _) = read_shard_file::<LocalFileReader>(&get_shard_filename(&path, "emb_0", 0)).unwrap();
    assert_eq!(header.step, 100);

    let _ = std::fs::remove_dir_all(&path);
}

#[tokio::test]
async fn test_elastic_join_back_to_active() {
    setup();

    let mut env = Env::with_rank(0, 2);
    env.elastic = true;
    let ps = Ps::new(env);

    let mut last = None;

    for rank in 0..3u32 {
        let option = RegisterOption {
            rank,
            endpoint: format!("127.0.0.1:{}", 50062 + rank),
        };
        let request = TensorMessage::with_option(Role::Ps, rank, "", &option).unwrap();
        let response = ps.register(Request::new(request)).await.unwrap().into_inner();

        last = get_request_inner_options::<WorkerViewOption>(&response);
    }

    // Rank 2 joins after the cluster is active, the reply carries the view after resharding.
    let view = WorkerView::from_option(&last.unwrap());
    assert_eq!(view.state, MembershipState::Active);
    assert_eq!(view.endpoints.len(), 3);
    assert_eq!(view.expected_workers, 3);
    assert_eq!(view.version, 4);

    assert_eq!(ps.coordinator().view(), view);
}

#[tokio::test]
async fn test_requests_are_timed() {
    setup();

    let (sender, mut receiver) = tokio::sync::mpsc::channel(16);
    let ps = Ps::with_histogram(Env::with_rank(0, 1), Histogram::new(sender));

    create(&ps, "emb_0", &create_option(4, 1, 0, "sgd")).await;
    pull(&ps, "emb_0", &[1, 2]).await;

    let path = temp_path("timed");
    save(&ps, &path, true).await;

    // Create and save are sent at once, pull is kept locally until enough values.
    let mut types = Vec::new();
    while let Ok(detail) = receiver.try_recv() {
        assert_eq!(detail.num, 1);
        types.push(detail.histogram_type);
    }
    assert_eq!(types, vec![HistogramType::PsCreate, HistogramType::PsSave]);

    let _ = std::fs::remove_dir_all(&path);
}
