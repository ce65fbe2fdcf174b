//! Parameter for sparse feature signs.
//!
//! We use `dashmap::DashMap` as the container to store embedding parameters. The key is the sign
//! of sparse feature, and the value is `SparseParameter`, which contains the embedding weight and
//! the optimizer state of the sign.
//!
//! `DashMap` locks one internal shard for each `get_mut` or `entry`, so the read-modify-write of one
//! sign is atomic, while updates to different signs run in parallel. There is no table wide lock.
//!
//! Signs are created when they are first read or first updated, using the initializer of the table.
//! Optimizer state is created only when the first gradient arrives.
//!
//! Updates hold the read side of `update_gate`, a snapshot for checkpoint holds the write side, so a
//! snapshot always sits between two whole pushes.
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use dashmap::DashMap;
use log::info;
use parking_lot::RwLock;

use grpc::embedding::CreateOption;
use util::vector::has_non_finite;
use util::{EmbeddingError, ShardRouter};

use crate::aggregator::AggregatedGradients;
use crate::checkpoint::tool::ShardRecord;
use crate::initializer::EmbeddingInitializer;
use crate::optimizer::{create_optimizer, OptimizerState, SparseOptimizer};

/// Sparse Parameter for sparse signs.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseParameter {
    /// Embedding weight.
    pub weight: Vec<f32>,

    /// Optimizer state, `None` until the first update.
    pub state: Option<OptimizerState>,
}

impl SparseParameter {
    #[inline]
    pub fn with_weight(weight: Vec<f32>) -> Self {
        Self {
            weight,
            state: None,
        }
    }
}

/// Embedding parameters of one shard of a table.
pub struct Embedding {
    /// Embedding varname.
    pub varname: String,

    /// Embedding size, immutable after creation.
    pub embedding_size: usize,

    /// Max sign plus one, 0 means unbounded.
    pub vocabulary_size: u64,

    /// Shard num of the table.
    pub shard_num: usize,

    /// Shard index of current Embedding.
    pub shard_index: usize,

    router: ShardRouter,

    initializer: EmbeddingInitializer,

    optimizer: Box<dyn SparseOptimizer>,

    /// Storage of the SparseParameter.
    pub store: DashMap<u64, SparseParameter>,

    update_gate: RwLock<()>,

    /// Largest step of the applied pushes.
    applied_step: AtomicU64,
}

/// Copy of all parameters of one shard, taken between two pushes.
pub struct TableSnapshot {
    /// Value of `applied_step` when the snapshot is taken.
    pub step: u64,

    pub records: Vec<ShardRecord>,
}

impl Embedding {
    /// Construct a new Embedding, validate the option first.
    pub fn new(varname: &str, option: &CreateOption) -> Result<Self> {
        if varname.is_empty() {
            return Err(EmbeddingError::invalid_config("varname is empty").into());
        }

        if option.emb_size == 0 {
            return Err(EmbeddingError::invalid_config(format!(
                "emb_size must be bigger than 0, varname: {}",
                varname
            ))
            .into());
        }

        let router = ShardRouter::new(option.shard_num as usize)?;

        if option.shard_idx >= option.shard_num {
            return Err(EmbeddingError::invalid_config(format!(
                "shard_idx out of range, shard_idx: {}, shard_num: {}",
                option.shard_idx, option.shard_num
            ))
            .into());
        }

        let initializer = EmbeddingInitializer::from_option(option.initializer.as_ref())?;

        let optimizer = match option.optimizer.as_ref() {
            Some(x) => create_optimizer(x)?,
            None => {
                return Err(EmbeddingError::invalid_config(format!(
                    "missing optimizer, varname: {}",
                    varname
                ))
                .into());
            }
        };

        info!(
            "new embedding, varname: {}, embedding_size: {}, vocabulary_size: {}, shard: {}/{}, optimizer: {}",
            varname,
            option.emb_size,
            option.vocabulary_size,
            option.shard_idx,
            option.shard_num,
            optimizer.name(),
        );

        Ok(Self {
            varname: varname.to_string(),
            embedding_size: option.emb_size as usize,
            vocabulary_size: option.vocabulary_size,
            shard_num: option.shard_num as usize,
            shard_index: option.shard_idx as usize,
            router,
            initializer,
            optimizer,
            store: DashMap::new(),
            update_gate: RwLock::new(()),
            applied_step: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn optimizer_name(&self) -> &'static str {
        self.optimizer.name()
    }

    #[inline]
    pub fn state_dim(&self) -> usize {
        self.optimizer.state_dim(self.embedding_size)
    }

    #[inline]
    pub fn applied_step(&self) -> u64 {
        self.applied_step.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Sign must be in vocabulary range and routed to current shard.
    pub fn check_sign(&self, sign: u64) -> Result<()> {
        if self.vocabulary_size > 0 && sign >= self.vocabulary_size {
            return Err(EmbeddingError::OutOfRange {
                id: sign,
                vocabulary_size: self.vocabulary_size,
            }
            .into());
        }

        let expected = self.router.route(sign);
        if expected != self.shard_index {
            return Err(EmbeddingError::Misrouted {
                id: sign,
                expected,
                actual: self.shard_index,
            }
            .into());
        }

        Ok(())
    }

    pub fn check_signs(&self, signs: &[u64]) -> Result<()> {
        signs.iter().try_for_each(|sign| self.check_sign(*sign))
    }

    #[inline]
    fn new_parameter(&self, sign: u64) -> SparseParameter {
        SparseParameter::with_weight(self.initializer.init(sign, self.embedding_size))
    }

    /// Get weights of signs, append them to `values` in the order of `signs`.
    ///
    /// Unseen signs are initialized and inserted. All signs are checked before any insertion.
    pub fn lookup(&self, signs: &[u64], values: &mut Vec<f32>) -> Result<()> {
        self.check_signs(signs)?;

        values.reserve(signs.len() * self.embedding_size);

        for sign in signs {
            match self.store.get(sign) {
                Some(x) => values.extend_from_slice(&x.weight),
                None => {
                    // Another request may insert the sign between `get` and `entry`, `or_insert_with`
                    // keeps the first one.
                    let x = self
                        .store
                        .entry(*sign)
                        .or_insert_with(|| self.new_parameter(*sign));
                    values.extend_from_slice(&x.weight);
                }
            }
        }

        Ok(())
    }

    /// Add `delta` to the weight of `sign` without optimizer.
    pub fn accumulate(&self, sign: u64, delta: &[f32]) -> Result<()> {
        self.check_sign(sign)?;

        if delta.len() != self.embedding_size {
            return Err(EmbeddingError::dimension_mismatch(self.embedding_size, delta.len()).into());
        }

        let _gate = self.update_gate.read();

        let mut x = self
            .store
            .entry(sign)
            .or_insert_with(|| self.new_parameter(sign));

        util::vector::sum_f32_vectors(&mut x.weight, delta)
    }

    /// Apply aggregated gradients of training step `step` through the optimizer, return the count
    /// of updated signs.
    ///
    /// Each sign gets exactly one optimizer step. The step of one sign is atomic with respect to
    /// other updates and lookups of the same sign, the whole push is atomic with respect to
    /// `snapshot`.
    pub fn apply_gradients(&self, aggregated: &AggregatedGradients, step: u64) -> Result<usize> {
        if aggregated.embedding_size != self.embedding_size {
            return Err(EmbeddingError::dimension_mismatch(
                self.embedding_size,
                aggregated.embedding_size,
            )
            .into());
        }

        self.check_signs(&aggregated.signs)?;

        let _gate = self.update_gate.read();

        let mut updated = 0;

        for (sign, grad) in aggregated.iter() {
            let mut x = self
                .store
                .entry(sign)
                .or_insert_with(|| self.new_parameter(sign));

            let SparseParameter { weight, state } = x.value_mut();
            let state = state.get_or_insert_with(|| self.optimizer.init_state(self.embedding_size));

            self.optimizer.apply(weight, state, grad)?;
            updated += 1;
        }

        self.applied_step.fetch_max(step, Ordering::AcqRel);

        Ok(updated)
    }

    /// Check a record read from checkpoint before it replaces anything.
    pub fn check_restored(&self, record: &ShardRecord) -> Result<()> {
        if record.weight.len() != self.embedding_size {
            return Err(
                EmbeddingError::dimension_mismatch(self.embedding_size, record.weight.len()).into(),
            );
        }

        if let Some(x) = record.state.as_ref() {
            if x.values.len() != self.state_dim() {
                return Err(
                    EmbeddingError::dimension_mismatch(self.state_dim(), x.values.len()).into(),
                );
            }
        }

        if let Err(err) = self.check_sign(record.id) {
            return Err(EmbeddingError::CheckpointMismatch(format!(
                "{:#}, varname: {}",
                err, self.varname
            ))
            .into());
        }

        let state_non_finite = record
            .state
            .as_ref()
            .map_or(false, |x| has_non_finite(&x.values));

        if has_non_finite(&record.weight) || state_non_finite {
            return Err(EmbeddingError::CheckpointMismatch(format!(
                "sparse parameter has nan or inf, varname: {}, sign: {}",
                self.varname, record.id
            ))
            .into());
        }

        Ok(())
    }

    /// Replace all parameters with checked records, `applied_step` is set to `step`.
    pub fn replace_all(&self, records: Vec<ShardRecord>, step: u64) {
        let _gate = self.update_gate.write();

        self.store.clear();

        for record in records {
            self.store.insert(
                record.id,
                SparseParameter {
                    weight: record.weight,
                    state: record.state,
                },
            );
        }

        self.applied_step.store(step, Ordering::Release);
    }

    /// Copy all parameters while no push is being applied.
    ///
    /// Optimizer state is dropped when `include_optimizer` is false.
    pub fn snapshot(&self, include_optimizer: bool) -> TableSnapshot {
        let _gate = self.update_gate.write();

        let records = self
            .store
            .iter()
            .map(|x| ShardRecord {
                id: *x.key(),
                weight: x.value().weight.clone(),
                state: if include_optimizer {
                    x.value().state.clone()
                } else {
                    None
                },
            })
            .collect();

        TableSnapshot {
            step: self.applied_step(),
            records,
        }
    }

    /// Copy of the parameter of `sign`, `None` if never touched.
    pub fn get_parameter(&self, sign: u64) -> Option<SparseParameter> {
        self.store.get(&sign).map(|x| x.value().clone())
    }

}
