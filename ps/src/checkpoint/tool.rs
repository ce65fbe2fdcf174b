use std::path::Path;

use anyhow::{bail, Result};
use log::error;

use grpc::embedding::{SparseShardData, SparseShardHeader};
use util::error_bail;

use crate::optimizer::OptimizerState;

/// Suffix of checkpoint files.
pub const SHARD_FILE_SUFFIX: &str = "embedding";

/// Important info used for save or restore checkpoint.
#[derive(Default, Clone, Debug)]
pub struct CheckpointContext {
    /// Local dirname of the checkpoint.
    pub path: String,

    /// Varname to be saved or restored.
    pub varname: String,

    /// Shard index of sparse embedding.
    pub shard_index: u32,

    /// Total shard number of current sparse embedding var.
    pub shard_num: u32,

    /// Save optimizer state. False for exporting a serving model.
    pub include_optimizer: bool,

    /// Max records in one line.
    pub max_record_iterate_count: usize,
}

impl CheckpointContext {
    /// Filename of the shard in context.
    #[inline]
    pub fn filename(&self) -> String {
        get_shard_filename(&self.path, &self.varname, self.shard_index)
    }
}

/// Filename of one shard of one table.
#[inline]
pub fn get_shard_filename(path: &str, varname: &str, shard_index: u32) -> String {
    format!(
        "{}/{}.{}.{}",
        path.trim_end_matches('/'),
        varname,
        shard_index,
        SHARD_FILE_SUFFIX
    )
}

/// Parse varname and shard index from filename, `None` if it's not a checkpoint file.
pub fn parse_shard_filename(filename: &str) -> Option<(String, u32)> {
    let name = Path::new(filename).file_name()?.to_str()?;
    let stem = name.strip_suffix(SHARD_FILE_SUFFIX)?.strip_suffix('.')?;

    let (varname, shard_index) = stem.rsplit_once('.')?;
    if varname.is_empty() {
        return None;
    }

    Some((varname.to_string(), shard_index.parse().ok()?))
}

/// One id with its weight and optimizer state.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardRecord {
    pub id: u64,
    pub weight: Vec<f32>,
    pub state: Option<OptimizerState>,
}

/// Append one record to chunk.
pub fn push_record(
    chunk: &mut SparseShardData,
    id: u64,
    weight: &[f32],
    state: Option<&OptimizerState>,
) {
    chunk.id.push(id);
    chunk.weight.extend_from_slice(weight);

    match state {
        Some(x) => {
            chunk.has_state.push(true);
            chunk.state.extend_from_slice(&x.values);
            chunk.step.push(x.step);
        }
        None => {
            chunk.has_state.push(false);
            chunk.step.push(0);
        }
    }
}

pub fn clear_chunk(chunk: &mut SparseShardData) {
    chunk.id.clear();
    chunk.weight.clear();
    chunk.has_state.clear();
    chunk.state.clear();
    chunk.step.clear();
}

/// Split chunk into records, lengths are checked against header.
pub fn records_from_chunk(
    chunk: &SparseShardData,
    header: &SparseShardHeader,
) -> Result<Vec<ShardRecord>> {
    let embedding_size = header.embedding_size as usize;
    let state_dim = header.state_dim as usize;
    let total = chunk.id.len();

    if chunk.weight.len() != total * embedding_size
        || chunk.has_state.len() != total
        || chunk.step.len() != total
    {
        error_bail!(
            "invalid chunk, varname: {}, id.len(): {}, weight.len(): {}, has_state.len(): {}, step.len(): {}, embedding_size: {}",
            header.varname,
            total,
            chunk.weight.len(),
            chunk.has_state.len(),
            chunk.step.len(),
            embedding_size,
        );
    }

    let state_count = chunk.has_state.iter().filter(|x| **x).count();
    if chunk.state.len() != state_count * state_dim {
        error_bail!(
            "invalid chunk state, varname: {}, state.len(): {}, state_count: {}, state_dim: {}",
            header.varname,
            chunk.state.len(),
            state_count,
            state_dim,
        );
    }

    let mut res = Vec::with_capacity(total);
    let mut state_pos = 0;

    for (i, id) in chunk.id.iter().enumerate() {
        let weight = chunk.weight[i * embedding_size..(i + 1) * embedding_size].to_vec();

        let state = if chunk.has_state[i] {
            let values = chunk.state[state_pos..state_pos + state_dim].to_vec();
            state_pos += state_dim;

            Some(OptimizerState {
                values,
                step: chunk.step[i],
            })
        } else {
            None
        };

        res.push(ShardRecord {
            id: *id,
            weight,
            state,
        });
    }

    Ok(res)
}
