use anyhow::{bail, Result};
use hashbrown::{HashMap, HashSet};
use log::error;

use crate::{error_bail, EmbeddingError};

/// Strategy to place feature ids to different shards.
///
/// Each feature id is owned by exactly one shard, the target shard is `id % shard_num`. It's a pure
/// function of id and shard_num, so every worker computes the same placement without coordination,
/// and ids of one batch can be grouped by shard before any network round trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardRouter {
    shard_num: usize,
}

impl ShardRouter {
    /// The parameter shard_num must be bigger than 0.
    pub fn new(shard_num: usize) -> Result<Self> {
        if shard_num == 0 {
            return Err(EmbeddingError::invalid_config("shard_num must be bigger than 0").into());
        }

        Ok(Self { shard_num })
    }

    #[inline]
    pub fn shard_num(&self) -> usize {
        self.shard_num
    }

    /// Get shard index by feature id.
    ///
    /// The result shard index is guaranteed to be in range 0..shard_num.
    #[inline]
    pub fn route(&self, id: u64) -> usize {
        (id % self.shard_num as u64) as usize
    }

    /// Partition ids by destination shard. Order of ids in each shard follows the input order,
    /// duplicated ids are kept.
    pub fn regroup(&self, ids: &[u64]) -> HashMap<usize, Vec<u64>> {
        let mut res: HashMap<usize, Vec<u64>> = HashMap::new();

        for id in ids {
            res.entry(self.route(*id)).or_default().push(*id);
        }

        res
    }

    /// Same as `regroup`, but each id appears only once.
    pub fn regroup_unique(&self, ids: &[u64]) -> HashMap<usize, Vec<u64>> {
        let mut seen: HashSet<u64> = HashSet::with_capacity(ids.len());
        let mut res: HashMap<usize, Vec<u64>> = HashMap::new();

        for id in ids {
            if seen.insert(*id) {
                res.entry(self.route(*id)).or_default().push(*id);
            }
        }

        res
    }

    /// Partition ids and rows of values by destination shard.
    ///
    /// `values` is row major with `dim` floats for each id, the rows are moved together with ids.
    pub fn regroup_with_values(
        &self,
        ids: &[u64],
        values: &[f32],
        dim: usize,
    ) -> Result<HashMap<usize, (Vec<u64>, Vec<f32>)>> {
        if dim == 0 || ids.len() * dim != values.len() {
            error_bail!(
                "ids.len() * dim != values.len(), ids.len(): {}, dim: {}, values.len(): {}",
                ids.len(),
                dim,
                values.len(),
            );
        }

        let mut res: HashMap<usize, (Vec<u64>, Vec<f32>)> = HashMap::new();

        for (i, id) in ids.iter().enumerate() {
            let entry = res.entry(self.route(*id)).or_default();

            entry.0.push(*id);
            entry.1.extend_from_slice(&values[i * dim..(i + 1) * dim]);
        }

        Ok(res)
    }
}
