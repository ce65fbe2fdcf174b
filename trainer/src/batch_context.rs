use anyhow::{bail, Result};
use hashbrown::HashMap;
use log::error;

use util::{error_bail, EmbeddingError};

/// Pulled embeddings of one table for one training step.
///
/// Keeps the ids in the order of the batch, duplicates included, and one vector for each distinct
/// id. Consumed by the push of the same step, or dropped by `abort_step`.
#[derive(Clone, Debug)]
pub struct BatchContext {
    step: u64,
    varname: String,
    dim: usize,
    ids: Vec<u64>,
    vectors: HashMap<u64, Vec<f32>>,
}

impl BatchContext {
    pub fn new(
        step: u64,
        varname: &str,
        dim: usize,
        ids: Vec<u64>,
        vectors: HashMap<u64, Vec<f32>>,
    ) -> Result<Self> {
        for id in ids.iter() {
            match vectors.get(id) {
                Some(x) if x.len() == dim => {}
                Some(x) => return Err(EmbeddingError::dimension_mismatch(dim, x.len()).into()),
                None => {
                    error_bail!("missing vector of id {} in batch, varname: {}", id, varname);
                }
            }
        }

        Ok(Self {
            step,
            varname: varname.to_string(),
            dim,
            ids,
            vectors,
        })
    }

    #[inline]
    pub fn step(&self) -> u64 {
        self.step
    }

    #[inline]
    pub fn varname(&self) -> &str {
        &self.varname
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&[f32]> {
        self.vectors.get(&id).map(|x| x.as_slice())
    }

    /// Rows of the batch in id order, `len() * dim()` floats.
    pub fn gather(&self) -> Vec<f32> {
        let mut res = Vec::with_capacity(self.ids.len() * self.dim);

        for id in self.ids.iter() {
            if let Some(x) = self.vectors.get(id) {
                res.extend_from_slice(x);
            }
        }

        res
    }

    /// Check gradients are aligned with the ids of the batch.
    pub fn check_grads(&self, grads: &[f32]) -> Result<()> {
        if grads.len() != self.ids.len() * self.dim {
            let actual = if self.ids.is_empty() {
                grads.len()
            } else {
                grads.len() / self.ids.len()
            };

            return Err(EmbeddingError::dimension_mismatch(self.dim, actual).into());
        }

        Ok(())
    }
}
