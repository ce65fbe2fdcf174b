//! Sum the gradients of same feature id within one push.
//!
//! A batch may contain the same id many times, the optimizer must see exactly one update with the
//! summed gradient for each id of a push. Aggregation never crosses push requests.

use anyhow::Result;
use hashbrown::HashMap;

use util::vector::sum_f32_vectors;
use util::EmbeddingError;

/// Gradients with unique ids, in the order of first appearance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatedGradients {
    pub signs: Vec<u64>,

    /// Row major, `embedding_size` floats for each sign.
    pub grads: Vec<f32>,

    pub embedding_size: usize,

    /// Total rows before aggregation.
    pub contributions: usize,
}

impl AggregatedGradients {
    #[inline]
    pub fn len(&self) -> usize {
        self.signs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.signs.is_empty()
    }

    /// Gradient of the i-th sign.
    #[inline]
    pub fn grad(&self, i: usize) -> &[f32] {
        &self.grads[i * self.embedding_size..(i + 1) * self.embedding_size]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f32])> + '_ {
        self.signs
            .iter()
            .copied()
            .zip(self.grads.chunks(self.embedding_size.max(1)))
    }
}

/// Aggregate `values` of `signs`, `values.len()` must be `signs.len() * embedding_size`.
pub fn aggregate(signs: &[u64], values: &[f32], embedding_size: usize) -> Result<AggregatedGradients> {
    if embedding_size == 0 {
        return Err(EmbeddingError::invalid_config("embedding_size must be bigger than 0").into());
    }

    if signs.len() * embedding_size != values.len() {
        let actual = if signs.is_empty() {
            values.len()
        } else {
            values.len() / signs.len()
        };

        return Err(EmbeddingError::dimension_mismatch(embedding_size, actual).into());
    }

    let mut index: HashMap<u64, usize> = HashMap::with_capacity(signs.len());
    let mut res = AggregatedGradients {
        signs: Vec::with_capacity(signs.len()),
        grads: Vec::with_capacity(values.len()),
        embedding_size,
        contributions: signs.len(),
    };

    for (i, sign) in signs.iter().enumerate() {
        let row = &values[i * embedding_size..(i + 1) * embedding_size];

        match index.get(sign).copied() {
            Some(pos) => {
                let start = pos * embedding_size;
                sum_f32_vectors(&mut res.grads[start..start + embedding_size], row)?;
            }
            None => {
                index.insert(*sign, res.signs.len());
                res.signs.push(*sign);
                res.grads.extend_from_slice(row);
            }
        }
    }

    Ok(res)
}
