//! Float vector kernels used by embedding store and optimizers.
//!
//! Plain loops over slices, the compiler vectorizes them on stable.

use anyhow::{bail, Result};
use log::error;

use crate::{error_bail, EmbeddingError};

/// Add `b` into `a`. The length of `a` and `b` must be same.
#[inline]
pub fn sum_f32_vectors(a: &mut [f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(EmbeddingError::dimension_mismatch(a.len(), b.len()).into());
    }

    a.iter_mut().zip(b).for_each(|(x, y)| *x += *y);

    Ok(())
}

/// `a += alpha * b`. The length of `a` and `b` must be same.
#[inline]
pub fn axpy(a: &mut [f32], alpha: f32, b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(EmbeddingError::dimension_mismatch(a.len(), b.len()).into());
    }

    a.iter_mut().zip(b).for_each(|(x, y)| *x += alpha * *y);

    Ok(())
}

/// Whether any value is nan or inf.
#[inline]
pub fn has_non_finite(values: &[f32]) -> bool {
    values.iter().any(|x| !x.is_finite())
}

/// Split flat `values` into rows of `dim`.
pub fn split_rows(values: &[f32], dim: usize) -> Result<Vec<Vec<f32>>> {
    if dim == 0 || values.len() % dim != 0 {
        error_bail!(
            "values.len() is not multiple of dim, values.len(): {}, dim: {}",
            values.len(),
            dim,
        );
    }

    Ok(values.chunks(dim).map(|x| x.to_vec()).collect())
}
