use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use log::info;

use grpc::embedding::CreateOption;
use util::EmbeddingError;

use crate::embedding::Embedding;

/// All embedding variable manager.
///
/// use the embedding varname as the key, Embedding as the value.
#[derive(Default)]
pub struct EmbeddingManager {
    vars: DashMap<String, Arc<Embedding>>,
}

impl EmbeddingManager {
    /// Add a new Embedding.
    ///
    /// Every worker creates all tables at compile time, so the same table arrives once per worker.
    /// Creating an existing table with the same embedding size and optimizer is a no-op, a different
    /// embedding size is rejected. `delete_var` drops the existing table first.
    pub fn add_new_var(&self, varname: &str, option: &CreateOption) -> Result<()> {
        if option.delete_var {
            if self.vars.remove(varname).is_some() {
                info!("delete existing embedding, varname: {}", varname);
            }
        }

        if let Some(existing) = self.vars.get(varname) {
            return Self::check_same_config(&existing, option);
        }

        let embedding = Embedding::new(varname, option)?;

        // Keep the first one when two creations race.
        let existing = self
            .vars
            .entry(varname.to_string())
            .or_insert_with(|| Arc::new(embedding))
            .value()
            .clone();

        Self::check_same_config(&existing, option)
    }

    fn check_same_config(existing: &Embedding, option: &CreateOption) -> Result<()> {
        if existing.embedding_size != option.emb_size as usize {
            return Err(EmbeddingError::invalid_config(format!(
                "embedding size is immutable, varname: {}, existing: {}, new: {}",
                existing.varname, existing.embedding_size, option.emb_size
            ))
            .into());
        }

        if let Some(optimizer) = option.optimizer.as_ref() {
            if !optimizer.name.eq_ignore_ascii_case(existing.optimizer_name()) {
                return Err(EmbeddingError::invalid_config(format!(
                    "optimizer is immutable, varname: {}, existing: {}, new: {}",
                    existing.varname,
                    existing.optimizer_name(),
                    optimizer.name
                ))
                .into());
            }
        }

        if existing.shard_num != option.shard_num as usize
            || existing.shard_index != option.shard_idx as usize
        {
            return Err(EmbeddingError::invalid_config(format!(
                "shard is immutable, varname: {}, existing: {}/{}, new: {}/{}",
                existing.varname,
                existing.shard_index,
                existing.shard_num,
                option.shard_idx,
                option.shard_num
            ))
            .into());
        }

        Ok(())
    }

    pub fn get(&self, varname: &str) -> Option<Arc<Embedding>> {
        self.vars.get(varname).map(|x| x.value().clone())
    }

    /// Get the Embedding or fail with `UnknownTable`.
    pub fn get_or_err(&self, varname: &str) -> Result<Arc<Embedding>> {
        match self.get(varname) {
            Some(x) => Ok(x),
            None => Err(EmbeddingError::UnknownTable(varname.to_string()).into()),
        }
    }

    pub fn remove(&self, varname: &str) -> Option<Arc<Embedding>> {
        self.vars.remove(varname).map(|(_, x)| x)
    }

    /// All varnames, sorted.
    pub fn varnames(&self) -> Vec<String> {
        let mut res = self.vars.iter().map(|x| x.key().clone()).collect::<Vec<_>>();
        res.sort();
        res
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
