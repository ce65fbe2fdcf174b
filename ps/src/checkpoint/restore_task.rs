use std::io::BufRead;
use std::marker::PhantomData;
use std::path::Path;

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{error, info};

use grpc::embedding::{SparseShardData, SparseShardHeader};
use util::{error_bail, EmbeddingError};

use crate::embedding::Embedding;

use super::file_handler::{FileReader, LocalFileReader};
use super::tool::{records_from_chunk, CheckpointContext, ShardRecord};

/// Parse proto from base64 string.
#[inline]
pub fn parse_proto_base64<M: prost::Message + Default>(line: &str) -> Result<M> {
    let s = match STANDARD.decode(line) {
        Ok(x) => x,
        Err(err) => {
            error_bail!("decode line base64 failed! error: {}", err);
        }
    };

    match M::decode(s.as_slice()) {
        Ok(x) => Ok(x),
        Err(err) => {
            error_bail!("parse proto failed! error: {}", err);
        }
    }
}

/// Read header and all records of a shard file.
pub fn read_shard_file<R: FileReader>(filename: &str) -> Result<(SparseShardHeader, Vec<ShardRecord>)> {
    let reader = R::get_reader(filename)?;
    let mut lines = reader.lines();

    let header = match lines.next() {
        Some(line) => parse_proto_base64::<SparseShardHeader>(&line?)?,
        None => {
            return Err(EmbeddingError::CheckpointMismatch(format!(
                "empty checkpoint file: {}",
                filename
            ))
            .into());
        }
    };

    let mut records = Vec::new();

    for line in lines {
        let line = line?;
        if line.is_empty() {
            continue;
        }

        let chunk = parse_proto_base64::<SparseShardData>(&line)?;
        records.extend(records_from_chunk(&chunk, &header)?);
    }

    Ok((header, records))
}

/// Restore sparse embedding parameters of one shard from file.
///
/// It's easy to change `R` to hdfs file reader or other reader.
pub struct RestoreSparseTask<R: FileReader> {
    /// Context parameters for different task.
    pub context: CheckpointContext,

    /// R is not used in field, only used when `run` is executed, so must use `PhantomData` to mark it.
    marker: PhantomData<R>,
}

impl<R: FileReader> RestoreSparseTask<R> {
    pub fn new(context: &CheckpointContext) -> Self {
        Self {
            context: context.clone(),
            marker: PhantomData,
        }
    }

    /// The checkpoint must be saved from a table with same layout.
    fn check_header(&self, header: &SparseShardHeader, embedding: &Embedding) -> Result<()> {
        let mismatch = |what: &str, saved: String, current: String| -> anyhow::Error {
            EmbeddingError::CheckpointMismatch(format!(
                "{} differs, varname: {}, checkpoint: {}, table: {}",
                what, embedding.varname, saved, current
            ))
            .into()
        };

        if header.varname != embedding.varname {
            return Err(mismatch(
                "varname",
                header.varname.clone(),
                embedding.varname.clone(),
            ));
        }

        if header.shard_num as usize != embedding.shard_num {
            return Err(mismatch(
                "shard_num",
                header.shard_num.to_string(),
                embedding.shard_num.to_string(),
            ));
        }

        if header.shard_index as usize != embedding.shard_index {
            return Err(mismatch(
                "shard_index",
                header.shard_index.to_string(),
                embedding.shard_index.to_string(),
            ));
        }

        if header.embedding_size as usize != embedding.embedding_size {
            return Err(mismatch(
                "embedding_size",
                header.embedding_size.to_string(),
                embedding.embedding_size.to_string(),
            ));
        }

        if header.include_optimizer {
            if !header.optimizer.eq_ignore_ascii_case(embedding.optimizer_name()) {
                return Err(mismatch(
                    "optimizer",
                    header.optimizer.clone(),
                    embedding.optimizer_name().to_string(),
                ));
            }

            if header.state_dim as usize != embedding.state_dim() {
                return Err(mismatch(
                    "state_dim",
                    header.state_dim.to_string(),
                    embedding.state_dim().to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Replace all parameters of the shard with the checkpoint, return the record count.
    ///
    /// Every record is parsed and checked before the store is touched, a broken file leaves the
    /// table as is.
    pub fn run(&self, embedding: &Embedding) -> Result<u64> {
        let filename = self.context.filename();

        info!(
            "restore task start, varname: {}, shard_index: {}, filename: {}",
            self.context.varname, self.context.shard_index, filename,
        );

        if !Path::new(&filename).exists() {
            return Err(EmbeddingError::CheckpointMismatch(format!(
                "no checkpoint file of shard {}, filename: {}",
                self.context.shard_index, filename
            ))
            .into());
        }

        let (header, records) = read_shard_file::<R>(&filename)?;
        self.check_header(&header, embedding)?;

        for record in records.iter() {
            if let Err(err) = embedding.check_restored(record) {
                error!(
                    "invalid record in checkpoint, filename: {}, sign: {}, error: {:#}",
                    filename, record.id, err,
                );
                return Err(err);
            }
        }

        let total_count = records.len() as u64;
        embedding.replace_all(records, header.step);

        info!(
            "restore sparse shard done, varname: {}, shard_index: {}, record_count: {}, step: {}",
            self.context.varname, self.context.shard_index, total_count, header.step,
        );

        Ok(total_count)
    }
}

pub type RestoreSparseFromLocalTask = RestoreSparseTask<LocalFileReader>;
