use std::io::Write;
use std::marker::PhantomData;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::info;

use grpc::embedding::{SparseShardData, SparseShardHeader};

use crate::embedding::Embedding;

use super::file_handler::{FileWriter, LocalFileWriter};
use super::tool::{clear_chunk, push_record, CheckpointContext};

/// Encode message to base64, then save to one line in file.
#[inline]
pub fn append_proto_base64_to_file<M: prost::Message, W: Write>(
    message: &M,
    writer: &mut W,
) -> Result<()> {
    let mut buf = Vec::new();

    message.encode(&mut buf)?;

    let s = STANDARD.encode(&buf);
    writer.write_all(s.as_bytes())?;
    writer.write_all("\n".as_bytes())?;

    Ok(())
}

/// Save sparse embedding parameters of one shard to file.
///
/// It's easy to change W to hdfs file writer or other writer.
pub struct SaveSparseTask<W: FileWriter> {
    /// Context parameters for different task.
    pub context: CheckpointContext,

    /// W is not used in field, only used when `run` is executed, so must use `PhantomData` to mark it.
    marker: PhantomData<W>,
}

impl<W: FileWriter> SaveSparseTask<W> {
    pub fn new(context: &CheckpointContext) -> Self {
        Self {
            context: context.clone(),
            marker: PhantomData,
        }
    }

    /// Save sparse parameters, return the record count.
    ///
    /// Optimizer state is skipped when `include_optimizer` is false. The parameters are copied
    /// between two pushes, the header records the latest applied push step of the copy.
    pub fn run(&self, embedding: &Embedding) -> Result<u64> {
        let filename = self.context.filename();
        let tmp_filename = format!("{}.tmp", filename);

        info!(
            "save task start, varname: {}, shard_index: {}, filename: {}",
            self.context.varname, self.context.shard_index, filename,
        );

        let include_optimizer = self.context.include_optimizer;
        let snapshot = embedding.snapshot(include_optimizer);

        let mut writer = W::get_writer(&tmp_filename)?;

        let header = SparseShardHeader {
            varname: embedding.varname.clone(),
            shard_index: embedding.shard_index as u32,
            shard_num: embedding.shard_num as u32,
            embedding_size: embedding.embedding_size as u32,
            optimizer: embedding.optimizer_name().to_string(),
            state_dim: if include_optimizer { embedding.state_dim() as u32 } else { 0 },
            include_optimizer,
            step: snapshot.step,
        };

        append_proto_base64_to_file(&header, &mut writer)?;

        let max_count = self.context.max_record_iterate_count.max(1);

        let mut chunk = SparseShardData::default();
        chunk.id.reserve(max_count);
        chunk.weight.reserve(max_count * embedding.embedding_size);

        let total = snapshot.records.len() as u64;

        for record in snapshot.records.iter() {
            push_record(&mut chunk, record.id, &record.weight, record.state.as_ref());

            if chunk.id.len() >= max_count {
                // When reach max_record_iterate_count, save one line to file, then clear.
                append_proto_base64_to_file(&chunk, &mut writer)?;
                clear_chunk(&mut chunk);
            }
        }

        // The remain parameters.
        if !chunk.id.is_empty() {
            append_proto_base64_to_file(&chunk, &mut writer)?;
        }

        writer.flush()?;
        drop(writer);

        W::commit(&tmp_filename, &filename)?;

        info!(
            "save sparse shard done, varname: {}, shard_index: {}, shard_num: {}, record_count: {}, step: {}",
            self.context.varname, self.context.shard_index, self.context.shard_num, total, snapshot.step,
        );

        Ok(total)
    }
}

pub type SaveSparseToLocalTask = SaveSparseTask<LocalFileWriter>;
