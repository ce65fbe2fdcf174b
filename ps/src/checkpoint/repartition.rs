//! Rewrite a checkpoint for a different shard num.
//!
//! A checkpoint can only be restored into tables with the same shard num. To change the number of
//! workers, every table is read from all of its shard files and routed again with the new shard num.
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use anyhow::{bail, Result};
use log::{error, info};

use grpc::embedding::{SparseShardData, SparseShardHeader};
use util::{error_bail, EmbeddingError, ShardRouter};

use super::file_handler::{FileReader, FileWriter, LocalFileReader, LocalFileWriter};
use super::restore_task::read_shard_file;
use super::save_task::append_proto_base64_to_file;
use super::tool::{clear_chunk, get_shard_filename, parse_shard_filename, push_record};

#[derive(Clone, Debug, PartialEq)]
pub struct RepartitionResult {
    pub varname: String,

    /// Shard num of source checkpoint.
    pub src_shard_num: u32,

    pub record_count: u64,
}

/// Group shard files in `src` by varname, shard index ordered.
fn list_shard_files(src: &str) -> Result<BTreeMap<String, BTreeMap<u32, String>>> {
    let mut res: BTreeMap<String, BTreeMap<u32, String>> = BTreeMap::new();

    let entries = match fs::read_dir(src) {
        Ok(x) => x,
        Err(err) => {
            error_bail!("read checkpoint dir failed, src: {}, error: {}", src, err);
        }
    };

    for entry in entries {
        let path = entry?.path();

        let filename = match path.to_str() {
            Some(x) => x.to_string(),
            None => continue,
        };

        if let Some((varname, shard_index)) = parse_shard_filename(&filename) {
            res.entry(varname).or_default().insert(shard_index, filename);
        }
    }

    Ok(res)
}

/// The headers of all shards of one table must describe the same table.
fn check_same_table(first: &SparseShardHeader, other: &SparseShardHeader) -> Result<()> {
    if first.shard_num != other.shard_num
        || first.embedding_size != other.embedding_size
        || first.optimizer != other.optimizer
        || first.state_dim != other.state_dim
        || first.include_optimizer != other.include_optimizer
    {
        return Err(EmbeddingError::CheckpointMismatch(format!(
            "shards of varname {} have different headers, shard {}: {:?}, shard {}: {:?}",
            first.varname, first.shard_index, first, other.shard_index, other
        ))
        .into());
    }

    Ok(())
}

fn repartition_table<R: FileReader, W: FileWriter>(
    varname: &str,
    files: &BTreeMap<u32, String>,
    dst: &str,
    router: &ShardRouter,
    max_record_iterate_count: usize,
) -> Result<RepartitionResult> {
    let max_count = max_record_iterate_count.max(1);
    let new_shard_num = router.shard_num() as u32;

    let mut writers = Vec::with_capacity(router.shard_num());
    let mut chunks = vec![SparseShardData::default(); router.shard_num()];
    let mut first_header: Option<SparseShardHeader> = None;
    let mut record_count: u64 = 0;

    for (shard_index, filename) in files.iter() {
        let (header, records) = read_shard_file::<R>(filename)?;

        if header.varname != varname || header.shard_index != *shard_index {
            return Err(EmbeddingError::CheckpointMismatch(format!(
                "header does not match filename, filename: {}, varname: {}, shard_index: {}",
                filename, header.varname, header.shard_index
            ))
            .into());
        }

        match first_header.as_ref() {
            Some(first) => check_same_table(first, &header)?,
            None => {
                if header.shard_num as usize != files.len()
                    || files.keys().copied().ne(0..header.shard_num)
                {
                    return Err(EmbeddingError::CheckpointMismatch(format!(
                        "missing shard files, varname: {}, shard_num: {}, found: {:?}",
                        varname,
                        header.shard_num,
                        files.keys().collect::<Vec<_>>()
                    ))
                    .into());
                }

                for i in 0..new_shard_num {
                    let filename = get_shard_filename(dst, varname, i);
                    let tmp_filename = format!("{}.tmp", filename);

                    let mut writer = W::get_writer(&tmp_filename)?;

                    let new_header = SparseShardHeader {
                        shard_index: i,
                        shard_num: new_shard_num,
                        ..header.clone()
                    };
                    append_proto_base64_to_file(&new_header, &mut writer)?;

                    writers.push((writer, tmp_filename, filename));
                }

                first_header = Some(header.clone());
            }
        }

        for record in records {
            let target = router.route(record.id);
            let chunk = &mut chunks[target];

            push_record(chunk, record.id, &record.weight, record.state.as_ref());
            record_count += 1;

            if chunk.id.len() >= max_count {
                append_proto_base64_to_file(&*chunk, &mut writers[target].0)?;
                clear_chunk(chunk);
            }
        }
    }

    let src_shard_num = first_header.map(|x| x.shard_num).unwrap_or(0);

    for (i, (mut writer, tmp_filename, filename)) in writers.into_iter().enumerate() {
        if !chunks[i].id.is_empty() {
            append_proto_base64_to_file(&chunks[i], &mut writer)?;
        }

        writer.flush()?;
        drop(writer);

        W::commit(&tmp_filename, &filename)?;
    }

    info!(
        "repartition done, varname: {}, shard_num: {} -> {}, record_count: {}",
        varname, src_shard_num, new_shard_num, record_count,
    );

    Ok(RepartitionResult {
        varname: varname.to_string(),
        src_shard_num,
        record_count,
    })
}

/// Rewrite every table in `src` into `dst` with `new_shard_num` shards.
pub fn repartition<R: FileReader, W: FileWriter>(
    src: &str,
    dst: &str,
    new_shard_num: u32,
    max_record_iterate_count: usize,
) -> Result<Vec<RepartitionResult>> {
    let router = ShardRouter::new(new_shard_num as usize)?;

    if src.trim_end_matches('/') == dst.trim_end_matches('/') {
        error_bail!("src and dst of repartition must be different, path: {}", src);
    }

    let tables = list_shard_files(src)?;
    if tables.is_empty() {
        error_bail!("no checkpoint file found in {}", src);
    }

    let mut res = Vec::with_capacity(tables.len());

    for (varname, files) in tables.iter() {
        res.push(repartition_table::<R, W>(
            varname,
            files,
            dst,
            &router,
            max_record_iterate_count,
        )?);
    }

    Ok(res)
}

pub fn repartition_local(
    src: &str,
    dst: &str,
    new_shard_num: u32,
    max_record_iterate_count: usize,
) -> Result<Vec<RepartitionResult>> {
    repartition::<LocalFileReader, LocalFileWriter>(src, dst, new_shard_num, max_record_iterate_count)
}
