//! Save and restore sparse embedding parameters.
//!
//! Each shard of a table is saved to its own file `{path}/{varname}.{shard_index}.embedding`. The
//! first line is a base64 encoded `SparseShardHeader`, the following lines are base64 encoded
//! `SparseShardData` chunks.
pub mod file_handler;
pub mod repartition;
pub mod restore_task;
pub mod save_task;
pub mod tool;
