//! Proto and grpc.
//!
//! This module contains the protos and grpc service used by ps and trainer.

pub mod embedding;
pub mod tool;
