use std::time::Duration;

use anyhow::{bail, Result};
use log::{error, info};

use util::{error_bail, EmbeddingError, Flags};

use crate::tool::PS_SERVER_PORT;

/// Global env for ps server.
///
/// Built from command line flags once at startup and shared by all handlers.
#[derive(Clone, Debug)]
pub struct Env {
    /// Rank of current worker, also the shard index of every table hosted here.
    pub rank: u32,

    /// Advertised endpoint of current ps.
    pub endpoint: String,

    /// Endpoint of scheduler ps.
    pub scheduler: String,

    /// Whether current ps is the scheduler.
    pub is_scheduler: bool,

    /// Total workers, also the shard num.
    pub expected_workers: u32,

    /// Accept registration after the cluster is formed.
    pub elastic: bool,

    /// Max push sequence tokens remembered for each worker and table.
    pub max_push_record_size: usize,

    /// Max records in one line of checkpoint file.
    pub max_record_iterate_count: usize,

    /// Time to wait for in-flight requests when draining.
    pub drain_timeout: Duration,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            rank: 0,
            endpoint: format!("127.0.0.1:{}", PS_SERVER_PORT),
            scheduler: format!("127.0.0.1:{}", PS_SERVER_PORT),
            is_scheduler: true,
            expected_workers: 1,
            elastic: false,
            max_push_record_size: 1024,
            max_record_iterate_count: 10000,
            drain_timeout: Duration::from_millis(10000),
        }
    }
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Env of a standalone shard, used by in-process clusters.
    pub fn with_rank(rank: u32, expected_workers: u32) -> Self {
        Self {
            rank,
            is_scheduler: rank == 0,
            expected_workers,
            ..Self::default()
        }
    }

    /// Build env from command line flags.
    ///
    /// Endpoint defaults to local ip and port. Scheduler defaults to current endpoint when rank is 0.
    pub fn from_flags(flags: &Flags) -> Result<Self> {
        if flags.expected_workers == 0 {
            return Err(EmbeddingError::invalid_config("expected_workers must be bigger than 0").into());
        }

        if flags.rank >= flags.expected_workers {
            error_bail!(
                "rank must be less than expected_workers, rank: {}, expected_workers: {}",
                flags.rank,
                flags.expected_workers,
            );
        }

        let endpoint = match &flags.endpoint {
            Some(x) => x.clone(),
            None => {
                let ip = match local_ip_address::local_ip() {
                    Ok(x) => x.to_string(),
                    Err(err) => {
                        error_bail!("get local ip failed, error: {}", err);
                    }
                };

                format!("{}:{}", ip, flags.port)
            }
        };

        let (scheduler, is_scheduler) = match &flags.scheduler {
            Some(x) => (x.clone(), *x == endpoint),
            None => {
                if flags.rank != 0 {
                    error_bail!("scheduler must be set for rank {}", flags.rank);
                }

                (endpoint.clone(), true)
            }
        };

        let env = Self {
            rank: flags.rank,
            endpoint,
            scheduler,
            is_scheduler,
            expected_workers: flags.expected_workers,
            elastic: flags.elastic,
            max_push_record_size: flags.max_push_record_size,
            max_record_iterate_count: flags.max_record_iterate_count,
            drain_timeout: Duration::from_millis(flags.drain_timeout_ms),
        };

        info!(
            "ps env, rank: {}, endpoint: {}, scheduler: {}, is_scheduler: {}, expected_workers: {}",
            env.rank, env.endpoint, env.scheduler, env.is_scheduler, env.expected_workers,
        );

        Ok(env)
    }
}
