use std::time::Duration;

use anyhow::{anyhow, Result};
use log::warn;
use tonic::{Code, Status};

use grpc::embedding::TensorMessage;
use grpc::tool::get_error_reason;
use util::EmbeddingError;

use crate::transport::{ShardMethod, ShardTransport};

/// Timeout and backoff of requests to shards.
///
/// Each attempt is bounded by `timeout`. A failed attempt is retried at most `max_retries` times,
/// the sleep between attempts starts from `initial_backoff` and doubles up to `max_backoff`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy for checkpoint requests, which may take minutes and are not retried.
    pub fn checkpoint() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Sleep before the retry after the `attempt`-th failure, `attempt` starts from 0.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);

        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |x| x.min(self.max_backoff))
    }
}

/// Transport failures worth another attempt. Errors reported by the shard itself are not.
pub fn is_retriable_status(status: &Status) -> bool {
    if get_error_reason(status).is_some_and(|x| x != "INTERNAL") {
        return false;
    }

    matches!(
        status.code(),
        Code::Unavailable | Code::Cancelled | Code::Unknown | Code::DeadlineExceeded
    )
}

/// Map status to `EmbeddingError` by the reason in error info, other status are kept as message.
pub fn status_to_error(status: &Status) -> anyhow::Error {
    let typed = get_error_reason(status)
        .and_then(|reason| EmbeddingError::from_reason(&reason, status.message()));

    match typed {
        Some(err) => err.into(),
        None => anyhow!(
            "grpc error, code: {:?}, message: {}",
            status.code(),
            status.message()
        ),
    }
}

/// Send the request with retry. The same request, including its `seq_id`, is sent in every
/// attempt.
pub async fn call_with_retry(
    transport: &dyn ShardTransport,
    policy: &RetryPolicy,
    shard: usize,
    method: ShardMethod,
    request: TensorMessage,
) -> Result<TensorMessage> {
    let attempts = policy.max_retries + 1;
    let mut last_message = String::new();

    for attempt in 0..attempts {
        let res = tokio::time::timeout(
            policy.timeout,
            transport.call(shard, method, request.clone()),
        )
        .await;

        match res {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(status)) => {
                if !is_retriable_status(&status) {
                    return Err(status_to_error(&status));
                }

                last_message = format!("{:?}: {}", status.code(), status.message());
            }
            Err(_) => {
                last_message = format!("timeout after {:?}", policy.timeout);
            }
        }

        if attempt + 1 < attempts {
            let backoff = policy.backoff(attempt);

            warn!(
                "{} to shard {} failed, attempt: {}, retry after {:?}, error: {}",
                method.as_str(),
                shard,
                attempt + 1,
                backoff,
                last_message,
            );

            tokio::time::sleep(backoff).await;
        }
    }

    Err(EmbeddingError::ShardUnreachable {
        shard,
        attempts,
        message: last_message,
    }
    .into())
}
