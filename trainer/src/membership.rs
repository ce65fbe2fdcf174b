use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{error, info, warn};
use tokio::time::Instant;
use tonic::Request;

use grpc::embedding::{Role, TensorMessage, VoidMessage, WorkerViewOption};
use grpc::tool::get_request_inner_options;
use ps::{get_ps_client, MembershipState, WorkerView};
use util::{error_bail, EmbeddingError};

use crate::retry::status_to_error;

/// Get current view from scheduler.
pub async fn fetch_view(scheduler: &str) -> Result<WorkerView> {
    let mut client = get_ps_client(scheduler).await?;

    let request = TensorMessage::with_option(Role::Trainer, 0, "", &VoidMessage::default())?;

    let response = match client.get_view(Request::new(request)).await {
        Ok(x) => x.into_inner(),
        Err(status) => return Err(status_to_error(&status)),
    };

    match get_request_inner_options::<WorkerViewOption>(&response) {
        Some(x) => Ok(WorkerView::from_option(&x)),
        None => {
            error_bail!("invalid view response from scheduler {}", scheduler);
        }
    }
}

/// Poll views from `fetch` until the cluster is active.
///
/// Fetch errors are retried until the timeout. A draining or closed cluster fails immediately.
pub async fn wait_for_active<F, Fut>(mut fetch: F, timeout: Duration, interval: Duration) -> Result<WorkerView>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<WorkerView>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        match fetch().await {
            Ok(view) if view.state == MembershipState::Active => {
                info!(
                    "cluster is active, version: {}, workers: {}",
                    view.version,
                    view.endpoints.len()
                );
                return Ok(view);
            }
            Ok(view) if !view.state.is_serving() => {
                return Err(EmbeddingError::ShuttingDown(view.state.to_string()).into());
            }
            Ok(view) => {
                info!(
                    "wait for cluster, state: {}, registered: {}/{}",
                    view.state,
                    view.endpoints.len(),
                    view.expected_workers,
                );
            }
            Err(err) => {
                warn!("fetch view failed, error: {:#}", err);
            }
        }

        if Instant::now() + interval > deadline {
            error_bail!("cluster is not active after {:?}", timeout);
        }

        tokio::time::sleep(interval).await;
    }
}

/// Wait until the cluster of `scheduler` is active.
pub async fn wait_for_scheduler(scheduler: &str, timeout: Duration) -> Result<WorkerView> {
    wait_for_active(|| fetch_view(scheduler), timeout, Duration::from_millis(500)).await
}
