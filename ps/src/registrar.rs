//! Register current ps to the scheduler at startup.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use tokio::select;
use tokio_graceful_shutdown::SubsystemHandle;

use grpc::embedding::{RegisterOption, Role, TensorMessage, WorkerViewOption};
use grpc::tool::{get_error_reason, get_request_inner_options};
use util::EmbeddingError;

use crate::coordinator::{Coordinator, WorkerView};
use crate::env::Env;
use crate::get_ps_client;

pub struct Registrar {
    env: Arc<Env>,

    coordinator: Arc<Coordinator>,

    /// Backoff of first retry, doubled each time.
    initial_backoff: Duration,

    max_backoff: Duration,
}

impl Registrar {
    pub fn new(env: Arc<Env>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            env,
            coordinator,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }

    /// Send one register request to scheduler.
    ///
    /// Rejection by scheduler is returned as `EmbeddingError`, other errors are retriable.
    async fn register_once(&self) -> Result<WorkerView> {
        let mut client = get_ps_client(&self.env.scheduler).await?;

        let option = RegisterOption {
            rank: self.env.rank,
            endpoint: self.env.endpoint.clone(),
        };

        let request = TensorMessage::with_option(Role::Ps, self.env.rank, "", &option)?;

        let response = match client.register(request).await {
            Ok(x) => x.into_inner(),
            Err(status) => {
                return match get_error_reason(&status)
                    .and_then(|reason| EmbeddingError::from_reason(&reason, status.message()))
                {
                    Some(err) => Err(err.into()),
                    None => Err(anyhow!("register failed, status: {}", status)),
                };
            }
        };

        match get_request_inner_options::<WorkerViewOption>(&response) {
            Some(x) => Ok(WorkerView::from_option(&x)),
            None => Err(anyhow!("invalid register response, missing WorkerViewOption")),
        }
    }

    /// Register until success. A late join is fatal, the error stops the whole process.
    pub async fn run(self, subsys: SubsystemHandle) -> Result<()> {
        if self.env.is_scheduler {
            let view = self.coordinator.register(self.env.rank, &self.env.endpoint)?;
            info!(
                "scheduler registered itself, rank: {}, state: {}, version: {}",
                self.env.rank, view.state, view.version,
            );

            return Ok(());
        }

        let mut backoff = self.initial_backoff;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            match self.register_once().await {
                Ok(view) => {
                    info!(
                        "registered to scheduler {}, rank: {}, state: {}, version: {}, attempts: {}",
                        self.env.scheduler, self.env.rank, view.state, view.version, attempts,
                    );

                    self.coordinator.adopt_view(&view);
                    return Ok(());
                }
                Err(err) if err.downcast_ref::<EmbeddingError>().is_some() => {
                    error!(
                        "register to scheduler {} rejected, rank: {}, error: {}",
                        self.env.scheduler, self.env.rank, err,
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        "register to scheduler {} failed, retry in {:?}, attempts: {}, error: {}",
                        self.env.scheduler, backoff, attempts, err,
                    );
                }
            }

            select! {
                _ = tokio::time::sleep(backoff) => {},
                _ = subsys.on_shutdown_requested() => {
                    info!("registrar shutdown before registered, rank: {}", self.env.rank);
                    return Ok(());
                }
            }

            backoff = (backoff * 2).min(self.max_backoff);
        }
    }
}
