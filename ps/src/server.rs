use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use tokio_graceful_shutdown::SubsystemHandle;
use tonic::transport::Server;

use grpc::embedding::embedding_ps_server::EmbeddingPsServer;
use util::MESSAGE_LIMIT;

use crate::coordinator::Coordinator;
use crate::request_handler::Ps;

/// Grpc server subsystem of ps.
///
/// On shutdown the coordinator drains first, so in-flight pulls and pushes finish before the
/// server stops.
pub struct PsServer {
    ps: Ps,
    addr: SocketAddr,
}

impl PsServer {
    pub fn new(ps: Ps, addr: SocketAddr) -> Self {
        Self { ps, addr }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<()> {
        let coordinator: Arc<Coordinator> = self.ps.coordinator();
        let drain_timeout = self.ps.env().drain_timeout;

        let shutdown = async move {
            subsys.on_shutdown_requested().await;

            let state = coordinator.begin_drain();
            info!("ps shutdown requested, state: {}", state);

            if !coordinator.wait_closed(drain_timeout).await {
                warn!(
                    "stop ps with {} requests in flight",
                    coordinator.in_flight()
                );
            }
        };

        info!("Starting gRPC Server, addr: {}", self.addr);

        Server::builder()
            .add_service(
                EmbeddingPsServer::new(self.ps)
                    .max_decoding_message_size(MESSAGE_LIMIT)
                    .max_encoding_message_size(MESSAGE_LIMIT),
            )
            .serve_with_shutdown(self.addr, shutdown)
            .await?;

        info!("gRPC Server stopped");

        Ok(())
    }
}
