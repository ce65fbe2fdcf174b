use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use ps::registrar::Registrar;
use ps::server::PsServer;
use ps::{Env, Ps};
use util::histogram::{Histogram, HistogramAggregator, HistogramType};
use util::Flags;

#[tokio::main]
async fn main() -> Result<()> {
    util::init_log();

    let flags = Flags::parse();
    let env = Env::from_flags(&flags)?;

    let addr: SocketAddr = format!("0.0.0.0:{}", flags.port).parse()?;
    let shutdown_timeout = env.drain_timeout + Duration::from_millis(1000);

    let (sender, receiver) = mpsc::channel(1024);
    let aggregator = HistogramAggregator::new(receiver, &HistogramType::ps_types());

    let ps = Ps::with_histogram(env, Histogram::new(sender));
    let registrar = Registrar::new(ps.env(), ps.coordinator());
    let server = PsServer::new(ps, addr);

    info!("start ps, rank: {}, port: {}", flags.rank, flags.port);

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("ps_server", |a| server.run(a)));
        s.start(SubsystemBuilder::new("registrar", |a| registrar.run(a)));
        s.start(SubsystemBuilder::new("histogram", |a| aggregator.run(a)));
    })
    .catch_signals()
    .handle_shutdown_requests(shutdown_timeout)
    .await
    .map_err(Into::into)
}
