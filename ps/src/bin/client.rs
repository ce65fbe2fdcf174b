use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;

use grpc::embedding::{Role, TensorMessage, VoidMessage, WorkerViewOption};
use grpc::tool::get_request_inner_options;
use ps::checkpoint::repartition::repartition_local;
use ps::{get_ps_client, WorkerView};
use util::{split_endpoints, ClientCommand, ClientFlags};

/// Max records in one line of rewritten checkpoint.
const MAX_RECORD_ITERATE_COUNT: usize = 10000;

async fn print_view(scheduler: &str) -> Result<()> {
    let mut client = get_ps_client(scheduler).await?;

    let request = TensorMessage::with_option(Role::Trainer, 0, "", &VoidMessage::default())?;
    let response = client.get_view(request).await?.into_inner();

    let view = match get_request_inner_options::<WorkerViewOption>(&response) {
        Some(x) => WorkerView::from_option(&x),
        None => return Err(anyhow!("invalid get_view response from {}", scheduler)),
    };

    info!(
        "view of {}, version: {}, state: {}, expected_workers: {}",
        scheduler, view.version, view.state, view.expected_workers,
    );

    for (rank, endpoint) in view.endpoints.iter() {
        info!("rank: {}, endpoint: {}", rank, endpoint);
    }

    Ok(())
}

async fn drain(endpoints: &str) -> Result<()> {
    let endpoints = split_endpoints(endpoints);
    if endpoints.is_empty() {
        return Err(anyhow!("no endpoint to drain"));
    }

    for endpoint in endpoints.iter() {
        let mut client = get_ps_client(endpoint).await?;

        let request = TensorMessage::with_option(Role::Trainer, 0, "", &VoidMessage::default())?;
        client.drain(request).await?;

        info!("drain requested, endpoint: {}", endpoint);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    util::init_log();

    let flags = ClientFlags::parse();

    match flags.command {
        ClientCommand::View { scheduler } => print_view(&scheduler).await,
        ClientCommand::Drain { endpoints } => drain(&endpoints).await,
        ClientCommand::Repartition {
            src,
            dst,
            shard_num,
        } => {
            let results = tokio::task::spawn_blocking(move || {
                repartition_local(&src, &dst, shard_num, MAX_RECORD_ITERATE_COUNT)
            })
            .await??;

            for x in results.iter() {
                info!(
                    "repartitioned varname: {}, shard_num: {} -> {}, record_count: {}",
                    x.varname, x.src_shard_num, shard_num, x.record_count,
                );
            }

            Ok(())
        }
    }
}
