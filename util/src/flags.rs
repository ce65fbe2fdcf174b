use clap::{Parser, Subcommand};

/// Command line flags of ps server.
///
/// One ps server runs in each worker process and hosts shard `rank` of every embedding table.
/// The server with rank 0 is the scheduler, all servers register themselves to it.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Flags {
    /// Rank of current worker, also the shard index.
    #[arg(long, default_value_t = 0)]
    pub rank: u32,

    /// Port to listen on.
    #[arg(long, default_value_t = 50062)]
    pub port: u16,

    /// Advertised endpoint, `ip:port`. Use local ip and port if not set.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Scheduler endpoint, `ip:port`. Rank 0 is the scheduler itself if not set.
    #[arg(long)]
    pub scheduler: Option<String>,

    /// Total worker count, which is also the shard count.
    #[arg(long, default_value_t = 1)]
    pub expected_workers: u32,

    /// Accept workers registering after cluster is formed.
    #[arg(long, default_value_t = false)]
    pub elastic: bool,

    /// Max push sequence tokens remembered for each worker and table.
    #[arg(long, default_value_t = 1024)]
    pub max_push_record_size: usize,

    /// Max records in one line of checkpoint file.
    #[arg(long, default_value_t = 10000)]
    pub max_record_iterate_count: usize,

    /// Milliseconds to wait for in-flight requests when draining.
    #[arg(long, default_value_t = 10000)]
    pub drain_timeout_ms: u64,
}

/// Command line flags of ps client.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct ClientFlags {
    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Print worker view of scheduler.
    View {
        /// Scheduler endpoint, `ip:port`.
        #[arg(long)]
        scheduler: String,
    },

    /// Start draining ps servers.
    Drain {
        /// Comma separated ps endpoints, `ip:port`.
        #[arg(long)]
        endpoints: String,
    },

    /// Rewrite a checkpoint for a different shard count.
    Repartition {
        /// Source checkpoint dirname.
        #[arg(long)]
        src: String,

        /// Target checkpoint dirname.
        #[arg(long)]
        dst: String,

        /// New shard count.
        #[arg(long)]
        shard_num: u32,
    },
}
