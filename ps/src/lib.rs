//! Parameter server of sparse embeddings.
//!
//! Each ps hosts one shard of every embedding table. Trainers pull embedding vectors of feature
//! ids and push their gradients, the ps sums gradients of the same id and applies the optimizer
//! of the table. Checkpoints are saved per shard, and can be repartitioned for a different shard
//! num.
//!
//! The ps with rank 0 is also the scheduler, which collects the registration of all workers.

pub mod tool;
pub use tool::get_ps_client;

pub mod request_handler;
pub use request_handler::Ps;

pub mod aggregator;
pub mod checkpoint;
pub mod coordinator;
pub mod embedding;
pub mod env;
pub mod initializer;
pub mod optimizer;
pub mod push_tracker;
pub mod registrar;
pub mod server;
pub mod variable_manager;

pub use coordinator::{Coordinator, MembershipState, WorkerView};
pub use env::Env;
