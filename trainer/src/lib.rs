pub mod batch_context;
pub use batch_context::BatchContext;

pub mod client;
pub use client::{EmbeddingClient, PushAck, TableConfig};

pub mod membership;

pub mod retry;
pub use retry::RetryPolicy;

pub mod session;
pub use session::WorkerSession;

pub mod transport;
pub use transport::{GrpcTransport, LocalTransport, ShardMethod, ShardTransport};
