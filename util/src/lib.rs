mod util;
pub use util::*;

mod shard_router;
pub use shard_router::ShardRouter;

mod flags;
pub use flags::{ClientCommand, ClientFlags, Flags};

mod error;
pub use error::EmbeddingError;

pub mod vector;

pub mod histogram;
