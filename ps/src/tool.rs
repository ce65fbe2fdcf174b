use anyhow::Result;
use log::error;
use tonic::{Code, Response, Status};

use grpc::embedding::embedding_ps_client::EmbeddingPsClient;
use grpc::tool::error_status;
use util::{EmbeddingError, MESSAGE_LIMIT};

pub const PS_SERVER_PORT: u16 = 50062;

/// Connect to ps by endpoint, `ip:port`.
pub async fn get_ps_client(ps_endpoint: &str) -> Result<EmbeddingPsClient<tonic::transport::Channel>> {
    let endpoint = if ps_endpoint.starts_with("http://") || ps_endpoint.starts_with("https://") {
        ps_endpoint.to_string()
    } else {
        format!("http://{}", ps_endpoint)
    };

    match EmbeddingPsClient::connect(endpoint).await {
        Ok(client) => Ok(client
            .max_decoding_message_size(MESSAGE_LIMIT)
            .max_encoding_message_size(MESSAGE_LIMIT)),
        Err(err) => Err(err.into()),
    }
}

/// Grpc code of each error kind.
pub fn error_code(err: &EmbeddingError) -> Code {
    match err {
        EmbeddingError::DimensionMismatch { .. }
        | EmbeddingError::OutOfRange { .. }
        | EmbeddingError::Misrouted { .. }
        | EmbeddingError::UnknownOptimizer(_)
        | EmbeddingError::InvalidConfig(_) => Code::InvalidArgument,
        EmbeddingError::UnknownTable(_) => Code::NotFound,
        EmbeddingError::LateJoin { .. }
        | EmbeddingError::ShuttingDown(_)
        | EmbeddingError::CheckpointMismatch(_) => Code::FailedPrecondition,
        EmbeddingError::DuplicatePush { .. } => Code::AlreadyExists,
        EmbeddingError::ShardUnreachable { .. } => Code::Unavailable,
    }
}

/// Convert error to status.
///
/// `EmbeddingError` keeps its kind in the error info reason, other errors are internal.
pub fn to_status(err: &anyhow::Error) -> Status {
    match err.downcast_ref::<EmbeddingError>() {
        Some(x) => error_status(error_code(x), x.reason(), x.to_string()),
        None => error_status(Code::Internal, "INTERNAL", format!("{:#}", err)),
    }
}

/// Log and send error as grpc response.
pub fn send_embedding_error<T>(context: &str, err: anyhow::Error) -> Result<Response<T>, Status> {
    error!("{} failed, error: {:#}", context, err);
    Err(to_status(&err))
}
