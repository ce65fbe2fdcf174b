use std::collections::HashMap;

use prost::{Message, Name};
use tonic::{Code, Response, Status};
use tonic_types::{ErrorDetails, StatusExt};

use crate::embedding::TensorMessage;

/// Domain of error info in grpc status.
pub const ERROR_DOMAIN: &str = "embedding.ps";

/// Send error message of bad request for grpc request.
pub fn send_bad_request_error<T>(
    field: impl Into<String>,
    description: impl Into<String>,
) -> Result<Response<T>, Status> {
    let mut err_details = ErrorDetails::new();
    err_details.add_bad_request_violation(field, description);

    let status = Status::with_error_details(
        Code::InvalidArgument,
        "request contains invalid arguments",
        err_details,
    );

    Err(status)
}

/// Build status with error info, `reason` is used by client to recover the error kind.
pub fn error_status(code: Code, reason: impl Into<String>, message: impl Into<String>) -> Status {
    let message: String = message.into();

    let mut err_details = ErrorDetails::new();
    err_details.set_error_info(reason, ERROR_DOMAIN, HashMap::<String, String>::new());

    Status::with_error_details(code, message, err_details)
}

/// Get reason of error info in status, if there is one.
pub fn get_error_reason(status: &Status) -> Option<String> {
    status
        .get_error_details()
        .error_info()
        .map(|info| info.reason.clone())
}

/// Get inner options of TensorMessage from Any to specified proto type.
pub fn get_request_inner_options<T: Message + Name + Default>(
    request: &TensorMessage,
) -> Option<T> {
    match request.options.as_ref() {
        Some(x) => x.to_msg::<T>().ok(),
        None => None,
    }
}
