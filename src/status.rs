//! The error taxonomy used across every boundary in this crate.
//!
//! Rather than inventing a parallel status type, the core reuses
//! [`tonic::Status`] and [`tonic::Code`] — they already carry a standardized
//! code, a message, an optional details bag, and unwrap transparently via
//! `source()`. This module adds the two things the spec calls out that
//! `tonic` does not ship: the fixed HTTP mapping and the restricted
//! control-plane code set used by the picker.

pub use tonic::{Code, Status};

/// Sentinel message used for every status raised because the owning
/// [`crate::client::Client`] has begun or completed shutdown.
pub const CLIENT_CLOSING_MESSAGE: &str = "client is closing";

/// Codes a well-behaved [`crate::client::balancer::Picker`] must never
/// return. The picker contract reserves these for control-plane use;
/// seeing one escape a `Picker::pick` call means the balancer is buggy, so
/// the snapshot rewrites it to [`Code::Internal`] instead of propagating it.
pub const RESTRICTED_PICKER_CODES: &[Code] = &[
    Code::InvalidArgument,
    Code::NotFound,
    Code::AlreadyExists,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::DataLoss,
];

pub fn is_restricted_picker_code(code: Code) -> bool {
    RESTRICTED_PICKER_CODES.contains(&code)
}

/// A status produced once the client's context has been cancelled because
/// [`crate::client::Client::close`] was called (or is in progress).
pub fn client_closing() -> Status {
    Status::cancelled(CLIENT_CLOSING_MESSAGE)
}

pub fn is_client_closing(status: &Status) -> bool {
    status.code() == Code::Cancelled && status.message() == CLIENT_CLOSING_MESSAGE
}

/// Raised by a [`crate::client::balancer::Picker`] when it holds zero ready
/// remote clients. Distinguished from a generic `Unavailable` so
/// `Client::new_stream` knows to back off and retry rather than fail fast.
pub const NO_AVAILABLE_INSTANCE_MESSAGE: &str = "no available instance";

pub fn no_available_instance() -> Status {
    Status::unavailable(NO_AVAILABLE_INSTANCE_MESSAGE)
}

pub fn is_no_available_instance(status: &Status) -> bool {
    status.code() == Code::Unavailable && status.message() == NO_AVAILABLE_INSTANCE_MESSAGE
}

/// Maps a standard gRPC code to its documented HTTP status code. The mapping
/// is intentionally non-injective: `Internal`, `Unknown` and `DataLoss` all
/// map to 500, and `Aborted`/`AlreadyExists` both map to 409, so
/// [`http_to_code`] cannot be a true inverse for those codes.
pub fn code_to_http(code: Code) -> u16 {
    match code {
        Code::Ok => 200,
        Code::Cancelled => 499,
        Code::InvalidArgument => 400,
        Code::DeadlineExceeded => 504,
        Code::NotFound => 404,
        Code::AlreadyExists => 409,
        Code::PermissionDenied => 403,
        Code::Unauthenticated => 401,
        Code::ResourceExhausted => 429,
        Code::FailedPrecondition => 400,
        Code::Aborted => 409,
        Code::OutOfRange => 400,
        Code::Unimplemented => 501,
        Code::Internal => 500,
        Code::Unavailable => 503,
        Code::DataLoss => 500,
        Code::Unknown => 500,
    }
}

/// Maps an HTTP status code back to the gRPC code the spec documents for it.
/// For the handful of HTTP codes that are not an explicit target of
/// [`code_to_http`], this returns [`Code::Unknown`].
pub fn http_to_code(http_status: u16) -> Code {
    match http_status {
        200 => Code::Ok,
        499 => Code::Cancelled,
        400 => Code::InvalidArgument,
        504 => Code::DeadlineExceeded,
        404 => Code::NotFound,
        403 => Code::PermissionDenied,
        401 => Code::Unauthenticated,
        429 => Code::ResourceExhausted,
        409 => Code::Aborted,
        501 => Code::Unimplemented,
        500 => Code::Internal,
        503 => Code::Unavailable,
        _ => Code::Unknown,
    }
}
