//! The Interceptor contract consumed by [`crate::client::Client`] (§6.1):
//! the standard onion model, terminating in `newStream`. Composing a chain
//! out of a list of interceptors is an application concern (§1 Non-goals);
//! this crate only defines the interface a single interceptor implements.

use async_trait::async_trait;

use crate::status::Status;

/// One unary call as seen by an interceptor, before `newStream` runs.
pub struct UnaryCall<'a> {
    pub method: &'a str,
    pub request: &'a [u8],
}

#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    /// Runs before (and, if it chooses to call through, after) the rest of
    /// the chain. Returning `Err` short-circuits without invoking `next`.
    async fn intercept(&self, call: UnaryCall<'_>) -> Result<(), Status>;
}

#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    /// Runs before `newStream` opens the underlying stream for `method`.
    async fn intercept(&self, method: &str) -> Result<(), Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectEverything;

    #[async_trait]
    impl UnaryInterceptor for RejectEverything {
        async fn intercept(&self, call: UnaryCall<'_>) -> Result<(), Status> {
            Err(Status::permission_denied(format!("{} is not allowed", call.method)))
        }
    }

    #[tokio::test]
    async fn an_interceptor_can_reject_before_newstream_runs() {
        let interceptor = RejectEverything;
        let err = interceptor
            .intercept(UnaryCall { method: "/X/Y", request: b"" })
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::PermissionDenied);
    }
}
