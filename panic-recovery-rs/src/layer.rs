//! # Recovery Middleware
//!
//! Tower middleware that installs the recovery boundary around every
//! request served by a gRPC (tonic/hyper) service.
//!
//! ```ignore
//! Server::builder()
//!     .layer(RecoveryLayer::from_logger(Arc::new(TracingLogger::new("ledger"))))
//!     .add_service(LedgerServer::new(ledger))
//!     .serve(addr)
//!     .await?;
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response};
use tonic::Status;
use tower::{Layer, Service};
use tracing::Instrument;

use crate::boundary::recover_async;
use crate::handler::{new_panic_handler, RecoveryHandlerFunc};
use crate::logging::InterceptLogger;
use crate::types::RecoveryError;

const GRPC_CONTENT_TYPE: &str = "application/grpc";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Maps the recovery error onto the gRPC status sent to the caller
pub fn status_for(err: &RecoveryError) -> Status {
    Status::internal(err.to_string())
}

impl From<RecoveryError> for Status {
    fn from(err: RecoveryError) -> Self {
        status_for(&err)
    }
}

/// Builds a trailers-only gRPC response carrying `INTERNAL`
pub fn internal_response<B: Default>(err: &RecoveryError) -> Response<B> {
    let mut response = Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));

    if status_for(err).add_header(headers).is_err() {
        headers.insert("grpc-status", HeaderValue::from_static("13"));
    }

    response
}

/// Layer for adding the recovery middleware
#[derive(Clone)]
pub struct RecoveryLayer {
    handler: RecoveryHandlerFunc,
}

impl RecoveryLayer {
    pub fn new(handler: RecoveryHandlerFunc) -> Self {
        Self { handler }
    }

    /// Uses the default log-and-generic-error policy bound to `logger`
    pub fn from_logger<L>(logger: Arc<L>) -> Self
    where
        L: InterceptLogger + ?Sized + 'static,
    {
        Self::new(new_panic_handler(logger))
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryMiddleware<S>;

    fn layer(&self, service: S) -> Self::Service {
        RecoveryMiddleware::new(service, self.handler.clone())
    }
}

/// Service wrapper that recovers panics raised by the inner service
#[derive(Clone)]
pub struct RecoveryMiddleware<S> {
    inner: S,
    handler: RecoveryHandlerFunc,
}

impl<S> RecoveryMiddleware<S> {
    pub fn new(inner: S, handler: RecoveryHandlerFunc) -> Self {
        Self { inner, handler }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RecoveryMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Take the instance that was driven to readiness
        let inner = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner);
        let handler = self.handler.clone();

        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let span = tracing::info_span!(
            "grpc_request",
            path = %request.uri().path(),
            request_id = request_id.as_deref(),
        );

        Box::pin(
            async move {
                // `inner.call` runs inside the guard so a panic raised before
                // its future exists is caught as well
                match recover_async(&handler, async move { inner.call(request).await }).await {
                    Ok(result) => result,
                    Err(err) => Ok(internal_response(&err)),
                }
            }
            .instrument(span),
        )
    }
}
