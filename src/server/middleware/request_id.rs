//! `X-Request-ID` response header middleware. Echoes a client-supplied
//! header if present (so it matches a `requestId` the client also put in
//! the JSON body), otherwise mints one. Route handlers that derive their
//! own `requestId` (chat completions) overwrite this header with the
//! engine's resolved id; this middleware guarantees every response still
//! carries one even for routes that never touch the lifecycle engine.

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use futures::future::{ready, Ready};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct RequestIdMiddleware;

impl<S, B> Transform<S, ServiceRequest> for RequestIdMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type InitError = ();
    type Transform = RequestIdMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestIdMiddlewareService { service }))
    }
}

pub struct RequestIdMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestIdMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let incoming = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let request_id = incoming.unwrap_or_else(|| Uuid::new_v4().to_string());

        let fut = self.service.call(req);
        Box::pin(async move {
            let mut res = fut.await?;
            // A handler that already derived its own requestId (chat
            // completions) sets this header itself; that value wins.
            if !res.headers().contains_key(REQUEST_ID_HEADER) {
                res.headers_mut().insert(
                    HeaderName::from_static("x-request-id"),
                    HeaderValue::from_str(&request_id).unwrap_or_else(|_| HeaderValue::from_static("invalid")),
                );
            }
            Ok(res)
        })
    }
}
