use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ok, Ready};
use futures::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::warn;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Operator API key check. Fails closed when no key is configured.
#[derive(Clone)]
pub struct AuthMiddleware {
    api_key: Option<Rc<str>>,
}

impl AuthMiddleware {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()).map(Rc::from),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddlewareMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddlewareMiddleware {
            service: Rc::new(service),
            api_key: self.api_key.clone(),
        })
    }
}

pub struct AuthMiddlewareMiddleware<S> {
    service: Rc<S>,
    api_key: Option<Rc<str>>,
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let srv = self.service.clone();
        let expected = self.api_key.clone();

        Box::pin(async move {
            // CORS preflight and probes stay open
            if req.method() == actix_web::http::Method::OPTIONS
                || req.path() == "/metrics"
                || req.path() == "/health"
            {
                return srv.call(req).await;
            }

            let Some(expected) = expected else {
                return Err(actix_web::error::ErrorUnauthorized(
                    "API Key not configured on server",
                ));
            };

            let provided = req
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|h| h.to_str().ok());
            if provided == Some(&*expected) {
                return srv.call(req).await;
            }

            warn!(path = %req.path(), "🔒 Rejected operator request with invalid API key");
            Err(actix_web::error::ErrorUnauthorized("Invalid API Key"))
        })
    }
}
