use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::metrics::{EndpointLabels, RequestLabels, ResponseLabels, SqlbeeMetrics};

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

const NO_MUTATION_NEEDED: &str = "This resource does not need mutation";

/// Decides on, and possibly patches, an admission request.
pub trait Mutator: Send + Sync {
    fn mutate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse;
}

/// Admission decision without mutation. An error is answered with HTTP 406.
pub trait Admitter: Send + Sync {
    fn admit(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, AdmitError>;
}

/// Cheap pre-check run before the mutator. Returning `false` allows the
/// request unchanged.
pub trait NeedsMutation: Send + Sync {
    fn needs_mutation(&self, request: &AdmissionRequest<DynamicObject>) -> bool;
}

impl<F> Mutator for F
where
    F: Fn(&AdmissionRequest<DynamicObject>) -> AdmissionResponse + Send + Sync,
{
    fn mutate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        self(request)
    }
}

impl<F> Admitter for F
where
    F: Fn(&AdmissionRequest<DynamicObject>) -> Result<AdmissionResponse, AdmitError> + Send + Sync,
{
    fn admit(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, AdmitError> {
        self(request)
    }
}

impl<F> NeedsMutation for F
where
    F: Fn(&AdmissionRequest<DynamicObject>) -> bool + Send + Sync,
{
    fn needs_mutation(&self, request: &AdmissionRequest<DynamicObject>) -> bool {
        self(request)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct AdmitError(pub String);

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to read request body: {0}")]
    ReadBody(#[source] axum::Error),
    #[error("timed out reading request body")]
    ReadTimeout,
    #[error("request body is empty")]
    EmptyBody,
    #[error("failed to deserialize AdmissionReview: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("AdmissionReview has no request")]
    MissingRequest,
    #[error("admission decision failed: {0}")]
    Admit(#[from] AdmitError),
}

impl WebhookError {
    fn status(&self) -> StatusCode {
        match self {
            WebhookError::Admit(_) => StatusCode::NOT_ACCEPTABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn into_response_with_uid(self, uid: Option<String>) -> Response {
        let status = self.status();
        let mut response = AdmissionResponse::invalid(self.to_string());
        if let Some(uid) = uid {
            response.uid = uid;
        }
        (status, Json(response.into_review())).into_response()
    }
}

pub struct AppState {
    pub mutator: Option<Arc<dyn Mutator>>,
    pub needs_mutation: Option<Arc<dyn NeedsMutation>>,
    pub admitter: Option<Arc<dyn Admitter>>,
    pub metrics: SqlbeeMetrics,
    pub read_timeout: Duration,
}

pub type SharedState = Arc<AppState>;

#[derive(Clone, Copy)]
enum Endpoint {
    Mutate,
    Admit,
}

impl Endpoint {
    fn as_str(self) -> &'static str {
        match self {
            Endpoint::Mutate => "mutate",
            Endpoint::Admit => "admit",
        }
    }
}

/// Routes for every configured admission function. All of them require a
/// JSON content type.
pub fn webhook_router(state: SharedState) -> Router {
    let mut router = Router::new();

    if state.mutator.is_some() {
        info!(path = "/mutate", "adding mutating admission endpoint");
        router = router.route(
            "/mutate",
            post(handle_mutate).layer(middleware::from_fn(require_json_content_type)),
        );
    }

    if state.admitter.is_some() {
        info!(path = "/admit", "adding non-mutating admission endpoint");
        router = router.route(
            "/admit",
            post(handle_admit).layer(middleware::from_fn(require_json_content_type)),
        );
    }

    router.with_state(state)
}

pub async fn require_json_content_type(request: Request, next: Next) -> Response {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let essence = content_type.split(';').next().unwrap_or_default().trim();

    if !essence.eq_ignore_ascii_case("application/json") {
        warn!(content_type, uri = %request.uri(), "invalid content type received from client");
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "invalid Content-Type, want `application/json`",
        )
            .into_response();
    }

    next.run(request).await
}

pub async fn handle_mutate(State(state): State<SharedState>, request: Request) -> Response {
    let Some(mutator) = state.mutator.clone() else {
        error!("mutate endpoint called without a mutate function");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let needs_mutation = state.needs_mutation.clone();
    handle_review(&state, request, Endpoint::Mutate, |req| {
        if needs_mutation
            .as_ref()
            .is_some_and(|check| !check.needs_mutation(req))
        {
            info!(
                uid = %req.uid,
                name = %req.name,
                namespace = req.namespace.as_deref().unwrap_or_default(),
                "resource does not need mutation, allowing the request"
            );
            let mut response = AdmissionResponse::from(req);
            response.result.message = NO_MUTATION_NEEDED.to_string();
            return Ok(response);
        }
        Ok(mutator.mutate(req))
    })
    .await
}

pub async fn handle_admit(State(state): State<SharedState>, request: Request) -> Response {
    let Some(admitter) = state.admitter.clone() else {
        error!("admit endpoint called without an admit function");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    handle_review(&state, request, Endpoint::Admit, |req| {
        admitter.admit(req).map_err(WebhookError::from)
    })
    .await
}

async fn handle_review<F>(
    state: &AppState,
    request: Request,
    endpoint: Endpoint,
    decide: F,
) -> Response
where
    F: FnOnce(&AdmissionRequest<DynamicObject>) -> Result<AdmissionResponse, WebhookError>,
{
    let start = Instant::now();
    let wh = endpoint.as_str();

    let body = match read_body(request, state.read_timeout).await {
        Ok(body) => body,
        Err(e) => {
            warn!(endpoint = wh, "failed to read admission request: {e}");
            return e.into_response_with_uid(None);
        }
    };

    let req = match decode_review(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!(endpoint = wh, body_length = body.len(), "{e}");
            return e.into_response_with_uid(request_uid(&body));
        }
    };

    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels {
            endpoint: wh,
            resource: req.resource.resource.clone(),
        })
        .inc();

    let response = match decide(&req) {
        Ok(mut response) => {
            response.uid = req.uid.clone();
            response
        }
        Err(e) => {
            warn!(uid = %req.uid, endpoint = wh, "{e}");
            record_response(state, wh, "rejected", start);
            return e.into_response_with_uid(Some(req.uid.clone()));
        }
    };

    let outcome = outcome(&response);
    info!(
        uid = %req.uid,
        name = %req.name,
        namespace = req.namespace.as_deref().unwrap_or_default(),
        resource = %req.resource.resource,
        endpoint = wh,
        outcome,
        "admission request reviewed"
    );
    record_response(state, wh, outcome, start);

    Json(response.into_review()).into_response()
}

async fn read_body(request: Request, read_timeout: Duration) -> Result<Bytes, WebhookError> {
    let body = tokio::time::timeout(
        read_timeout,
        axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES),
    )
    .await
    .map_err(|_| WebhookError::ReadTimeout)?
    .map_err(WebhookError::ReadBody)?;

    if body.is_empty() {
        return Err(WebhookError::EmptyBody);
    }
    Ok(body)
}

fn decode_review(body: &[u8]) -> Result<AdmissionRequest<DynamicObject>, WebhookError> {
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_slice(body).map_err(WebhookError::Malformed)?;
    review.try_into().map_err(|_| WebhookError::MissingRequest)
}

/// Best effort UID lookup for reviews that failed typed decoding.
fn request_uid(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(body)
        .ok()?
        .pointer("/request/uid")?
        .as_str()
        .map(str::to_string)
}

fn outcome(response: &AdmissionResponse) -> &'static str {
    match (response.allowed, response.patch.is_some()) {
        (true, true) => "patched",
        (true, false) => "allowed",
        (false, _) => "rejected",
    }
}

fn record_response(
    state: &AppState,
    endpoint: &'static str,
    outcome: &'static str,
    start: Instant,
) {
    state
        .metrics
        .admission_responses_total
        .get_or_create(&ResponseLabels { endpoint, outcome })
        .inc();
    state
        .metrics
        .admission_request_duration_seconds
        .get_or_create(&EndpointLabels { endpoint })
        .observe(start.elapsed().as_secs_f64());
}
