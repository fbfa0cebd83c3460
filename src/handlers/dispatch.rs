use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::auth::authenticate;
use crate::error::GatewayError;
use crate::metrics::record_outcome;
use crate::rate_limit::{Admission, AdmissionKey};
use crate::routes::ServiceRoute;
use crate::state::AppState;

// metric label for requests that never resolved to a configured service
const NO_SERVICE: &str = "-";

// A request that passed every check and may go upstream
struct Admitted {
    route: Arc<ServiceRoute>,
    upstream_path: String,
}

/// `/svc/rest/of/path` -> `("svc", "rest/of/path")`. An empty first segment
/// is a bad request.
pub fn split_service_path(path: &str) -> Result<(&str, &str), GatewayError> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (service, remainder) = trimmed.split_once('/').unwrap_or((trimmed, ""));

    if service.is_empty() {
        return Err(GatewayError::BadRequest);
    }
    Ok((service, remainder))
}

pub fn rewrite_path(remainder: &str) -> String {
    format!("/{remainder}")
}

// Route -> Authenticate -> Admit. Runs without awaiting, so the limiter is
// never held across upstream I/O.
fn admit_request(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    client: IpAddr,
) -> Result<Admitted, GatewayError> {
    let (service, remainder) = split_service_path(path)?;

    let route = state
        .routes
        .lookup(service)
        .ok_or_else(|| GatewayError::NotFound(service.to_string()))?;

    authenticate(&route.auth, headers).map_err(|reason| GatewayError::Unauthorized {
        reason,
        challenge: route.auth.challenge(),
    })?;

    if let Some(policy) = &route.rate_limit {
        let key = AdmissionKey::new(route.name.as_str(), client);
        if let Admission::Deny { retry_after } = state.limiter.admit(&key, policy) {
            return Err(GatewayError::RateLimited {
                limit: policy.requests_per_window,
                retry_after,
            });
        }
    }

    Ok(Admitted {
        upstream_path: rewrite_path(remainder),
        route,
    })
}

// Every inbound request lands here: Parse -> Route -> Authenticate -> Admit -> Forward
pub async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let client = remote.ip();

    let admitted = match admit_request(&state, request.uri().path(), request.headers(), client) {
        Ok(admitted) => admitted,
        Err(err) => {
            let service = split_service_path(request.uri().path())
                .ok()
                .filter(|(name, _)| state.routes.lookup(name).is_some())
                .map_or(NO_SERVICE, |(name, _)| name);
            tracing::debug!(
                %client,
                method = %request.method(),
                path = %request.uri().path(),
                error = %err,
                "request rejected"
            );
            record_outcome(service, err.outcome());
            return err.into_response();
        }
    };

    let route = admitted.route;
    match state
        .forwarder
        .relay(&route, request, &admitted.upstream_path, client)
        .await
    {
        Ok(response) => {
            record_outcome(&route.name, "forwarded");
            response
        }
        Err(e) => {
            // details stay in the log, the client only sees the status
            tracing::warn!(service = %route.name, %client, error = %e, "upstream request failed");
            let err = GatewayError::from(e);
            record_outcome(&route.name, err.outcome());
            err.into_response()
        }
    }
}
