//! Tower middleware for the control-plane HTTP listener.
//!
//! Layers are listed outermost first: the first layer sees the request first
//! and the response last.

use axum::http::header::HeaderName;
use axum::http::StatusCode;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::ControlConfig;

type ControlLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            TraceLayer<
                tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
            >,
            tower::layer::util::Stack<
                SetRequestIdLayer<MakeRequestUuid>,
                tower::layer::util::Identity,
            >,
        >,
    >,
>;

/// Builds the control-plane middleware stack.
///
/// 1. `SetRequestId` assigns an `X-Request-Id` to every operator request
/// 2. `Trace` opens a span per request
/// 3. `Timeout` bounds a verb, broadcasts included
/// 4. `PropagateRequestId` echoes the id on the response
#[must_use]
pub fn build_control_layers(config: &ControlConfig) -> ControlLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn builds_with_defaults() {
        let _layers = build_control_layers(&ControlConfig::default());
    }

    #[test]
    fn builds_with_short_timeout() {
        let config = ControlConfig {
            request_timeout: Duration::from_millis(250),
            ..ControlConfig::default()
        };
        let _layers = build_control_layers(&config);
    }
}
