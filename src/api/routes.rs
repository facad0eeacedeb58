//! API router setup with Swagger UI and middleware.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers::{
    self, CallRequest, ErrorResponse, HealthResponse, SetPropertyRequest,
};
use super::state::ApiState;
use crate::config::ServerConfig;
use crate::model::{
    ArgDirection, ArgumentDescriptor, BusInfo, BusKind, InterfaceDescriptor, IntrospectionResult,
    MethodCallResult, MethodDescriptor, ParsedIntrospection, PropertyAccess, PropertyDescriptor,
    PropertyValue, ServiceInfo, SignalDescriptor, SignalEvent, SignalSubscription,
};

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "D-Bus Controller API",
        description = "REST API for browsing and driving D-Bus services",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    paths(
        handlers::health,
        handlers::list_buses,
        handlers::get_bus,
        handlers::list_services,
        handlers::get_service,
        handlers::introspect_service,
        handlers::list_interfaces,
        handlers::get_interface,
        handlers::list_methods,
        handlers::call_method,
        handlers::list_properties,
        handlers::get_property,
        handlers::set_property,
        handlers::list_signals,
        handlers::subscribe_signal,
        handlers::list_subscriptions,
        handlers::drain_events,
        handlers::delete_subscription,
    ),
    components(
        schemas(
            HealthResponse,
            ErrorResponse,
            CallRequest,
            SetPropertyRequest,
            BusInfo,
            BusKind,
            ServiceInfo,
            ArgDirection,
            ArgumentDescriptor,
            MethodDescriptor,
            PropertyAccess,
            PropertyDescriptor,
            SignalDescriptor,
            InterfaceDescriptor,
            ParsedIntrospection,
            IntrospectionResult,
            MethodCallResult,
            PropertyValue,
            SignalSubscription,
            SignalEvent,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Buses", description = "Configured message buses"),
        (name = "Services", description = "Names registered on a bus"),
        (name = "Interfaces", description = "Introspected interfaces"),
        (name = "Methods", description = "Method listing and invocation"),
        (name = "Properties", description = "Property access"),
        (name = "Signals", description = "Signal listing and subscriptions"),
    )
)]
pub struct ApiDoc;

const SERVICE: &str = "/buses/{bus_type}/services/{service}";
const INTERFACE: &str = "/buses/{bus_type}/services/{service}/interfaces/{interface}";

/// Create the API router with all routes and middleware.
pub fn create_router(state: ApiState, config: &ServerConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/buses", get(handlers::list_buses))
        .route("/buses/{bus_type}", get(handlers::get_bus))
        .route("/buses/{bus_type}/services", get(handlers::list_services))
        .route(SERVICE, get(handlers::get_service))
        .route(
            &format!("{}/introspect", SERVICE),
            get(handlers::introspect_service),
        )
        .route(
            &format!("{}/interfaces", SERVICE),
            get(handlers::list_interfaces),
        )
        .route(INTERFACE, get(handlers::get_interface))
        .route(
            &format!("{}/methods", INTERFACE),
            get(handlers::list_methods),
        )
        .route(
            &format!("{}/methods/{{method}}/call", INTERFACE),
            post(handlers::call_method),
        )
        .route(
            &format!("{}/properties", INTERFACE),
            get(handlers::list_properties),
        )
        .route(
            &format!("{}/properties/{{property}}", INTERFACE),
            get(handlers::get_property).put(handlers::set_property),
        )
        .route(
            &format!("{}/signals", INTERFACE),
            get(handlers::list_signals),
        )
        .route(
            &format!("{}/signals/{{signal}}/subscribe", INTERFACE),
            post(handlers::subscribe_signal),
        )
        .route("/subscriptions", get(handlers::list_subscriptions))
        .route("/subscriptions/{id}/events", get(handlers::drain_events))
        .route("/subscriptions/{id}", delete(handlers::delete_subscription))
        .with_state(state);

    // Add Swagger UI if enabled
    if config.swagger_ui {
        router = router
            .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));
    }

    // Add CORS if origins configured
    let cors = if config.cors_origins.is_empty() {
        // No CORS (same-origin only)
        CorsLayer::new()
    } else if config.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    router.layer(cors).layer(TraceLayer::new_for_http())
}
