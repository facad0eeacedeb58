//! API request handlers.

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;
use utoipa::{IntoParams, ToSchema};

use super::state::ApiState;
use crate::dispatch::ObjectAddress;
use crate::error::Error;
use crate::model::{
    BusInfo, InterfaceDescriptor, IntrospectionResult, MethodCallResult, MethodDescriptor,
    PropertyDescriptor, PropertyValue, ServiceInfo, SignalDescriptor, SignalEvent,
    SignalSubscription,
};

/// Health check response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Always "ok" if server is responding
    pub status: String,
    /// Server version
    pub version: String,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

/// Method call request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CallRequest {
    /// Positional arguments
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub args: Vec<JsonValue>,
    /// D-Bus input signature, overriding the introspected one
    #[serde(default)]
    pub signature: Option<String>,
}

/// Property write request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SetPropertyRequest {
    #[schema(value_type = Object)]
    pub value: JsonValue,
    /// D-Bus signature of the value, overriding the introspected type
    #[serde(default)]
    pub signature: Option<String>,
}

/// Object selection for service routes.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ObjectQuery {
    /// Object path (default "/")
    pub path: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, Error>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Error> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| Error::InvalidParameter(e.body_text()))
}

/// [`Path`] that rejects with the JSON error body.
pub struct ApiPath<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Path::<T>::from_request_parts(parts, state)
            .await
            .map(|Path(value)| ApiPath(value))
            .map_err(|e| Error::InvalidParameter(e.body_text()))
    }
}

/// [`Query`] that rejects with the JSON error body.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| ApiQuery(value))
            .map_err(|e| Error::InvalidParameter(e.body_text()))
    }
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    ),
    tag = "Health"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List configured buses.
#[utoipa::path(
    get,
    path = "/buses",
    responses(
        (status = 200, description = "Configured buses", body = Vec<BusInfo>)
    ),
    tag = "Buses"
)]
pub async fn list_buses(State(state): State<ApiState>) -> Json<Vec<BusInfo>> {
    Json(state.dispatcher.list_buses())
}

#[utoipa::path(
    get,
    path = "/buses/{bus_type}",
    params(("bus_type" = String, Path, description = "Bus id")),
    responses(
        (status = 200, description = "Bus details", body = BusInfo),
        (status = 404, description = "Unknown bus", body = ErrorResponse)
    ),
    tag = "Buses"
)]
pub async fn get_bus(
    State(state): State<ApiState>,
    ApiPath(bus): ApiPath<String>,
) -> ApiResult<BusInfo> {
    state.dispatcher.bus_info(&bus).map(Json)
}

/// List names registered on a bus.
#[utoipa::path(
    get,
    path = "/buses/{bus_type}/services",
    params(("bus_type" = String, Path, description = "Bus id")),
    responses(
        (status = 200, description = "Sorted service names", body = Vec<String>),
        (status = 404, description = "Unknown bus", body = ErrorResponse),
        (status = 503, description = "Bus unavailable", body = ErrorResponse)
    ),
    tag = "Services"
)]
pub async fn list_services(
    State(state): State<ApiState>,
    ApiPath(bus): ApiPath<String>,
) -> ApiResult<Vec<String>> {
    state.dispatcher.list_services(&bus).await.map(Json)
}

#[utoipa::path(
    get,
    path = "/buses/{bus_type}/services/{service}",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ObjectQuery
    ),
    responses(
        (status = 200, description = "Service owner, interfaces and child nodes", body = ServiceInfo),
        (status = 400, description = "Invalid name or path", body = ErrorResponse),
        (status = 404, description = "Unknown bus or service", body = ErrorResponse)
    ),
    tag = "Services"
)]
pub async fn get_service(
    State(state): State<ApiState>,
    ApiPath((bus, service)): ApiPath<(String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
) -> ApiResult<ServiceInfo> {
    let address = ObjectAddress::new(bus, service, query.path);
    state.dispatcher.service_info(&address).await.map(Json)
}

/// Raw and parsed introspection data of one object.
#[utoipa::path(
    get,
    path = "/buses/{bus_type}/services/{service}/introspect",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ObjectQuery
    ),
    responses(
        (status = 200, description = "Introspection data", body = IntrospectionResult),
        (status = 404, description = "Unknown bus or service", body = ErrorResponse),
        (status = 504, description = "Introspection timed out", body = ErrorResponse)
    ),
    tag = "Services"
)]
pub async fn introspect_service(
    State(state): State<ApiState>,
    ApiPath((bus, service)): ApiPath<(String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
) -> ApiResult<IntrospectionResult> {
    let address = ObjectAddress::new(bus, service, query.path);
    state.dispatcher.introspect(&address).await.map(Json)
}

#[utoipa::path(
    get,
    path = "/buses/{bus_type}/services/{service}/interfaces",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ObjectQuery
    ),
    responses(
        (status = 200, description = "Interface names", body = Vec<String>),
        (status = 404, description = "Unknown bus or service", body = ErrorResponse),
        (status = 500, description = "Introspection data could not be parsed", body = ErrorResponse)
    ),
    tag = "Interfaces"
)]
pub async fn list_interfaces(
    State(state): State<ApiState>,
    ApiPath((bus, service)): ApiPath<(String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
) -> ApiResult<Vec<String>> {
    let address = ObjectAddress::new(bus, service, query.path);
    state.dispatcher.list_interfaces(&address).await.map(Json)
}

#[utoipa::path(
    get,
    path = "/buses/{bus_type}/services/{service}/interfaces/{interface}",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ("interface" = String, Path, description = "Interface name"),
        ObjectQuery
    ),
    responses(
        (status = 200, description = "Interface members", body = InterfaceDescriptor),
        (status = 404, description = "Unknown bus, service or interface", body = ErrorResponse)
    ),
    tag = "Interfaces"
)]
pub async fn get_interface(
    State(state): State<ApiState>,
    ApiPath((bus, service, interface)): ApiPath<(String, String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
) -> ApiResult<InterfaceDescriptor> {
    let address = ObjectAddress::new(bus, service, query.path);
    state
        .dispatcher
        .interface_info(&address, &interface)
        .await
        .map(Json)
}

#[utoipa::path(
    get,
    path = "/buses/{bus_type}/services/{service}/interfaces/{interface}/methods",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ("interface" = String, Path, description = "Interface name"),
        ObjectQuery
    ),
    responses(
        (status = 200, description = "Methods of the interface", body = Vec<MethodDescriptor>),
        (status = 404, description = "Unknown bus, service or interface", body = ErrorResponse)
    ),
    tag = "Methods"
)]
pub async fn list_methods(
    State(state): State<ApiState>,
    ApiPath((bus, service, interface)): ApiPath<(String, String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
) -> ApiResult<Vec<MethodDescriptor>> {
    let address = ObjectAddress::new(bus, service, query.path);
    state
        .dispatcher
        .list_methods(&address, &interface)
        .await
        .map(Json)
}

/// Invoke a method.
///
/// Failures reported by the service are returned with `success = false`.
#[utoipa::path(
    post,
    path = "/buses/{bus_type}/services/{service}/interfaces/{interface}/methods/{method}/call",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ("interface" = String, Path, description = "Interface name"),
        ("method" = String, Path, description = "Method name"),
        ObjectQuery
    ),
    request_body = CallRequest,
    responses(
        (status = 200, description = "Call outcome", body = MethodCallResult),
        (status = 400, description = "Invalid names or arguments", body = ErrorResponse),
        (status = 503, description = "Bus unavailable", body = ErrorResponse),
        (status = 504, description = "Call timed out", body = ErrorResponse)
    ),
    tag = "Methods"
)]
pub async fn call_method(
    State(state): State<ApiState>,
    ApiPath((bus, service, interface, method)): ApiPath<(String, String, String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
    payload: Result<Json<CallRequest>, JsonRejection>,
) -> ApiResult<MethodCallResult> {
    let request = body(payload)?;
    let address = ObjectAddress::new(bus, service, query.path);
    state
        .dispatcher
        .call_method(
            &address,
            &interface,
            &method,
            request.args,
            request.signature.as_deref(),
        )
        .await
        .map(Json)
}

/// Properties of an interface with their current values.
#[utoipa::path(
    get,
    path = "/buses/{bus_type}/services/{service}/interfaces/{interface}/properties",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ("interface" = String, Path, description = "Interface name"),
        ObjectQuery
    ),
    responses(
        (status = 200, description = "Properties of the interface", body = Vec<PropertyDescriptor>),
        (status = 404, description = "Unknown bus, service or interface", body = ErrorResponse)
    ),
    tag = "Properties"
)]
pub async fn list_properties(
    State(state): State<ApiState>,
    ApiPath((bus, service, interface)): ApiPath<(String, String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
) -> ApiResult<Vec<PropertyDescriptor>> {
    let address = ObjectAddress::new(bus, service, query.path);
    state
        .dispatcher
        .list_properties(&address, &interface)
        .await
        .map(Json)
}

#[utoipa::path(
    get,
    path = "/buses/{bus_type}/services/{service}/interfaces/{interface}/properties/{property}",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ("interface" = String, Path, description = "Interface name"),
        ("property" = String, Path, description = "Property name"),
        ObjectQuery
    ),
    responses(
        (status = 200, description = "Current value", body = PropertyValue),
        (status = 403, description = "Property is not readable", body = ErrorResponse),
        (status = 404, description = "Unknown bus, service or property", body = ErrorResponse)
    ),
    tag = "Properties"
)]
pub async fn get_property(
    State(state): State<ApiState>,
    ApiPath((bus, service, interface, property)): ApiPath<(String, String, String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
) -> ApiResult<PropertyValue> {
    let address = ObjectAddress::new(bus, service, query.path);
    state
        .dispatcher
        .get_property(&address, &interface, &property)
        .await
        .map(Json)
}

/// Write a property and return the value read back.
#[utoipa::path(
    put,
    path = "/buses/{bus_type}/services/{service}/interfaces/{interface}/properties/{property}",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ("interface" = String, Path, description = "Interface name"),
        ("property" = String, Path, description = "Property name"),
        ObjectQuery
    ),
    request_body = SetPropertyRequest,
    responses(
        (status = 200, description = "Value after the write", body = PropertyValue),
        (status = 400, description = "Value does not match the property type", body = ErrorResponse),
        (status = 403, description = "Property is read-only", body = ErrorResponse),
        (status = 404, description = "Unknown bus, service or property", body = ErrorResponse)
    ),
    tag = "Properties"
)]
pub async fn set_property(
    State(state): State<ApiState>,
    ApiPath((bus, service, interface, property)): ApiPath<(String, String, String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
    payload: Result<Json<SetPropertyRequest>, JsonRejection>,
) -> ApiResult<PropertyValue> {
    let request = body(payload)?;
    let address = ObjectAddress::new(bus, service, query.path);
    state
        .dispatcher
        .set_property(
            &address,
            &interface,
            &property,
            request.value,
            request.signature.as_deref(),
        )
        .await
        .map(Json)
}

#[utoipa::path(
    get,
    path = "/buses/{bus_type}/services/{service}/interfaces/{interface}/signals",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ("interface" = String, Path, description = "Interface name"),
        ObjectQuery
    ),
    responses(
        (status = 200, description = "Signals of the interface", body = Vec<SignalDescriptor>),
        (status = 404, description = "Unknown bus, service or interface", body = ErrorResponse)
    ),
    tag = "Signals"
)]
pub async fn list_signals(
    State(state): State<ApiState>,
    ApiPath((bus, service, interface)): ApiPath<(String, String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
) -> ApiResult<Vec<SignalDescriptor>> {
    let address = ObjectAddress::new(bus, service, query.path);
    state
        .dispatcher
        .list_signals(&address, &interface)
        .await
        .map(Json)
}

/// Start buffering a signal.
#[utoipa::path(
    post,
    path = "/buses/{bus_type}/services/{service}/interfaces/{interface}/signals/{signal}/subscribe",
    params(
        ("bus_type" = String, Path, description = "Bus id"),
        ("service" = String, Path, description = "Bus name"),
        ("interface" = String, Path, description = "Interface name"),
        ("signal" = String, Path, description = "Signal name"),
        ObjectQuery
    ),
    responses(
        (status = 201, description = "Subscription created", body = SignalSubscription),
        (status = 400, description = "Invalid names", body = ErrorResponse),
        (status = 404, description = "Unknown bus", body = ErrorResponse)
    ),
    tag = "Signals"
)]
pub async fn subscribe_signal(
    State(state): State<ApiState>,
    ApiPath((bus, service, interface, signal)): ApiPath<(String, String, String, String)>,
    ApiQuery(query): ApiQuery<ObjectQuery>,
) -> Result<(StatusCode, Json<SignalSubscription>), Error> {
    let address = ObjectAddress::new(bus, service, query.path);
    let subscription = state
        .dispatcher
        .subscribe(&address, &interface, &signal)
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

#[utoipa::path(
    get,
    path = "/subscriptions",
    responses(
        (status = 200, description = "Active and closed subscriptions", body = Vec<SignalSubscription>)
    ),
    tag = "Signals"
)]
pub async fn list_subscriptions(State(state): State<ApiState>) -> Json<Vec<SignalSubscription>> {
    Json(state.dispatcher.list_subscriptions().await)
}

/// Take the buffered events of a subscription.
#[utoipa::path(
    get,
    path = "/subscriptions/{id}/events",
    params(("id" = u64, Path, description = "Subscription id")),
    responses(
        (status = 200, description = "Buffered events, oldest first", body = Vec<SignalEvent>),
        (status = 404, description = "Unknown subscription", body = ErrorResponse)
    ),
    tag = "Signals"
)]
pub async fn drain_events(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<u64>,
) -> ApiResult<Vec<SignalEvent>> {
    state.dispatcher.drain_subscription(id).await.map(Json)
}

#[utoipa::path(
    delete,
    path = "/subscriptions/{id}",
    params(("id" = u64, Path, description = "Subscription id")),
    responses(
        (status = 204, description = "Subscription removed"),
        (status = 404, description = "Unknown subscription", body = ErrorResponse)
    ),
    tag = "Signals"
)]
pub async fn delete_subscription(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<u64>,
) -> Result<StatusCode, Error> {
    state.dispatcher.unsubscribe(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
