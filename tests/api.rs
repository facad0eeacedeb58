//! End-to-end API tests against the in-memory bus.

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use dbus_controller::api::{create_router, ApiState};
use dbus_controller::cache::IntrospectionCache;
use dbus_controller::config::ServerConfig;
use dbus_controller::dbus::{
    BoundedConnector, BusConnector, MemoryBus, MemoryMethod, MemoryService, MethodFault, TypeSpec,
};
use dbus_controller::model::PropertyAccess;
use dbus_controller::signals::SignalHub;
use dbus_controller::Dispatcher;

const SERVICE: &str = "org.example.Player";
const IFACE: &str = "org.example.Player";

const ROOT_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.example.Player">
    <method name="Play">
      <arg name="uri" type="s" direction="in"/>
      <arg name="position" type="t" direction="in"/>
      <arg name="accepted" type="b" direction="out"/>
    </method>
    <method name="Crash"/>
    <property name="Volume" type="d" access="readwrite"/>
    <property name="Identity" type="s" access="read"/>
    <signal name="Seeked">
      <arg name="position" type="x"/>
    </signal>
  </interface>
  <node name="tracks"/>
</node>"#;

const TRACKS_XML: &str = r#"<node>
  <interface name="org.example.TrackList">
    <method name="Count"><arg type="u" direction="out"/></method>
  </interface>
</node>"#;

fn player() -> MemoryService {
    let play = MemoryMethod::new("st", |args| {
        Ok(vec![json!(args[0].as_str().map_or(false, |uri| uri.starts_with("file://")))])
    })
    .unwrap();
    let crash = MemoryMethod::new("", |_| {
        Err(MethodFault::new("org.example.Error.Crashed", "segfault in /usr/lib/player.so"))
    })
    .unwrap();
    let count = MemoryMethod::new("", |_| Ok(vec![json!(12)])).unwrap();

    MemoryService::new()
        .object("/", ROOT_XML)
        .object("/tracks", TRACKS_XML)
        .method("/", IFACE, "Play", play)
        .method("/", IFACE, "Crash", crash)
        .method("/tracks", "org.example.TrackList", "Count", count)
        .property("/", IFACE, "Volume", TypeSpec::Double, PropertyAccess::ReadWrite, json!(0.5))
        .property("/", IFACE, "Identity", TypeSpec::String, PropertyAccess::Read, json!("Example Player"))
}

struct Harness {
    bus: Arc<MemoryBus>,
    router: Router,
}

fn harness() -> Harness {
    let bus = Arc::new(MemoryBus::default());
    bus.add_service("session", SERVICE, player());
    bus.add_service("system", SERVICE, player());

    let cache = Arc::new(IntrospectionCache::new(bus.clone(), Duration::from_secs(30)));
    let signals = SignalHub::new(bus.clone(), 8);
    let dispatcher = Arc::new(Dispatcher::new(bus.clone(), cache, signals));
    let router = create_router(ApiState::new(dispatcher), &ServerConfig::default());
    Harness { bus, router }
}

/// Harness whose connector enforces one call per bus and a 2s timeout.
fn bounded_harness() -> Harness {
    let bus = Arc::new(MemoryBus::default());
    bus.add_service("session", SERVICE, player());
    bus.add_service("system", SERVICE, player());

    let connector: Arc<dyn BusConnector> =
        Arc::new(BoundedConnector::with_limits(bus.clone(), 1, Duration::from_secs(2)));
    let cache = Arc::new(IntrospectionCache::new(connector.clone(), Duration::from_secs(30)));
    let signals = SignalHub::new(connector.clone(), 8);
    let dispatcher = Arc::new(Dispatcher::new(connector, cache, signals));
    let router = create_router(ApiState::new(dispatcher), &ServerConfig::default());
    Harness { bus, router }
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    send(router, Method::GET, uri, None).await
}

fn iface_uri(bus: &str, rest: &str) -> String {
    format!("/buses/{}/services/{}/interfaces/{}{}", bus, SERVICE, IFACE, rest)
}

#[tokio::test]
async fn health_reports_version() {
    let h = harness();
    let (status, body) = get(&h.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn listing_buses_is_idempotent() {
    let h = harness();
    let (status, first) = get(&h.router, "/buses").await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = get(&h.router, "/buses").await;
    assert_eq!(first, second);
    assert_eq!(first[0]["type"], "system");
    assert_eq!(first[1]["type"], "session");
    assert_eq!(h.bus.introspect_calls(), 0);

    let (status, bus) = get(&h.router, "/buses/session").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bus["kind"], "session");
}

#[tokio::test]
async fn unknown_bus_is_404() {
    let h = harness();
    let (status, body) = get(&h.router, "/buses/nope/services").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn services_and_service_info() {
    let h = harness();
    let (status, services) = get(&h.router, "/buses/session/services").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(services, json!([SERVICE]));

    let (status, info) = get(&h.router, &format!("/buses/session/services/{}", SERVICE)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["name"], SERVICE);
    assert_eq!(info["interfaces"], json!([IFACE]));
    assert_eq!(info["nodes"], json!(["/tracks"]));
    assert!(info["owner"].as_str().unwrap().starts_with(":1."));

    let (status, _) = get(&h.router, "/buses/session/services/org.example.Missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&h.router, "/buses/session/services/not-a-bus-name").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn object_path_query_selects_child() {
    let h = harness();
    let (status, interfaces) = get(
        &h.router,
        &format!("/buses/session/services/{}/interfaces?path=/tracks", SERVICE),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(interfaces, json!(["org.example.TrackList"]));

    let (status, result) = send(
        &h.router,
        Method::POST,
        &format!(
            "/buses/session/services/{}/interfaces/org.example.TrackList/methods/Count/call?path=/tracks",
            SERVICE
        ),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["return_values"], json!([12]));

    let (status, _) = get(
        &h.router,
        &format!("/buses/session/services/{}/interfaces?path=tracks", SERVICE),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn introspect_returns_xml_and_parsed_data() {
    let h = harness();
    let (status, result) = get(&h.router, &format!("/buses/session/services/{}/introspect", SERVICE)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["service"], SERVICE);
    assert_eq!(result["object_path"], "/");
    assert!(result["xml"].as_str().unwrap().contains("<node>"));
    assert_eq!(result["parsed_data"]["interfaces"][0]["name"], IFACE);
    assert!(result["timestamp"].is_string());
}

#[tokio::test]
async fn unparsable_introspection_omits_parsed_data() {
    let h = harness();
    h.bus.add_service(
        "session",
        "org.example.Broken",
        MemoryService::new().object("/", "<node><interface name="),
    );

    let (status, result) = get(&h.router, "/buses/session/services/org.example.Broken/introspect").await;
    assert_eq!(status, StatusCode::OK);
    assert!(result.get("parsed_data").is_none());
    assert_eq!(result["xml"], "<node><interface name=");

    let (status, body) = get(&h.router, "/buses/session/services/org.example.Broken/interfaces").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn interface_info_name_matches_path() {
    let h = harness();
    let (status, iface) = get(&h.router, &iface_uri("session", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(iface["name"], IFACE);
    assert_eq!(iface["methods"][0]["name"], "Play");
    assert_eq!(iface["methods"][0]["in_args"][1]["type"], "t");

    let (status, _) = get(
        &h.router,
        &format!("/buses/session/services/{}/interfaces/org.example.Nope", SERVICE),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn member_listings() {
    let h = harness();
    let (_, methods) = get(&h.router, &iface_uri("session", "/methods")).await;
    assert_eq!(methods.as_array().unwrap().len(), 2);

    let (_, signals) = get(&h.router, &iface_uri("session", "/signals")).await;
    assert_eq!(signals[0]["name"], "Seeked");
    assert_eq!(signals[0]["args"][0]["type"], "x");

    let (_, properties) = get(&h.router, &iface_uri("session", "/properties")).await;
    assert_eq!(properties[0]["name"], "Volume");
    assert_eq!(properties[0]["access"], "readwrite");
    assert_eq!(properties[0]["value"], 0.5);
    assert_eq!(properties[1]["value"], "Example Player");
}

#[tokio::test]
async fn call_method_marshals_by_introspected_signature() {
    let h = harness();
    let (status, result) = send(
        &h.router,
        Method::POST,
        &iface_uri("session", "/methods/Play/call"),
        Some(json!({"args": ["file:///music.ogg", 0]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], true);
    assert_eq!(result["return_values"], json!([true]));
    assert!(result.get("error").is_none());

    let (status, _) = send(
        &h.router,
        Method::POST,
        &iface_uri("session", "/methods/Play/call"),
        Some(json!({"args": ["file:///music.ogg", -1]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn call_on_missing_service_is_200_with_error() {
    let h = harness();
    let (status, result) = send(
        &h.router,
        Method::POST,
        "/buses/session/services/org.example.Missing/interfaces/org.example.Player/methods/Play/call",
        Some(json!({"args": ["x", 1]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], false);
    assert!(result["error"].as_str().is_some_and(|e| !e.is_empty()));
    assert!(result.get("return_values").is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_call_is_504() {
    let h = bounded_harness();
    h.bus.set_call_delay("session", Duration::from_secs(30));

    let (status, body) = send(
        &h.router,
        Method::POST,
        &iface_uri("session", "/methods/Play/call"),
        Some(json!({"args": ["file:///a.ogg", 1]})),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body["error"].is_string());

    let (status, _) = get(&h.router, &iface_uri("session", "/properties/Volume")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn stalled_bus_does_not_block_the_other() {
    let h = bounded_harness();
    h.bus.set_call_delay("system", Duration::from_millis(1900));

    let stalled = {
        let router = h.router.clone();
        tokio::spawn(async move {
            send(
                &router,
                Method::POST,
                &iface_uri("system", "/methods/Crash/call"),
                Some(json!({})),
            )
            .await
        })
    };
    tokio::task::yield_now().await;

    let started = tokio::time::Instant::now();
    let (status, result) = send(
        &h.router,
        Method::POST,
        &iface_uri("session", "/methods/Play/call"),
        Some(json!({"args": ["file:///a.ogg", 1]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], true);
    assert!(started.elapsed() < Duration::from_millis(100));

    let (status, _) = stalled.await.unwrap();
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn remote_errors_are_sanitized_on_system_bus() {
    let h = harness();
    let (_, session) = send(
        &h.router,
        Method::POST,
        &iface_uri("session", "/methods/Crash/call"),
        Some(json!({})),
    )
    .await;
    assert!(session["error"].as_str().unwrap().contains("player.so"));

    let (_, system) = send(
        &h.router,
        Method::POST,
        &iface_uri("system", "/methods/Crash/call"),
        Some(json!({})),
    )
    .await;
    assert_eq!(system["success"], false);
    assert_eq!(system["error"], "org.example.Error.Crashed");
    assert_eq!(system["error_name"], "org.example.Error.Crashed");
}

#[tokio::test]
async fn malformed_body_is_400() {
    let h = harness();
    let request = Request::builder()
        .method(Method::POST)
        .uri(iface_uri("session", "/methods/Play/call"))
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn set_then_get_property() {
    let h = harness();
    let (status, written) = send(
        &h.router,
        Method::PUT,
        &iface_uri("session", "/properties/Volume"),
        Some(json!({"value": 0.8})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(written["name"], "Volume");
    assert_eq!(written["type"], "d");
    assert_eq!(written["value"], 0.8);

    let (status, read) = get(&h.router, &iface_uri("session", "/properties/Volume")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read["value"], 0.8);
}

#[tokio::test]
async fn set_read_only_property_is_403_and_unchanged() {
    let h = harness();
    let (status, body) = send(
        &h.router,
        Method::PUT,
        &iface_uri("session", "/properties/Identity"),
        Some(json!({"value": "Hacked"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].is_string());

    let (_, read) = get(&h.router, &iface_uri("session", "/properties/Identity")).await;
    assert_eq!(read["value"], "Example Player");
}

#[tokio::test]
async fn set_property_type_mismatch_is_400() {
    let h = harness();
    let (status, _) = send(
        &h.router,
        Method::PUT,
        &iface_uri("session", "/properties/Volume"),
        Some(json!({"value": "loud"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_property_is_404() {
    let h = harness();
    let (status, _) = get(&h.router, &iface_uri("session", "/properties/Nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unavailable_bus_is_503() {
    let h = harness();
    h.bus.set_available("session", false);
    let (status, _) = get(&h.router, "/buses/session/services").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn signal_subscription_lifecycle() {
    let h = harness();
    let (status, sub) = send(
        &h.router,
        Method::POST,
        &iface_uri("session", "/signals/Seeked/subscribe"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sub["signal"], "Seeked");
    assert_eq!(sub["active"], true);
    let id = sub["id"].as_u64().unwrap();

    h.bus
        .emit_signal("session", SERVICE, "/", IFACE, "Seeked", vec![json!(42)]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (_, list) = get(&h.router, "/subscriptions").await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, events) = get(&h.router, &format!("/subscriptions/{}/events", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events[0]["args"], json!([42]));
    assert_eq!(events[0]["signal"], "Seeked");

    let (_, drained) = get(&h.router, &format!("/subscriptions/{}/events", id)).await;
    assert_eq!(drained, json!([]));

    let (status, _) = send(&h.router, Method::DELETE, &format!("/subscriptions/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&h.router, Method::DELETE, &format!("/subscriptions/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = get(&h.router, "/subscriptions/abc/events").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn malformed_query_and_path_have_error_body() {
    let h = harness();
    let (status, body) = get(
        &h.router,
        &format!("/buses/session/services/{}/interfaces?path=/a&path=/b", SERVICE),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));

    let (status, body) = send(&h.router, Method::DELETE, "/subscriptions/-1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = get(&h.router, "/buses/%FF/services").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn swagger_document_is_served() {
    let h = harness();
    let (status, doc) = get(&h.router, "/api-docs/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["info"]["title"], "D-Bus Controller API");
    assert!(doc["paths"]["/buses"].is_object());
}
