//! Scenario tests for applications: lifecycle, connections, bindings and
//! inbound/outbound dispatch, up to a full inbound → integration → outbound
//! round trip through the application directory.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};

use engine::{IntegrationDocument, IntegrationRegistry, MemorySnapshotStore, Services, SnapshotStore};
use workflow::{BoxError, Context, ExecStatus, FlowError};

use crate::application::{Application, ApplicationHooks, EndpointApplication};
use crate::connection::ConnectionStatus;
use crate::directory::ApplicationDirectory;
use crate::endpoint::{outbound_fn, EndpointTable, ExecuteIntegrations, InboundEndpoint};
use crate::http::{HttpMethod, HttpRegistrar, HttpRequest, HttpRoutes};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn ctx() -> Context {
    Context::with_id("test")
}

/// The endpoints of the sample shop application.
fn shop_endpoints() -> EndpointTable {
    EndpointTable::new()
        .inbound(
            "notifyOrder",
            InboundEndpoint::new("/order", ExecuteIntegrations)
                .connection_key_param("user")
                .integration_key_param("itid"),
        )
        .outbound(
            "queryOrders",
            outbound_fn(|call| {
                Ok(Some(json!({
                    "status": "OK",
                    "endpointConfig": call.config,
                    "connectionConfig": call.connection_config,
                })))
            }),
        )
        .outbound("broken", outbound_fn(|_| Err("remote refused".into())))
}

fn shop() -> EndpointApplication {
    EndpointApplication::new("sample", shop_endpoints())
}

async fn running(app: EndpointApplication) -> EndpointApplication {
    app.init(json!({}), &ctx()).await.expect("init");
    app.start(&ctx()).await.expect("start");
    app
}

fn document(id: &str, workflow: Value) -> IntegrationDocument {
    serde_json::from_value(json!({ "id": id, "workflow": workflow })).expect("valid document")
}

/// A registry holding running integrations that only emit `{"ran": id}`.
fn integrations(ids: &[&str]) -> IntegrationRegistry {
    let registry = IntegrationRegistry::new();
    for id in ids {
        let doc = document(id, json!([ { "id": "01", "type": "direct", "msg": { "ran": id } } ]));
        let it = registry
            .install(&doc, Services::new(), &ctx())
            .expect("installed");
        it.start(&ctx()).expect("started");
    }
    registry
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

#[async_trait]
impl ApplicationHooks for Recorder {
    async fn on_start(&self, _ctx: &Context) -> Result<(), BoxError> {
        self.push("start".into());
        Ok(())
    }

    async fn on_connect(&self, connection_id: &str, config: &Value, _ctx: &Context) -> Result<(), BoxError> {
        if config.get("refuse").is_some() {
            return Err(format!("{connection_id} refused").into());
        }
        self.push(format!("connect {connection_id}"));
        Ok(())
    }

    async fn on_disconnect(&self, connection_id: &str, _config: &Value, _ctx: &Context) -> Result<(), BoxError> {
        self.push(format!("disconnect {connection_id}"));
        Ok(())
    }
}

// ============================================================
// Lifecycle and connections
// ============================================================

#[tokio::test]
async fn lifecycle_moves_between_stopped_and_running() {
    let app = shop();
    assert_eq!(app.status(), ExecStatus::None);

    app.init(json!({ "region": "eu" }), &ctx()).await.expect("init");
    assert_eq!(app.status(), ExecStatus::Stopped);
    assert_eq!(app.config(), json!({ "region": "eu" }));

    app.start(&ctx()).await.expect("start");
    assert_eq!(app.status(), ExecStatus::Running);

    app.stop(&ctx()).await.expect("stop");
    assert_eq!(app.status(), ExecStatus::Stopped);

    app.start(&ctx()).await.expect("restart");
    app.destroy(&ctx()).await.expect("destroy");
    assert_eq!(app.status(), ExecStatus::Stopped);
}

#[tokio::test]
async fn connections_follow_the_application_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let app = shop().with_hooks(recorder.clone());
    app.init(json!({}), &ctx()).await.expect("init");

    app.create_connection("Conn1", json!({ "id": 1 }), &ctx()).expect("created");
    app.create_connection("Conn2", json!({ "id": 2 }), &ctx()).expect("created");
    assert_eq!(app.connection_status("Conn1"), ConnectionStatus::Unconnected);
    assert_eq!(app.connection_status("Conn3"), ConnectionStatus::None);

    app.start(&ctx()).await.expect("start");
    assert_eq!(app.connection_status("Conn1"), ConnectionStatus::Connected);
    assert_eq!(app.connection_ids(true), vec!["Conn1", "Conn2"]);

    let err = app.remove_connection("Conn1", &ctx()).expect_err("still connected");
    assert_eq!(err.code(), "CONN_RUN");

    app.disconnect("Conn1", &ctx()).await.expect("disconnect");
    app.remove_connection("Conn1", &ctx()).expect("removed");
    assert_eq!(app.connection_status("Conn1"), ConnectionStatus::None);

    app.stop(&ctx()).await.expect("stop");
    assert_eq!(app.connection_status("Conn2"), ConnectionStatus::Unconnected);

    app.start(&ctx()).await.expect("start again");
    assert_eq!(app.connection_status("Conn2"), ConnectionStatus::Connected);

    assert_eq!(
        recorder.events(),
        vec![
            "start",
            "connect Conn1",
            "connect Conn2",
            "disconnect Conn1",
            "disconnect Conn2",
            "start",
            "connect Conn2",
        ]
    );
}

#[tokio::test]
async fn connection_operations_check_their_preconditions() {
    let app = shop().with_hooks(Arc::new(Recorder::default()));
    app.init(json!({}), &ctx()).await.expect("init");
    app.create_connection("Conn1", json!({}), &ctx()).expect("created");

    let err = app.connect("Conn1", &ctx()).await.expect_err("application stopped");
    assert_eq!(err.code(), "APP_STOP");

    app.start(&ctx()).await.expect("start");
    let err = app.connect("Nope", &ctx()).await.expect_err("unknown connection");
    assert_eq!(err.code(), "CONN_NONE");
    assert_eq!(err.context_id(), Some("test"));

    app.create_connection("Bad", json!({ "refuse": true }), &ctx()).expect("created");
    let err = app.connect("Bad", &ctx()).await.expect_err("hook refused");
    assert_eq!(err.code(), "EP_FAIL");
    assert_eq!(app.connection_status("Bad"), ConnectionStatus::Unconnected);
}

#[tokio::test]
async fn bound_integrations_are_reference_counted() {
    let app = shop();
    app.init(json!({}), &ctx()).await.expect("init");

    app.add_endpoint_for_integration("queryOrders", "ItA", Some("Conn1"), json!({})).expect("bound");
    app.add_endpoint_for_integration("notifyOrder", "ItA", Some("Conn1"), json!({})).expect("bound");
    app.add_endpoint_for_integration("notifyOrder", "ItB", Some("Conn2"), json!({})).expect("bound");
    assert_eq!(app.relative_integrations(), vec!["ItA", "ItB"]);
    assert!(app.has_endpoint_for_integration("notifyOrder", "ItB"));

    app.remove_endpoint_for_integration("notifyOrder", "ItB").expect("unbound");
    assert_eq!(app.relative_integrations(), vec!["ItA"]);

    app.remove_endpoint_for_integration("notifyOrder", "ItA").expect("unbound");
    assert_eq!(app.relative_integrations(), vec!["ItA"]);

    app.remove_endpoint_for_integration("queryOrders", "ItA").expect("unbound");
    assert!(app.relative_integrations().is_empty());
}

// ============================================================
// Outbound
// ============================================================

#[tokio::test]
async fn outbound_call_reaches_the_handler() {
    let app = running(shop()).await;
    app.add_endpoint_for_integration("queryOrders", "ItA", Some("Conn1"), json!({ "epConfig": 0 }))
        .expect("bound");
    app.create_connection("Conn1", json!({ "connConfig": 0 }), &ctx()).expect("created");
    app.connect("Conn1", &ctx()).await.expect("connected");

    let reply = app
        .call_outbound_endpoint("queryOrders", "ItA", json!({}), &ctx())
        .await
        .expect("called");

    assert_eq!(
        reply,
        Some(json!({
            "status": "OK",
            "endpointConfig": { "epConfig": 0 },
            "connectionConfig": { "connConfig": 0 },
        }))
    );
}

#[tokio::test]
async fn outbound_call_failures_are_typed() {
    let app = running(shop()).await;
    app.add_endpoint_for_integration("queryOrders", "ItA", Some("Conn1"), json!({})).expect("bound");
    app.add_endpoint_for_integration("broken", "ItA", None, json!({})).expect("bound");
    app.create_connection("Conn1", json!({}), &ctx()).expect("created");

    let err = app
        .call_outbound_endpoint("queryOrders", "ItA", json!({}), &ctx())
        .await
        .expect_err("connection not connected");
    assert_eq!(err.code(), "CONN_NONE_STOP");

    let err = app
        .call_outbound_endpoint("broken", "ItA", json!({}), &ctx())
        .await
        .expect_err("handler failed");
    assert_eq!(err.code(), "EP_FAIL");
    assert!(err.to_string().contains("remote refused"));

    let err = app
        .call_outbound_endpoint("notifyOrder", "ItA", json!({}), &ctx())
        .await
        .expect_err("inbound endpoints can not be called");
    assert_eq!(err.code(), "EP_NONE");

    app.stop(&ctx()).await.expect("stop");
    let err = app
        .call_outbound_endpoint("broken", "ItA", json!({}), &ctx())
        .await
        .expect_err("stopped");
    assert_eq!(err.code(), "APP_STOP");
}

// ============================================================
// Inbound
// ============================================================

fn order_request() -> HttpRequest {
    HttpRequest::new(HttpMethod::Post, "/sample/order").with_body(json!({ "order": 42 }))
}

#[tokio::test]
async fn inbound_by_connection_key_runs_every_integration_on_the_connection() {
    let routes = Arc::new(HttpRoutes::new());
    let app = EndpointApplication::new(
        "sample",
        shop_endpoints().connection_key_in_config("user"),
    )
    .with_integrations(integrations(&["ItA", "ItB", "ItC"]))
    .with_http(routes.clone());
    let app = running(app).await;
    assert_eq!(routes.resolve("/sample/order").as_deref(), Some("sample"));

    app.create_connection("Conn1", json!({ "user": "luyao" }), &ctx()).expect("created");
    app.connect("Conn1", &ctx()).await.expect("connected");
    app.add_endpoint_for_integration("notifyOrder", "ItA", Some("Conn1"), json!({})).expect("bound");
    app.add_endpoint_for_integration("notifyOrder", "ItB", Some("Conn1"), json!({})).expect("bound");
    app.add_endpoint_for_integration("notifyOrder", "ItC", Some("Conn2"), json!({})).expect("bound");

    let response = app
        .handle(order_request().with_param("user", "luyao"), &ctx())
        .await
        .expect("handled");

    assert_eq!(response.status, 200);
    let body = response.body.unwrap_or_default();
    let ran: Vec<&str> = body["transactions"]
        .as_array()
        .map(|list| list.iter().filter_map(|t| t["integrationId"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(ran, vec!["ItA", "ItB"]);
}

#[tokio::test]
async fn inbound_by_integration_key_uses_the_bound_connection() {
    let app = running(shop().with_integrations(integrations(&["ItA", "ItB"]))).await;
    app.create_connection("Conn1", json!({}), &ctx()).expect("created");
    app.connect("Conn1", &ctx()).await.expect("connected");
    app.add_endpoint_for_integration("notifyOrder", "ItA", Some("Conn1"), json!({})).expect("bound");
    app.add_endpoint_for_integration("notifyOrder", "ItB", Some("Conn1"), json!({})).expect("bound");

    let response = app
        .handle(order_request().with_param("itid", "ItB"), &ctx())
        .await
        .expect("handled");

    assert_eq!(response.status, 200);
    let body = response.body.unwrap_or_default();
    assert_eq!(body["transactions"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["transactions"][0]["integrationId"], json!("ItB"));

    app.disconnect("Conn1", &ctx()).await.expect("disconnected");
    let err = app
        .handle(order_request().with_param("itid", "ItB"), &ctx())
        .await
        .expect_err("connection down");
    assert_eq!(err.code(), "CONN_NONE_STOP");
}

#[tokio::test]
async fn inbound_without_bindings_still_reaches_the_handler() {
    let app = running(shop().with_integrations(integrations(&[]))).await;

    let response = app.handle(order_request(), &ctx()).await.expect("handled");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, Some(json!({ "status": "OK", "transactions": [] })));

    let err = app
        .handle(HttpRequest::new(HttpMethod::Post, "/sample/nothing"), &ctx())
        .await
        .expect_err("unknown path");
    assert_eq!(err.code(), "EP_NONE");
}

#[tokio::test]
async fn inbound_reports_integrations_that_are_not_running() {
    let registry = integrations(&["ItA"]);
    registry.get("ItA").expect("installed").stop(&ctx()).expect("stopped");

    let app = running(shop().with_integrations(registry)).await;
    app.create_connection("Conn1", json!({}), &ctx()).expect("created");
    app.connect("Conn1", &ctx()).await.expect("connected");
    app.add_endpoint_for_integration("notifyOrder", "ItA", Some("Conn1"), json!({})).expect("bound");

    let response = app
        .handle(order_request().with_param("user", "Conn1"), &ctx())
        .await
        .expect("handled");

    assert_eq!(response.status, 500);
    let body = response.body.unwrap_or_default();
    assert_eq!(body["transactions"][0]["error"], json!("IT_STOP"));
}

struct RefuseStart;

#[async_trait]
impl ApplicationHooks for RefuseStart {
    async fn on_start(&self, _ctx: &Context) -> Result<(), BoxError> {
        Err("license expired".into())
    }
}

/// Mounts into `routes`, except at `refused`.
struct PickyRoutes {
    routes: HttpRoutes,
    refused: &'static str,
}

impl HttpRegistrar for PickyRoutes {
    fn register_http_path(&self, path: &str, application_id: &str, ctx: &Context) -> Result<(), FlowError> {
        if path == self.refused {
            return Err(FlowError::Storage(format!("{path} already taken")));
        }
        self.routes.register_http_path(path, application_id, ctx)
    }

    fn unregister_http_path(&self, path: &str, ctx: &Context) -> Result<(), FlowError> {
        self.routes.unregister_http_path(path, ctx)
    }
}

#[tokio::test]
async fn failed_start_mounts_nothing() {
    let routes = Arc::new(HttpRoutes::new());
    let app = shop().with_hooks(Arc::new(RefuseStart)).with_http(routes.clone());
    app.init(json!({}), &ctx()).await.expect("init");

    let err = app.start(&ctx()).await.expect_err("hook refused");
    assert_eq!(err.code(), "EP_FAIL");
    assert_eq!(app.status(), ExecStatus::Stopped);
    assert!(routes.routes().is_empty());
    assert!(app.mounted_paths().is_empty());
}

#[tokio::test]
async fn failed_mount_unmounts_the_paths_already_mounted() {
    let routes = HttpRoutes::new();
    let picky = Arc::new(PickyRoutes {
        routes: routes.clone(),
        refused: "/sample/refund",
    });
    let endpoints = shop_endpoints().inbound("notifyRefund", InboundEndpoint::new("/refund", ExecuteIntegrations));
    let app = EndpointApplication::new("sample", endpoints).with_http(picky);
    app.init(json!({}), &ctx()).await.expect("init");

    app.start(&ctx()).await.expect_err("path refused");
    assert_eq!(app.status(), ExecStatus::Stopped);
    assert!(routes.routes().is_empty());
    assert!(app.mounted_paths().is_empty());
}

// ============================================================
// Stop guards and directory round trip
// ============================================================

#[tokio::test]
async fn stop_is_refused_while_a_bound_integration_runs() {
    let routes = Arc::new(HttpRoutes::new());
    let registry = integrations(&["ItA"]);
    let app = running(shop().with_integrations(registry.clone()).with_http(routes.clone())).await;
    app.add_endpoint_for_integration("notifyOrder", "ItA", None, json!({})).expect("bound");

    let err = app.stop(&ctx()).await.expect_err("ItA is running");
    assert_eq!(err.code(), "APP_REL_IT");
    assert_eq!(app.status(), ExecStatus::Running);

    registry.get("ItA").expect("installed").stop(&ctx()).expect("stopped");
    app.stop(&ctx()).await.expect("stop");
    assert_eq!(routes.resolve("/sample/order"), None);
    assert!(app.mounted_paths().is_empty());

    let err = app.handle(order_request(), &ctx()).await.expect_err("stopped");
    assert_eq!(err.code(), "APP_STOP");
}

#[tokio::test]
async fn inbound_request_flows_through_an_integration_to_an_outbound_endpoint() {
    let routes = Arc::new(HttpRoutes::new());
    let registry = IntegrationRegistry::new();
    let directory = ApplicationDirectory::new();
    let store = Arc::new(MemorySnapshotStore::new());

    let shop = EndpointApplication::new(
        "shop",
        EndpointTable::new().inbound(
            "notifyOrder",
            InboundEndpoint::new("/order", ExecuteIntegrations).connection_key_param("user"),
        ),
    )
    .with_integrations(registry.clone())
    .with_http(routes.clone());
    let erp = EndpointApplication::new(
        "erp",
        EndpointTable::new().outbound(
            "queryStock",
            outbound_fn(|call| Ok(Some(json!({ "stock": 7, "asked": call.message, "via": call.connection_id })))),
        ),
    )
    .with_integrations(registry.clone());

    for (app, connection) in [(shop, "Conn1"), (erp, "Conn2")] {
        app.init(json!({}), &ctx()).await.expect("init");
        app.create_connection(connection, json!({}), &ctx()).expect("created");
        app.start(&ctx()).await.expect("start");
        directory.register(Arc::new(app));
    }

    let doc = document(
        "orders",
        json!([
            { "id": "in", "type": "endpoint", "direction": "in", "app": "shop",
              "endpoint": "notifyOrder", "connection": "Conn1" },
            { "id": "out", "from": "in", "type": "endpoint", "direction": "out", "app": "erp",
              "endpoint": "queryStock", "connection": "Conn2" },
        ]),
    );
    let services = Services::new()
        .with_endpoints(Arc::new(directory.clone()))
        .with_snapshots(store.clone());
    let integration = registry.install(&doc, services, &ctx()).expect("installed");
    integration.start(&ctx()).expect("started");

    let shop = directory.get("shop").expect("registered");
    assert_eq!(shop.relative_integrations(), vec!["orders"]);

    let request = HttpRequest::new(HttpMethod::Post, "/shop/order")
        .with_param("user", "Conn1")
        .with_body(json!({ "sku": "A-1" }));
    let response = directory.dispatch(&routes, request, &ctx()).await.expect("dispatched");
    assert_eq!(response.status, 200);

    let snapshots = store.list("orders").await.expect("listed");
    assert_eq!(snapshots.len(), 1);
    assert!(!snapshots[0].failed);
    assert_eq!(
        snapshots[0].message,
        Some(json!({ "stock": 7, "asked": { "sku": "A-1" }, "via": "Conn2" }))
    );

    let err = shop.stop(&ctx()).await.expect_err("integration still running");
    assert_eq!(err.code(), "APP_REL_IT");

    registry.remove("orders", &ctx()).expect("removed");
    assert!(shop.relative_integrations().is_empty());
    shop.stop(&ctx()).await.expect("stop");
}

#[tokio::test]
async fn failed_install_leaves_no_binding_and_keeps_the_previous_integration() {
    let registry = IntegrationRegistry::new();
    let directory = ApplicationDirectory::new();
    let app = shop().with_integrations(registry.clone());
    app.init(json!({}), &ctx()).await.expect("init");
    app.create_connection("Conn1", json!({}), &ctx()).expect("created");
    app.start(&ctx()).await.expect("start");
    directory.register(Arc::new(app));
    let services = Services::new().with_endpoints(Arc::new(directory.clone()));
    let shop = directory.get("sample").expect("registered");

    let query = json!({ "id": "01", "type": "endpoint", "direction": "out", "app": "sample",
                        "endpoint": "queryOrders", "connection": "Conn1" });
    let typo = json!({ "id": "02", "from": "01", "type": "endpoint", "direction": "out", "app": "sample",
                       "endpoint": "queryOrder", "connection": "Conn1" });

    let err = registry
        .install(&document("fresh", json!([query.clone(), typo.clone()])), services.clone(), &ctx())
        .expect_err("unknown endpoint");
    assert_eq!(err.code(), "EP_NONE");
    assert!(!shop.has_endpoint_for_integration("queryOrders", "fresh"));
    assert!(shop.relative_integrations().is_empty());
    assert!(registry.find("fresh").is_none());

    let it = registry
        .install(&document("orders", json!([query.clone()])), services.clone(), &ctx())
        .expect("installed");
    it.start(&ctx()).expect("started");

    let err = registry
        .install(&document("orders", json!([query, typo])), services, &ctx())
        .expect_err("unknown endpoint");
    assert_eq!(err.code(), "EP_NONE");

    let current = registry.get("orders").expect("still registered");
    assert_eq!(current.status(), ExecStatus::Running);
    assert_eq!(current.graph().len(), 1);
    assert!(shop.has_endpoint_for_integration("queryOrders", "orders"));
    assert_eq!(shop.relative_integrations(), vec!["orders"]);

    let trx = current.execute(Some(json!({ "q": 1 })), ctx()).await.expect("executed");
    assert!(!trx.is_failed());
    let reply = trx.snapshot().message.expect("reply");
    assert_eq!(reply["status"], json!("OK"));
}
