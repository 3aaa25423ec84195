#![allow(missing_docs)]

mod common;

use axum::body::Body;
use http::StatusCode;
use mulegate::config_store::{breaker_key, route_key, ConfigStore, ROUTES_PREFIX};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::test_helpers::{gateway, identity, json_body, spawn_backend, GatewayOptions};

async fn options() -> GatewayOptions {
    let (url, _) = spawn_backend().await;
    GatewayOptions {
        services: vec![("basic", url.clone()), ("order", url)],
        ..GatewayOptions::default()
    }
}

#[tokio::test]
async fn routes_follow_the_store() {
    let gw = gateway(options().await);
    assert_eq!(gw.get("/order/list", None).await.status(), StatusCode::NOT_FOUND);

    gw.store.insert(route_key("/order"), r#"{"service_name":"order"}"#);
    gw.reloader.reload().await.unwrap();
    assert_eq!(gw.get("/order/list", None).await.status(), StatusCode::OK);

    gw.store.delete(&route_key("/order")).await.unwrap();
    gw.reloader.reload().await.unwrap();
    assert_eq!(gw.get("/order/list", None).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn store_outage_serves_last_known_good_config() {
    let gw = gateway(options().await);
    gw.store.insert(route_key("/order"), r#"{"service_name":"order"}"#);
    gw.reloader.reload().await.unwrap();

    gw.store.set_unavailable(true);
    assert!(gw.reloader.reload().await.is_err());
    assert_eq!(gw.get("/order/list", None).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn unparsable_entries_do_not_block_the_rest() {
    let gw = gateway(options().await);
    gw.store.insert(route_key("/order"), r#"{"service_name":"order"}"#);
    gw.store.insert(route_key("/broken"), "not json");
    let report = gw.reloader.reload().await.unwrap();
    assert_eq!(report.routes, 1);
    assert_eq!(gw.get("/order/list", None).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn breaker_parameters_are_applied_in_place() {
    let gw = gateway(options().await);
    gw.store.insert(route_key("/order"), r#"{"service_name":"order"}"#);
    gw.store.insert(
        breaker_key("order"),
        r#"{"timeout":1000,"max_concurrent_requests":5,"request_volume_threshold":2,"sleep_window":60000,"error_percent_threshold":50}"#,
    );
    gw.reloader.reload().await.unwrap();

    for _ in 0..2 {
        assert_eq!(gw.get("/order/fail", None).await.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(gw.get("/order/list", None).await.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Changing parameters keeps the live state.
    gw.store.insert(
        breaker_key("order"),
        r#"{"timeout":2000,"max_concurrent_requests":5,"request_volume_threshold":2,"sleep_window":60000,"error_percent_threshold":50}"#,
    );
    gw.reloader.reload().await.unwrap();
    assert_eq!(gw.breakers.configured()["order"].timeout, 2000);
    assert_eq!(gw.get("/order/list", None).await.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn policies_from_the_store_take_effect_on_reload() {
    let gw = gateway(options().await);
    gw.store.insert(
        route_key("/basic"),
        r#"{"service_name":"basic","gateway_prefix":"/admin","require_auth":true}"#,
    );
    gw.reloader.reload().await.unwrap();
    let alice = identity("7", "t1", &["user"]);
    assert_eq!(gw.get("/admin/basic/sizes", Some(&alice)).await.status(), StatusCode::FORBIDDEN);

    gw.store.insert("gateway/policies/basic", "p, tenant:t1:user:7, /basic/*, read");
    gw.reloader.reload().await.unwrap();
    assert_eq!(gw.get("/admin/basic/sizes", Some(&alice)).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_writes_are_persisted_and_live() {
    let gw = gateway(options().await);
    let root = identity("1", "", &["super"]);
    let req = http::Request::post("/gateway/admin/routes")
        .header("authorization", gw.bearer(&root))
        .header("content-type", "application/json")
        .body(Body::from(json!({"prefix": "/order", "service_name": "order"}).to_string()))
        .unwrap();
    let resp = gw.send(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["data"]["service_name"], "order");

    assert_eq!(gw.get("/order/list", None).await.status(), StatusCode::OK);
    assert_eq!(gw.store.list(ROUTES_PREFIX).await.unwrap().len(), 1);

    // A reload reads the same state back.
    gw.reloader.reload().await.unwrap();
    assert_eq!(gw.routes.snapshot().len(), 1);

    let tenant_user = identity("2", "t1", &["super"]);
    let req = http::Request::get("/gateway/admin/routes")
        .header("authorization", gw.bearer(&tenant_user))
        .body(Body::empty())
        .unwrap();
    assert_eq!(gw.send(req).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn background_watcher_picks_up_changes_and_stops() {
    let gw = gateway(options().await);
    let cancel = CancellationToken::new();
    let handle = Arc::clone(&gw.reloader).spawn(Duration::from_millis(20), cancel.clone());

    gw.store.insert(route_key("/order"), r#"{"service_name":"order"}"#);
    let mut seen = false;
    for _ in 0..100 {
        if gw.routes.snapshot().resolve("/order/list").is_some() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "watcher never installed the new route");

    cancel.cancel();
    handle.await.unwrap();
}
