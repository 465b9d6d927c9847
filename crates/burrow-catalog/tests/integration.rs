//! Integration tests for burrow-catalog
//!
//! Exercises the SQL catalog against a real SQLite in-memory database.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::NotSet, EntityTrait, PaginatorTrait, Set};

use burrow_catalog::entities::{agent, port_forward, prelude::*};
use burrow_catalog::{connect, migrate, Catalog, SqlCatalog};

async fn setup_catalog() -> SqlCatalog {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    migrate(&db).await.expect("Failed to run migrations");
    SqlCatalog::new(db)
}

async fn insert_agent(catalog: &SqlCatalog, name: &str, token: &str, enabled: bool) -> i64 {
    let model = agent::ActiveModel {
        id: NotSet,
        name: Set(name.to_string()),
        token: Set(token.to_string()),
        enabled: Set(enabled),
        created_at: Set(Utc::now()),
    };
    model.insert(catalog.connection()).await.unwrap().id
}

#[allow(clippy::too_many_arguments)]
async fn insert_forward(
    catalog: &SqlCatalog,
    agent_id: i64,
    name: &str,
    direction: port_forward::Direction,
    proxy_type: port_forward::ProxyType,
    remote_port: i32,
    local_port: i32,
    enabled: bool,
) -> i64 {
    let model = port_forward::ActiveModel {
        id: NotSet,
        agent_id: Set(agent_id),
        name: Set(name.to_string()),
        direction: Set(direction),
        proxy_type: Set(proxy_type),
        remote_port: Set(remote_port),
        remote_ip: Set(String::new()),
        local_ip: Set("127.0.0.1".to_string()),
        local_port: Set(local_port),
        enabled: Set(enabled),
    };
    model.insert(catalog.connection()).await.unwrap().id
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_agent_by_token_filters_disabled_agents() {
    let catalog = setup_catalog().await;
    insert_agent(&catalog, "edge-1", "tok-enabled", true).await;
    insert_agent(&catalog, "edge-2", "tok-disabled", false).await;

    let found = catalog.agent_by_token("tok-enabled").await.unwrap();
    assert_eq!(found.unwrap().name, "edge-1");

    assert!(catalog.agent_by_token("tok-disabled").await.unwrap().is_none());
    assert!(catalog.agent_by_token("tok-unknown").await.unwrap().is_none());
}

#[tokio::test]
async fn test_forwards_by_agent_returns_enabled_only() {
    let catalog = setup_catalog().await;
    let agent_id = insert_agent(&catalog, "edge-1", "tok", true).await;
    insert_forward(
        &catalog,
        agent_id,
        "ssh",
        port_forward::Direction::Forward,
        port_forward::ProxyType::Tcp,
        6000,
        22,
        true,
    )
    .await;
    insert_forward(
        &catalog,
        agent_id,
        "old",
        port_forward::Direction::Reverse,
        port_forward::ProxyType::Tcp,
        3000,
        8080,
        false,
    )
    .await;

    let forwards = catalog.forwards_by_agent(agent_id).await.unwrap();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].name, "ssh");
    assert_eq!(forwards[0].direction, burrow_proto::Direction::Forward);
    assert_eq!(forwards[0].remote_port, 6000);
    assert_eq!(forwards[0].local_port, 22);
}

#[tokio::test]
async fn test_remote_port_availability_per_direction() {
    let catalog = setup_catalog().await;
    let agent_id = insert_agent(&catalog, "edge-1", "tok", true).await;

    // A reverse forward on 7001 does not bind the server.
    insert_forward(
        &catalog,
        agent_id,
        "rev",
        port_forward::Direction::Reverse,
        port_forward::ProxyType::Tcp,
        7001,
        8080,
        true,
    )
    .await;
    assert!(catalog.is_remote_port_available(7001, None).await.unwrap());

    let fwd = insert_forward(
        &catalog,
        agent_id,
        "fwd",
        port_forward::Direction::Dynamic,
        port_forward::ProxyType::Socks5,
        7001,
        0,
        true,
    )
    .await;
    assert!(!catalog.is_remote_port_available(7001, None).await.unwrap());
    assert!(catalog
        .is_remote_port_available(7001, Some(fwd))
        .await
        .unwrap());

    // Disabled forwards do not hold the port.
    let mut model: port_forward::ActiveModel = PortForward::find_by_id(fwd)
        .one(catalog.connection())
        .await
        .unwrap()
        .unwrap()
        .into();
    model.enabled = Set(false);
    model.update(catalog.connection()).await.unwrap();
    assert!(catalog.is_remote_port_available(7001, None).await.unwrap());
}

#[tokio::test]
async fn test_append_traffic_accumulates_records() {
    let catalog = setup_catalog().await;
    let agent_id = insert_agent(&catalog, "edge-1", "tok", true).await;
    let forward_id = insert_forward(
        &catalog,
        agent_id,
        "ssh",
        port_forward::Direction::Forward,
        port_forward::ProxyType::Tcp,
        6000,
        22,
        true,
    )
    .await;

    catalog
        .append_traffic(forward_id, 1024, 2048, Utc::now())
        .await
        .unwrap();
    catalog
        .append_traffic(forward_id, 10, 0, Utc::now())
        .await
        .unwrap();

    let count = TrafficRecord::find()
        .count(catalog.connection())
        .await
        .unwrap();
    assert_eq!(count, 2);
}
