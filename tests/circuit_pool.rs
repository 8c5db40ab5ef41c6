//! Standby pool against simulated relays

mod common;

use common::{engine, engine_with, test_config, wait_until, SimNetwork};
use std::sync::Arc;
use std::time::Duration;
use tor_embedded::{CircuitPool, CircuitStatus, EngineConfig, ErrorKind, RelayCommand};

#[tokio::test]
async fn test_fill_and_take() {
    let net = SimNetwork::new(6);
    let (builder, _) = engine(&net);
    let pool = CircuitPool::new(builder);

    assert_eq!(pool.fill(2).await.unwrap(), 2);
    assert_eq!(pool.size(), 2);
    let stats = pool.get_stats();
    assert_eq!(stats.circuits_built, 2);
    assert_eq!(stats.current_pool_size, 2);

    // already full
    assert_eq!(pool.fill(2).await.unwrap(), 0);

    let circuit = pool.take().await.unwrap();
    assert_eq!(circuit.status(), CircuitStatus::Standby);
    assert_eq!(circuit.built_length(), 3);
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.get_stats().pool_hits, 1);

    circuit.send_relay(4, RelayCommand::Data, b"pooled").await.unwrap();
    assert_eq!(circuit.recv_relay().await.unwrap().data, b"pooled");
}

#[tokio::test]
async fn test_fill_standby_uses_config() {
    let net = SimNetwork::new(6);
    let config = EngineConfig {
        standby_circuits: 3,
        default_circuit_length: 2,
        ..test_config()
    };
    let (builder, _) = engine_with(&net, config);
    let pool = CircuitPool::new(builder);

    assert_eq!(pool.fill_standby().await.unwrap(), 3);
    let circuit = pool.take().await.unwrap();
    assert_eq!(circuit.built_length(), 2);
}

#[tokio::test]
async fn test_failed_build_is_retried() {
    let net = SimNetwork::new(5);
    let (builder, _) = engine(&net);
    let pool = CircuitPool::new(builder);
    net.refuse_creates(1);

    assert_eq!(pool.fill(1).await.unwrap(), 1);
    let stats = pool.get_stats();
    assert_eq!(stats.build_failures, 1);
    assert_eq!(stats.circuits_built, 1);
}

#[tokio::test]
async fn test_get_circuit_builds_on_miss() {
    let net = SimNetwork::new(4);
    let (builder, _) = engine(&net);
    let pool = CircuitPool::new(builder);

    let circuit = pool.get_circuit().await.unwrap();
    assert_eq!(circuit.status(), CircuitStatus::Standby);
    let stats = pool.get_stats();
    assert_eq!(stats.pool_misses, 1);
    assert_eq!(stats.pool_hits, 0);
}

#[tokio::test]
async fn test_keepalive_pads_then_evicts_dead_circuits() {
    let net = SimNetwork::new(6);
    let (builder, _) = engine(&net);
    let pool = CircuitPool::new(builder);
    pool.fill(2).await.unwrap();

    assert_eq!(pool.keepalive_once().await, 0);
    wait_until(|| net.padding_seen() == 2).await;
    assert_eq!(pool.size(), 2);

    net.sever_links();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pool.keepalive_once().await, 2);
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.get_stats().circuits_evicted, 2);
    assert!(pool.take().await.is_none());
}

#[tokio::test]
async fn test_spawned_keepalive() {
    let net = SimNetwork::new(4);
    let config = EngineConfig {
        keepalive_interval_ms: 20,
        ..test_config()
    };
    let (builder, _) = engine_with(&net, config);
    let pool = Arc::new(CircuitPool::new(builder));
    pool.fill(1).await.unwrap();

    let task = pool.clone().spawn_keepalive().unwrap();
    wait_until(|| net.padding_seen() >= 2).await;
    task.abort();
}

#[tokio::test]
async fn test_zero_keepalive_interval_refused() {
    let net = SimNetwork::new(3);
    let config = EngineConfig {
        keepalive_interval_ms: 0,
        ..test_config()
    };
    assert!(config.validate().is_err());

    let (builder, _) = engine_with(&net, config);
    let pool = Arc::new(CircuitPool::new(builder));
    let err = pool.spawn_keepalive().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[tokio::test]
async fn test_clear_destroys_pooled_circuits() {
    let net = SimNetwork::new(6);
    let (builder, _) = engine(&net);
    let pool = CircuitPool::new(builder);
    pool.fill(2).await.unwrap();

    pool.clear().await;
    assert_eq!(pool.size(), 0);
    wait_until(|| net.destroys_seen() == 2).await;
}
