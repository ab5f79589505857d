//! End-to-end collection from a real sensord router over loopback HTTP.

use async_trait::async_trait;
use sensor_collector::{FanOutCollector, HttpProvider, PrometheusSink, TelemetryProvider};
use sensor_common::{
    BackoffConfig, Hardware, HardwareId, HardwareType, Result, RetryPolicy, Sensor, SensorId,
    SensorType, SystemClock, Topology,
};
use sensord::{server, AppState, HardwareInspector, OrchestrationService, TelemetryStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct FixedInspector;

fn ram() -> Hardware {
    Hardware {
        id: HardwareId::new("/ram"),
        name: "Generic Memory".to_string(),
        kind: HardwareType::Ram,
    }
}

fn ram_load() -> Sensor {
    Sensor {
        id: SensorId::new("/ram/load/0"),
        hardware_id: HardwareId::new("/ram"),
        name: "Memory".to_string(),
        kind: SensorType::Load,
        max_value: 100,
    }
}

#[async_trait]
impl HardwareInspector for FixedInspector {
    async fn list_hardware_with_sensors(&self, _cancel: &CancellationToken) -> Result<Topology> {
        Ok(Topology::from([(ram(), vec![ram_load()])]))
    }

    async fn current_sensor_values(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<HashMap<Sensor, f64>> {
        Ok(HashMap::from([(ram_load(), 42.4)]))
    }
}

/// Serve a sensord router on an ephemeral loopback port
async fn spawn_sensord(shutdown: CancellationToken) -> String {
    let service = Arc::new(OrchestrationService::new(
        Arc::new(SystemClock),
        Arc::new(FixedInspector),
        Arc::new(TelemetryStore::new()),
    ));
    let state = AppState::new(
        service,
        Duration::from_millis(100),
        Duration::from_secs(5),
        Duration::from_secs(5),
        shutdown.clone(),
    )
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });

    format!("http://{}", addr)
}

fn policy() -> RetryPolicy {
    RetryPolicy::new(
        2,
        BackoffConfig {
            base_ms: 10,
            factor: 2.0,
            jitter_percent: 0.0,
            max_ms: 50,
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_collects_from_live_sensord() {
    let shutdown = CancellationToken::new();
    let host = spawn_sensord(shutdown.clone()).await;

    let provider = HttpProvider::connect(&host, Duration::from_secs(2), &shutdown)
        .await
        .unwrap();
    let snapshot = provider.get_stats(&shutdown).await.unwrap();
    assert_eq!(snapshot.sensor_count(), 1);

    let sink = Arc::new(PrometheusSink::new().unwrap());
    let providers: BTreeMap<String, Arc<dyn TelemetryProvider>> =
        BTreeMap::from([(host.clone(), Arc::new(provider) as Arc<dyn TelemetryProvider>)]);
    let collector = Arc::new(
        FanOutCollector::new(
            providers,
            sink.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
            policy(),
        )
        .unwrap(),
    );

    let results = collector.collect_once().await;
    assert_eq!(results[&host], Ok(1));

    let text = sink.export().unwrap();
    let line = text
        .lines()
        .find(|l| l.starts_with("sensor_value{") && l.contains(r#"sensor_id="/ram/load/0""#))
        .unwrap();
    assert!(line.contains(&format!(r#"host="{}""#, host)));
    assert!(line.contains(r#"hardware_type="ram""#));
    assert!(line.ends_with(" 42"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_down_host_is_counted_not_reported() {
    let shutdown = CancellationToken::new();
    let live = spawn_sensord(shutdown.clone()).await;
    let dead = "http://127.0.0.1:9".to_string();

    let providers: BTreeMap<String, Arc<dyn TelemetryProvider>> = BTreeMap::from([
        (
            live.clone(),
            Arc::new(HttpProvider::new(&live, Duration::from_secs(2)).unwrap())
                as Arc<dyn TelemetryProvider>,
        ),
        (
            dead.clone(),
            Arc::new(HttpProvider::new(&dead, Duration::from_secs(2)).unwrap())
                as Arc<dyn TelemetryProvider>,
        ),
    ]);
    let sink = Arc::new(PrometheusSink::new().unwrap());
    let collector = Arc::new(
        FanOutCollector::new(
            providers,
            sink.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
            policy(),
        )
        .unwrap(),
    );

    let results = collector.collect_once().await;
    assert_eq!(results[&live], Ok(1));
    assert!(results[&dead].is_err());

    let text = sink.export().unwrap();
    assert!(!text
        .lines()
        .any(|l| l.starts_with("sensor_value{") && l.contains(r#"host="http://127.0.0.1:9""#)));
    assert!(text.contains(r#"sensor_collect_failures_total{host="http://127.0.0.1:9"} 1"#));

    shutdown.cancel();
}
