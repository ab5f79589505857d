//! Polling, retention and history working against one store.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sensor_common::{
    Hardware, HardwareId, HardwareType, ManualClock, Result, Sample, Sensor, SensorId, SensorType,
    Topology,
};
use sensord::{
    HardwareInspector, OrchestrationService, RetentionScheduler, SampleStore, TelemetryStore,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fan whose speed goes up by 100 RPM on every read
struct RampingFan {
    rpm: AtomicI64,
}

fn board() -> Hardware {
    Hardware {
        id: HardwareId::new("/lpc/0"),
        name: "Super I/O".to_string(),
        kind: HardwareType::SuperIo,
    }
}

fn fan() -> Sensor {
    Sensor {
        id: SensorId::new("/lpc/0/fan/0"),
        hardware_id: HardwareId::new("/lpc/0"),
        name: "Fan #1".to_string(),
        kind: SensorType::Fan,
        max_value: 0,
    }
}

#[async_trait]
impl HardwareInspector for RampingFan {
    async fn list_hardware_with_sensors(&self, _cancel: &CancellationToken) -> Result<Topology> {
        Ok(Topology::from([(board(), vec![fan()])]))
    }

    async fn current_sensor_values(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<HashMap<Sensor, f64>> {
        let rpm = self.rpm.fetch_add(100, Ordering::SeqCst);
        Ok(HashMap::from([(fan(), rpm as f64)]))
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

fn minutes(n: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::minutes(n)
}

#[tokio::test]
async fn test_poll_prune_and_query() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(TelemetryStore::new());
    let service = OrchestrationService::new(
        Arc::new(clock.clone()),
        Arc::new(RampingFan {
            rpm: AtomicI64::new(1000),
        }),
        store.clone(),
    );
    let scheduler = RetentionScheduler::new(
        store.clone(),
        Arc::new(clock.clone()),
        Duration::from_secs(60),
        Duration::from_secs(120),
    )
    .unwrap();
    let cancel = CancellationToken::new();

    for minute in 0..5 {
        clock.set(minutes(minute));
        assert_eq!(service.poll(&cancel).await.unwrap(), 1);
    }
    assert_eq!(store.sample_count(&fan().id), 5);

    // now = t0+4m, window 2m: cutoff t0+2m is kept
    let removed = scheduler.prune_once().unwrap();
    assert_eq!(removed.get(&fan().id), Some(&2));

    // The query stores a new reading at t0+4m, replacing the polled one.
    let report = service
        .get_stats(&cancel, chrono::Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(
        report.find(&fan().id).unwrap().samples,
        vec![
            Sample::new(1200, minutes(2)),
            Sample::new(1300, minutes(3)),
            Sample::new(1500, minutes(4)),
        ]
    );
}

#[tokio::test]
async fn test_loops_run_concurrently_and_stop() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(TelemetryStore::new());
    let service = Arc::new(OrchestrationService::new(
        Arc::new(clock.clone()),
        Arc::new(RampingFan {
            rpm: AtomicI64::new(0),
        }),
        store.clone(),
    ));
    let scheduler = Arc::new(
        RetentionScheduler::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_millis(15),
            Duration::from_secs(60),
        )
        .unwrap(),
    );

    let shutdown = CancellationToken::new();
    let retention = scheduler.spawn(&shutdown);
    let poller = {
        let service = Arc::clone(&service);
        let cancel = shutdown.clone();
        tokio::spawn(async move { service.run(cancel, Duration::from_millis(5)).await })
    };

    for minute in 1..=3 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        clock.set(minutes(minute));
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    shutdown.cancel();
    poller.await.unwrap();
    retention.stop().await;

    // Window is one minute, so nothing older than t0+2m survives.
    let samples = store
        .get_values_for_range(&fan().id, DateTime::<Utc>::MIN_UTC, minutes(10))
        .unwrap();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.timestamp >= minutes(2)));
}
