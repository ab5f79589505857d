//! Fan-out collector
//!
//! On every tick (and once at start) each configured source is collected on
//! its own task:
//! 1. a tick for a source whose previous collection is still running joins
//!    that collection instead of starting another
//! 2. attempts are retried with backoff, all bounded by one timeout
//! 3. on success every sensor value is reported to the sink, once
//! 4. on failure the error is logged and counted; other sources carry on

use crate::provider::TelemetryProvider;
use crate::sink::{MetricsSink, SensorLabels};
use sensor_common::{CallGroup, Result, RetryPolicy, StatsSnapshot, TelemetryError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct FanOutCollector {
    providers: BTreeMap<String, Arc<dyn TelemetryProvider>>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    timeout: Duration,
    retry: RetryPolicy,
    flights: CallGroup<String, usize>,
}

impl FanOutCollector {
    pub fn new(
        providers: BTreeMap<String, Arc<dyn TelemetryProvider>>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        if providers.is_empty() {
            return Err(TelemetryError::construction("no providers configured"));
        }
        if interval.is_zero() {
            return Err(TelemetryError::construction(
                "collect interval must be greater than 0",
            ));
        }
        if timeout.is_zero() {
            return Err(TelemetryError::construction(
                "collect timeout must be greater than 0",
            ));
        }
        if retry.max_attempts == 0 {
            return Err(TelemetryError::construction(
                "collect attempts must be greater than 0",
            ));
        }

        Ok(Self {
            providers,
            sink,
            interval,
            timeout,
            retry,
            flights: CallGroup::new(),
        })
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Collect now and then on every interval until `cancel` fires.
    /// Collections already dispatched are awaited before returning; each is
    /// bounded by the collect timeout.
    pub async fn collect(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            sources = self.providers.len(),
            interval = ?self.interval,
            timeout = ?self.timeout,
            attempts = self.retry.max_attempts,
            "collector started"
        );

        // First tick completes immediately.
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Vec<JoinHandle<Result<usize>>> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            pending.retain(|handle| !handle.is_finished());
            pending.extend(self.dispatch_all().into_values());
        }

        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "collection task did not exit cleanly");
            }
        }
        info!("collector stopped");
    }

    /// Start a collection for every source. Each handle resolves to the
    /// number of values reported for that source.
    pub fn dispatch_all(self: &Arc<Self>) -> HashMap<String, JoinHandle<Result<usize>>> {
        self.providers
            .keys()
            .map(|source| {
                let this = Arc::clone(self);
                let key = source.clone();
                (source.clone(), tokio::spawn(async move { this.collect_source(key).await }))
            })
            .collect()
    }

    /// One full round: dispatch every source and wait for all of them.
    pub async fn collect_once(self: &Arc<Self>) -> HashMap<String, Result<usize>> {
        let mut results = HashMap::new();
        for (source, handle) in self.dispatch_all() {
            let result = handle.await.unwrap_or_else(|e| {
                Err(TelemetryError::Internal(format!("collection task failed: {}", e)))
            });
            results.insert(source, result);
        }
        results
    }

    async fn collect_source(self: Arc<Self>, source: String) -> Result<usize> {
        let this = Arc::clone(&self);
        let key = source.clone();
        let outcome = self
            .flights
            .run(key, move || async move { this.attempt(&source).await })
            .await;

        if outcome.joined {
            debug!("joined collection already in flight");
        }
        outcome.result
    }

    async fn attempt(&self, source: &str) -> Result<usize> {
        let provider = self
            .providers
            .get(source)
            .cloned()
            .ok_or_else(|| TelemetryError::Internal(format!("unknown source {}", source)))?;

        let started = Instant::now();
        // Own token: stopping the collect loop does not abort a running attempt.
        let cancel = CancellationToken::new();

        let result = self
            .retry
            .run(self.timeout, &cancel, |attempt| {
                let provider = Arc::clone(&provider);
                let cancel = cancel.clone();
                let source = source.to_string();
                async move {
                    let result = provider.get_stats(&cancel).await;
                    if let Err(e) = &result {
                        debug!(source = %source, attempt = attempt + 1, error = %e, "attempt failed");
                    }
                    result
                }
            })
            .await;

        match result {
            Ok(snapshot) => {
                let reported = self.report(source, &snapshot);
                debug!(source, reported, elapsed = ?started.elapsed(), "collected");
                Ok(reported)
            }
            Err(e) => {
                error!(source, elapsed = ?started.elapsed(), error = %e, "failed to collect");
                self.sink.record_failure(source);
                Err(e)
            }
        }
    }

    fn report(&self, source: &str, snapshot: &StatsSnapshot) -> usize {
        let mut reported = 0;
        for hw in &snapshot.hardware {
            for reading in &hw.sensors {
                let labels = SensorLabels::new(source, &hw.hardware, &reading.sensor);
                self.sink.report_sensor_value(reading.value.value, &labels);
                reported += 1;
            }
        }
        reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use sensor_common::{
        BackoffConfig, Hardware, HardwareId, HardwareReading, HardwareType, Sample, Sensor,
        SensorId, SensorReading, SensorType,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<(i64, SensorLabels)>>,
        failures: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn reports_for(&self, source: &str) -> Vec<(i64, SensorLabels)> {
            self.reports
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, labels)| labels.source == source)
                .cloned()
                .collect()
        }

        fn failures(&self) -> Vec<String> {
            self.failures.lock().unwrap().clone()
        }
    }

    impl MetricsSink for RecordingSink {
        fn report_sensor_value(&self, value: i64, labels: &SensorLabels) {
            self.reports.lock().unwrap().push((value, labels.clone()));
        }

        fn record_failure(&self, source: &str) {
            self.failures.lock().unwrap().push(source.to_string());
        }
    }

    /// Fails the first `fail_first` calls, optionally sleeping before each
    struct ScriptedProvider {
        calls: AtomicUsize,
        fail_first: usize,
        delay: Duration,
    }

    impl ScriptedProvider {
        fn new(fail_first: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_first,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn snapshot() -> StatsSnapshot {
        let hardware = Hardware {
            id: HardwareId::new("/cpu/0"),
            name: "Test CPU".to_string(),
            kind: HardwareType::Cpu,
        };
        let sensors = ["/cpu/0/load/0", "/cpu/0/load/1"]
            .iter()
            .enumerate()
            .map(|(i, id)| SensorReading {
                sensor: Sensor {
                    id: SensorId::new(*id),
                    hardware_id: hardware.id.clone(),
                    name: format!("CPU Core #{}", i),
                    kind: SensorType::Load,
                    max_value: 100,
                },
                value: Sample::new(10 * (i as i64 + 1), Utc::now()),
            })
            .collect();

        StatsSnapshot {
            taken_at: Utc::now(),
            hardware: vec![HardwareReading { hardware, sensors }],
        }
    }

    #[async_trait]
    impl TelemetryProvider for ScriptedProvider {
        async fn get_stats(&self, _cancel: &CancellationToken) -> Result<StatsSnapshot> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if n <= self.fail_first {
                return Err(TelemetryError::upstream("GET /api/v1/stats", "connection reset"));
            }
            Ok(snapshot())
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            BackoffConfig {
                base_ms: 1,
                factor: 2.0,
                jitter_percent: 0.0,
                max_ms: 5,
            },
        )
        .unwrap()
    }

    fn collector(
        providers: Vec<(&str, Arc<ScriptedProvider>)>,
        sink: Arc<RecordingSink>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Arc<FanOutCollector> {
        let providers = providers
            .into_iter()
            .map(|(name, p)| (name.to_string(), p as Arc<dyn TelemetryProvider>))
            .collect();
        Arc::new(
            FanOutCollector::new(
                providers,
                sink,
                Duration::from_secs(3600),
                timeout,
                policy(max_attempts),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_construction_validation() {
        let sink: Arc<dyn MetricsSink> = Arc::new(RecordingSink::default());
        let one = || {
            BTreeMap::from([(
                "a".to_string(),
                ScriptedProvider::new(0, Duration::ZERO) as Arc<dyn TelemetryProvider>,
            )])
        };
        let second = Duration::from_secs(1);

        let cases = [
            FanOutCollector::new(BTreeMap::new(), sink.clone(), second, second, policy(1)),
            FanOutCollector::new(one(), sink.clone(), Duration::ZERO, second, policy(1)),
            FanOutCollector::new(one(), sink.clone(), second, Duration::ZERO, policy(1)),
            FanOutCollector::new(
                one(),
                sink.clone(),
                second,
                second,
                RetryPolicy {
                    max_attempts: 0,
                    backoff: BackoffConfig::default(),
                },
            ),
        ];
        for case in cases {
            assert!(matches!(case, Err(TelemetryError::Construction(_))));
        }
    }

    #[tokio::test]
    async fn test_success_on_kth_attempt_reports_once() {
        let sink = Arc::new(RecordingSink::default());
        let flaky = ScriptedProvider::new(2, Duration::ZERO);
        let collector = collector(vec![("flaky", flaky.clone())], sink.clone(), Duration::from_secs(5), 3);

        let results = collector.collect_once().await;

        assert_eq!(results["flaky"], Ok(2));
        assert_eq!(flaky.calls(), 3);
        let reports = sink.reports_for("flaky");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, 10);
        assert_eq!(reports[1].1.sensor_id, "/cpu/0/load/1");
        assert!(sink.failures().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_source_reports_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let down = ScriptedProvider::new(usize::MAX, Duration::ZERO);
        let up = ScriptedProvider::new(0, Duration::ZERO);
        let collector = collector(
            vec![("down", down.clone()), ("up", up)],
            sink.clone(),
            Duration::from_secs(5),
            2,
        );

        let results = collector.collect_once().await;

        assert!(matches!(results["down"], Err(TelemetryError::Upstream { .. })));
        assert_eq!(down.calls(), 2);
        assert!(sink.reports_for("down").is_empty());
        assert_eq!(sink.reports_for("up").len(), 2);
        assert_eq!(sink.failures(), vec!["down".to_string()]);
    }

    #[tokio::test]
    async fn test_hanging_source_does_not_delay_others() {
        let sink = Arc::new(RecordingSink::default());
        let hanging = ScriptedProvider::new(0, Duration::from_secs(30));
        let up = ScriptedProvider::new(0, Duration::ZERO);
        let collector = collector(
            vec![("hanging", hanging), ("up", up)],
            sink.clone(),
            Duration::from_millis(200),
            2,
        );

        let mut handles = collector.dispatch_all();
        let up = handles.remove("up").unwrap();
        let result = tokio::time::timeout(Duration::from_millis(100), up).await;
        assert_eq!(result.unwrap().unwrap(), Ok(2));

        let hanging = handles.remove("hanging").unwrap().await.unwrap();
        assert_eq!(hanging, Err(TelemetryError::Timeout(Duration::from_millis(200))));
        assert!(sink.reports_for("hanging").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_tick_joins_in_flight_collection() {
        let sink = Arc::new(RecordingSink::default());
        let slow = ScriptedProvider::new(0, Duration::from_millis(150));
        let collector = collector(vec![("slow", slow.clone())], sink.clone(), Duration::from_secs(5), 1);

        let first = collector.dispatch_all();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = collector.dispatch_all();

        for handles in [first, second] {
            for (_, handle) in handles {
                assert_eq!(handle.await.unwrap(), Ok(2));
            }
        }

        assert_eq!(slow.calls(), 1);
        assert_eq!(sink.reports_for("slow").len(), 2);
    }

    #[tokio::test]
    async fn test_collect_runs_immediately_and_stops() {
        let sink = Arc::new(RecordingSink::default());
        let up = ScriptedProvider::new(0, Duration::ZERO);
        let collector = collector(vec![("up", up.clone())], sink.clone(), Duration::from_secs(5), 1);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&collector).collect(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        // Interval is an hour, so only the immediate round ran.
        assert_eq!(up.calls(), 1);
        assert_eq!(sink.reports_for("up").len(), 2);
    }
}
