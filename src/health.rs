//! Probe-driven health reconciliation.
//!
//! The reconciler runs inside the deployer. It consumes probe reports as
//! they arrive and sweeps every tracked container on a timer, restarting
//! containers whose fail counters reach the threshold. Restart I/O happens
//! outside the state lock.

use crate::deployer::{ContainerInfo, InstanceStatus};
use crate::prober::{ProbeKind, ProbeReport, ProbeStatus};
use crate::runtime::ContainerRuntime;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info, warn};

const LIVENESS_THRESHOLD: u32 = 3;
const READINESS_THRESHOLD: u32 = 3;
/// A probe silent for longer than this counts as failed.
const PROBE_STALE_AFTER: Duration = Duration::from_secs(3 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Health-tracking state of one container.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthState {
    pub liveness_fails: u32,
    pub readiness_fails: u32,
    /// Unix seconds of the last report per probe; zero until first seen.
    pub last_liveness_ts: i64,
    pub last_readiness_ts: i64,
    pub restarts: u32,
}

/// Consumes probe reports and restarts containers past the fail threshold.
pub struct HealthReconciler {
    states: Mutex<HashMap<String, HealthState>>,
    containers: Arc<Mutex<HashMap<String, ContainerInfo>>>,
    runtime: Arc<dyn ContainerRuntime>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl HealthReconciler {
    pub fn new(
        containers: Arc<Mutex<HashMap<String, ContainerInfo>>>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            containers,
            runtime,
        }
    }

    /// Runs the periodic sweep until the shutdown signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("starting health reconciler");

        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_at(unix_now()).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("health reconciler stopped");
                    return;
                }
            }
        }
    }

    /// Applies one probe report to the tracked state.
    pub fn handle_report(&self, report: &ProbeReport) {
        self.handle_report_at(report, unix_now());
    }

    fn handle_report_at(&self, report: &ProbeReport, now: i64) {
        let mut states = self.states.lock();
        let state = states.entry(report.container_name.clone()).or_default();

        let healthy = report.status == ProbeStatus::Healthy;

        match report.probe {
            ProbeKind::Liveness => {
                state.last_liveness_ts = now;
                if healthy {
                    state.liveness_fails = 0;
                    self.set_container_status(&report.container_name, InstanceStatus::Running, false);
                } else {
                    state.liveness_fails += 1;
                    self.set_container_status(&report.container_name, InstanceStatus::Failed, false);
                }
            }
            ProbeKind::Readiness => {
                state.last_readiness_ts = now;
                if healthy {
                    state.readiness_fails = 0;
                    self.set_container_status(&report.container_name, InstanceStatus::Running, false);
                } else {
                    state.readiness_fails += 1;
                    // A liveness failure dominates the readiness one.
                    self.set_container_status(
                        &report.container_name,
                        InstanceStatus::NotReady,
                        true,
                    );
                }
            }
        }
    }

    /// One reconciliation pass: stale probes are forced to the threshold,
    /// then containers past it are restarted.
    pub async fn sweep_at(&self, now: i64) {
        let due: Vec<String> = {
            let mut states = self.states.lock();
            let mut due = Vec::new();

            for (name, state) in states.iter_mut() {
                let stale = PROBE_STALE_AFTER.as_secs() as i64;

                if state.last_liveness_ts > 0 && now - state.last_liveness_ts > stale {
                    warn!(container = %name, "liveness probe stale");
                    state.liveness_fails = LIVENESS_THRESHOLD;
                }
                if state.last_readiness_ts > 0 && now - state.last_readiness_ts > stale {
                    warn!(container = %name, "readiness probe stale");
                    state.readiness_fails = READINESS_THRESHOLD;
                }

                // One restart per pass, liveness first; the action wipes
                // both counters.
                if state.liveness_fails >= LIVENESS_THRESHOLD
                    || state.readiness_fails >= READINESS_THRESHOLD
                {
                    state.liveness_fails = 0;
                    state.readiness_fails = 0;
                    state.restarts += 1;
                    due.push(name.clone());
                }
            }

            due
        };

        for name in due {
            info!(container = %name, "restarting unhealthy container");
            if let Err(e) = self.runtime.restart_container(&name).await {
                error!(container = %name, "failed to restart container: {}", e);
            }
        }
    }

    /// Snapshot of every tracked health state.
    pub fn states_snapshot(&self) -> HashMap<String, HealthState> {
        self.states.lock().clone()
    }

    fn set_container_status(&self, name: &str, status: InstanceStatus, keep_failed: bool) {
        let mut containers = self.containers.lock();
        if let Some(container) = containers.get_mut(name) {
            if keep_failed && container.status == InstanceStatus::Failed {
                return;
            }
            container.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MeshError, Result};
    use crate::runtime::ContainerSpec;
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeRuntime {
        restarted: Mutex<Vec<String>>,
        fail_restarts: bool,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create_network(&self, name: &str) -> Result<String> {
            Ok(name.to_string())
        }

        async fn image_exists(&self, _image: &str) -> bool {
            true
        }

        async fn pull_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }

        async fn create_and_start(&self, spec: ContainerSpec) -> Result<String> {
            Ok(spec.name)
        }

        async fn stop_container(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn remove_container(&self, _name: &str, _force: bool) -> Result<()> {
            Ok(())
        }

        async fn restart_container(&self, name: &str) -> Result<()> {
            self.restarted.lock().push(name.to_string());
            if self.fail_restarts {
                return Err(MeshError::RuntimeFailure("docker restart failed".into()));
            }
            Ok(())
        }
    }

    fn tracked_container(name: &str) -> (Arc<Mutex<HashMap<String, ContainerInfo>>>, ContainerInfo) {
        let info = ContainerInfo {
            name: name.to_string(),
            service_name: "svc".to_string(),
            status: InstanceStatus::Initializing,
            container_id: "cid".to_string(),
            sidecar_id: "sid".to_string(),
        };
        let containers = Arc::new(Mutex::new(HashMap::from([(name.to_string(), info.clone())])));
        (containers, info)
    }

    fn unhealthy(name: &str, probe: ProbeKind) -> ProbeReport {
        ProbeReport {
            container_name: name.to_string(),
            probe,
            status: ProbeStatus::Unhealthy,
        }
    }

    fn healthy(name: &str, probe: ProbeKind) -> ProbeReport {
        ProbeReport {
            container_name: name.to_string(),
            probe,
            status: ProbeStatus::Healthy,
        }
    }

    #[tokio::test]
    async fn test_liveness_threshold_restart() {
        let (containers, _) = tracked_container("x");
        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = HealthReconciler::new(containers, runtime.clone());

        for _ in 0..3 {
            reconciler.handle_report_at(&unhealthy("x", ProbeKind::Liveness), 100);
        }
        reconciler.sweep_at(100).await;

        assert_eq!(*runtime.restarted.lock(), vec!["x".to_string()]);
        let state = &reconciler.states_snapshot()["x"];
        assert_eq!(state.liveness_fails, 0);
        assert_eq!(state.restarts, 1);
    }

    #[tokio::test]
    async fn test_below_threshold_no_restart() {
        let (containers, _) = tracked_container("x");
        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = HealthReconciler::new(containers, runtime.clone());

        reconciler.handle_report_at(&unhealthy("x", ProbeKind::Liveness), 100);
        reconciler.handle_report_at(&unhealthy("x", ProbeKind::Liveness), 100);
        reconciler.sweep_at(100).await;

        assert!(runtime.restarted.lock().is_empty());
        assert_eq!(reconciler.states_snapshot()["x"].liveness_fails, 2);
    }

    #[tokio::test]
    async fn test_healthy_report_resets_counter() {
        let (containers, _) = tracked_container("x");
        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = HealthReconciler::new(containers.clone(), runtime.clone());

        reconciler.handle_report_at(&unhealthy("x", ProbeKind::Liveness), 100);
        reconciler.handle_report_at(&unhealthy("x", ProbeKind::Liveness), 100);
        reconciler.handle_report_at(&healthy("x", ProbeKind::Liveness), 100);
        reconciler.sweep_at(100).await;

        assert!(runtime.restarted.lock().is_empty());
        assert_eq!(reconciler.states_snapshot()["x"].liveness_fails, 0);
        assert_eq!(
            containers.lock()["x"].status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_readiness_threshold_restart() {
        let (containers, _) = tracked_container("x");
        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = HealthReconciler::new(containers.clone(), runtime.clone());

        for _ in 0..3 {
            reconciler.handle_report_at(&unhealthy("x", ProbeKind::Readiness), 100);
        }
        assert_eq!(containers.lock()["x"].status, InstanceStatus::NotReady);

        reconciler.sweep_at(100).await;

        assert_eq!(*runtime.restarted.lock(), vec!["x".to_string()]);
        let state = &reconciler.states_snapshot()["x"];
        assert_eq!(state.readiness_fails, 0);
        assert_eq!(state.restarts, 1);
    }

    #[tokio::test]
    async fn test_failed_status_dominates_not_ready() {
        let (containers, _) = tracked_container("x");
        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = HealthReconciler::new(containers.clone(), runtime);

        reconciler.handle_report_at(&unhealthy("x", ProbeKind::Liveness), 100);
        assert_eq!(containers.lock()["x"].status, InstanceStatus::Failed);

        reconciler.handle_report_at(&unhealthy("x", ProbeKind::Readiness), 100);
        assert_eq!(containers.lock()["x"].status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn test_restart_clears_both_counters() {
        let (containers, _) = tracked_container("x");
        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = HealthReconciler::new(containers, runtime.clone());

        for _ in 0..3 {
            reconciler.handle_report_at(&unhealthy("x", ProbeKind::Liveness), 100);
        }
        reconciler.handle_report_at(&unhealthy("x", ProbeKind::Readiness), 100);
        reconciler.handle_report_at(&unhealthy("x", ProbeKind::Readiness), 100);

        reconciler.sweep_at(100).await;

        // One restart, both counters wiped.
        assert_eq!(runtime.restarted.lock().len(), 1);
        let state = &reconciler.states_snapshot()["x"];
        assert_eq!(state.liveness_fails, 0);
        assert_eq!(state.readiness_fails, 0);
        assert_eq!(state.restarts, 1);
    }

    #[tokio::test]
    async fn test_stale_probe_forces_restart() {
        let (containers, _) = tracked_container("x");
        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = HealthReconciler::new(containers, runtime.clone());

        reconciler.handle_report_at(&healthy("x", ProbeKind::Liveness), 100);

        // Three minutes of silence forces the counter to the threshold.
        reconciler.sweep_at(100 + 181).await;

        assert_eq!(*runtime.restarted.lock(), vec!["x".to_string()]);
        assert_eq!(reconciler.states_snapshot()["x"].restarts, 1);
    }

    #[tokio::test]
    async fn test_runtime_error_keeps_state() {
        let (containers, _) = tracked_container("x");
        let runtime = Arc::new(FakeRuntime {
            fail_restarts: true,
            ..Default::default()
        });
        let reconciler = HealthReconciler::new(containers, runtime.clone());

        for _ in 0..3 {
            reconciler.handle_report_at(&unhealthy("x", ProbeKind::Liveness), 100);
        }
        reconciler.sweep_at(100).await;

        // The restart was attempted and accounted even though the runtime
        // call failed.
        assert_eq!(runtime.restarted.lock().len(), 1);
        let state = &reconciler.states_snapshot()["x"];
        assert_eq!(state.restarts, 1);
        assert_eq!(state.liveness_fails, 0);
    }

    #[tokio::test]
    async fn test_untracked_container_still_counted() {
        let containers = Arc::new(Mutex::new(HashMap::new()));
        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = HealthReconciler::new(containers, runtime.clone());

        for _ in 0..3 {
            reconciler.handle_report_at(&unhealthy("ghost", ProbeKind::Liveness), 100);
        }
        reconciler.sweep_at(100).await;

        assert_eq!(*runtime.restarted.lock(), vec!["ghost".to_string()]);
    }
}
