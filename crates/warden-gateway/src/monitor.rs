//! Background maintenance: the reaper and the periodic anomaly scan.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::gateway::VaultGateway;

/// Handle to a running monitor. Dropping it does not stop the task.
pub struct Monitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Monitor {
    /// Spawn the monitor with the intervals from the gateway config.
    pub fn spawn(gateway: Arc<VaultGateway>) -> Self {
        let reap_every = Duration::from_secs(gateway.config().audit.reap_interval_secs.max(1));
        let scan_every = Duration::from_secs(gateway.config().anomaly.scan_interval_secs.max(1));
        Self::spawn_with(gateway, reap_every, scan_every)
    }

    pub fn spawn_with(gateway: Arc<VaultGateway>, reap_every: Duration, scan_every: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run(gateway, rx, reap_every, scan_every));
        tracing::info!(
            reap_secs = reap_every.as_secs(),
            scan_secs = scan_every.as_secs(),
            "monitor started"
        );
        Self { shutdown, handle }
    }

    /// Signal the task and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "monitor task ended abnormally");
        }
    }
}

async fn run(
    gateway: Arc<VaultGateway>,
    mut shutdown: watch::Receiver<bool>,
    reap_every: Duration,
    scan_every: Duration,
) {
    let mut reap = tokio::time::interval(reap_every);
    let mut scan = tokio::time::interval(scan_every);
    reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
    scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = reap.tick() => {
                gateway.reap();
            }
            _ = scan.tick() => {
                if let Err(e) = gateway.run_anomaly_scan() {
                    tracing::error!(error = %e, "anomaly scan failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("monitor stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use warden_access::{AccessPolicy, Caller};
    use warden_vault::keys::LocalKeyAuthority;
    use warden_vault::types::{Operation, SecretType};

    use super::*;
    use crate::config::WardenConfig;

    #[tokio::test]
    async fn reaper_drops_expired_sessions_and_stops() {
        let authority = Arc::new(LocalKeyAuthority::new(&[3u8; 32]).unwrap());
        authority.register("kek-1");
        let config = WardenConfig::default()
            .with_role(
                "ops",
                AccessPolicy {
                    allowed_types: vec![SecretType::Token],
                    allowed_operations: vec![Operation::Read],
                    ..AccessPolicy::default()
                },
            )
            .with_assignment("agent-7", "ops");
        let gateway = Arc::new(VaultGateway::in_memory(config, authority).unwrap());

        gateway
            .sessions()
            .create_at("agent-7", "fp", Duration::from_secs(1), Utc::now() - chrono::Duration::seconds(10))
            .unwrap();
        assert_eq!(gateway.sessions().len(), 1);

        let monitor = Monitor::spawn_with(
            gateway.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop().await;

        assert!(gateway.sessions().is_empty());

        // A caller holding the reaped session is now refused.
        let caller = Caller::new("agent-7", "acme", "fp").with_session("gone");
        let out = gateway.list_secrets(&caller).unwrap();
        assert!(out.error().is_some());
    }
}
