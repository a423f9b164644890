use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    config::models::HealthCheckConfig,
    core::{
        destination::{Destination, DestinationHealth, HealthStatus},
        load_balancer::LoadBalancer,
    },
    ports::transport::Transport,
};

/// Keep-alive prober feeding destination liveness into the load balancer
pub struct HealthChecker {
    balancer: Arc<LoadBalancer>,
    transport: Arc<dyn Transport>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(balancer: Arc<LoadBalancer>, transport: Arc<dyn Transport>, config: HealthCheckConfig) -> Self {
        Self {
            balancer,
            transport,
            config,
        }
    }

    /// Run the probe loop until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("Health checking is disabled");
            return;
        }

        let interval = Duration::from_secs(self.config.interval_secs);
        tracing::info!(
            interval_secs = self.config.interval_secs,
            timeout_secs = self.config.timeout_secs,
            "Starting health checker"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Health checker stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            self.check_all().await;
        }
    }

    /// Evict stale destinations, then probe every tracked one once
    pub async fn check_all(&self) {
        if self.config.stale_after_secs > 0 {
            let evicted = self
                .balancer
                .evict_stale(Duration::from_secs(self.config.stale_after_secs))
                .await;
            if evicted > 0 {
                tracing::info!(evicted, "Stopped probing stale destinations");
            }
        }

        let tracked = self.balancer.tracked_destinations().await;
        tracing::debug!(destinations = tracked.len(), "Running keep-alive probes");

        for entry in tracked {
            self.check_destination(&entry.destination, &entry.health).await;
        }
    }

    async fn check_destination(&self, destination: &Destination, health: &DestinationHealth) {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        match self.transport.probe(destination, timeout).await {
            Ok(true) => self.handle_probe_success(destination, health).await,
            Ok(false) => {
                self.handle_probe_failure(destination, health, "no answer to keep-alive")
                    .await
            }
            Err(err) => {
                self.handle_probe_failure(destination, health, &format!("probe error: {err}"))
                    .await
            }
        }
    }

    async fn handle_probe_success(&self, destination: &Destination, health: &DestinationHealth) {
        let successes = health.record_success();

        if successes >= self.config.healthy_threshold && health.status() == HealthStatus::Unhealthy {
            tracing::info!(%destination, successes, "Destination recovered");
            self.balancer.report_health(destination, true).await;
        }
    }

    async fn handle_probe_failure(&self, destination: &Destination, health: &DestinationHealth, reason: &str) {
        let failures = health.record_failure();

        tracing::debug!(
            %destination,
            reason,
            failures,
            threshold = self.config.unhealthy_threshold,
            "Keep-alive probe failed"
        );

        if failures >= self.config.unhealthy_threshold && health.status() == HealthStatus::Healthy {
            tracing::warn!(%destination, failures, reason, "Destination is now unhealthy");
            self.balancer.report_health(destination, false).await;
        }
    }
}
