use std::{
    cmp::Ordering,
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use scc::HashMap;

use crate::core::destination::{Destination, DestinationHealth, DestinationKey, HealthStatus};

/// A destination known to the balancer together with its liveness record
#[derive(Debug, Clone)]
pub struct TrackedDestination {
    pub destination: Destination,
    pub health: Arc<DestinationHealth>,
    /// Last time this destination showed up in a candidate list
    pub last_seen: Instant,
}

/// Orders and selects candidate destinations.
///
/// Selection is deterministic: excluded candidates are skipped, healthy ones
/// come before unhealthy ones, then higher preference wins, then the original
/// (resolver) order. Health is advisory only, so an all-unhealthy candidate
/// list still yields a destination.
#[derive(Default)]
pub struct LoadBalancer {
    tracked: HashMap<DestinationKey, TrackedDestination>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the best remaining candidate, or `None` once every candidate has
    /// been excluded.
    pub async fn select(
        &self,
        candidates: &[Destination],
        excluded: &HashSet<DestinationKey>,
    ) -> Option<Destination> {
        let mut best: Option<(usize, &Destination, bool)> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            if excluded.contains(&candidate.key()) {
                continue;
            }
            let healthy = self.status(candidate).await == HealthStatus::Healthy;
            let better = match best {
                None => true,
                Some((best_index, best_dest, best_healthy)) => {
                    rank(healthy, candidate.preference(), index, best_healthy, best_dest.preference(), best_index)
                        == Ordering::Less
                }
            };
            if better {
                best = Some((index, candidate, healthy));
            }
        }

        best.map(|(_, destination, _)| destination.clone())
    }

    /// Full selection order of `candidates`, best first
    pub async fn order(&self, candidates: &[Destination]) -> Vec<Destination> {
        let mut ranked = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            let healthy = self.status(candidate).await == HealthStatus::Healthy;
            ranked.push((index, candidate, healthy));
        }
        ranked.sort_by(|a, b| rank(a.2, a.1.preference(), a.0, b.2, b.1.preference(), b.0));
        ranked.into_iter().map(|(_, d, _)| d.clone()).collect()
    }

    /// Register a destination so the keep-alive prober watches it. Already
    /// tracked destinations keep their current health record and are only
    /// marked as seen.
    pub async fn track(&self, destination: &Destination) {
        let key = destination.key();
        if let Some(mut entry) = self.tracked.get_async(&key).await {
            entry.get_mut().last_seen = Instant::now();
            return;
        }
        let _ = self
            .tracked
            .insert_async(
                key,
                TrackedDestination {
                    destination: destination.clone(),
                    health: Arc::new(DestinationHealth::new()),
                    last_seen: Instant::now(),
                },
            )
            .await;
    }

    /// Liveness signal from the health subsystem
    pub async fn report_health(&self, destination: &Destination, healthy: bool) {
        if self.tracked.get_async(&destination.key()).await.is_none() {
            self.track(destination).await;
        }
        if let Some(entry) = self.tracked.get_async(&destination.key()).await {
            let health = &entry.get().health;
            let was_healthy = health.is_healthy();
            health.set_status(if healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            });
            if was_healthy != healthy {
                tracing::info!(
                    destination = %destination,
                    healthy,
                    "Destination health changed"
                );
            }
        }
    }

    /// Last reported status (Healthy if unknown / untracked)
    pub async fn status(&self, destination: &Destination) -> HealthStatus {
        self.tracked
            .get_async(&destination.key())
            .await
            .map(|entry| entry.get().health.status())
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Health record of a tracked destination
    pub async fn health_record(&self, destination: &Destination) -> Option<Arc<DestinationHealth>> {
        self.tracked
            .get_async(&destination.key())
            .await
            .map(|entry| entry.get().health.clone())
    }

    /// Snapshot of every tracked destination
    pub async fn tracked_destinations(&self) -> Vec<TrackedDestination> {
        let mut tracked = Vec::new();
        let out = &mut tracked;
        self.tracked
            .retain_async(|_, entry| {
                out.push(entry.clone());
                true
            })
            .await;
        tracked
    }

    /// Stop tracking destinations not seen for longer than `max_age`.
    /// Returns how many were dropped.
    pub async fn evict_stale(&self, max_age: Duration) -> usize {
        let mut evicted = 0;
        let count = &mut evicted;
        self.tracked
            .retain_async(|_, entry| {
                let keep = entry.last_seen.elapsed() <= max_age;
                if !keep {
                    tracing::debug!(destination = %entry.destination, "Evicting stale destination");
                    *count += 1;
                }
                keep
            })
            .await;
        evicted
    }

    /// Count of (healthy, unhealthy) tracked destinations
    pub async fn health_summary(&self) -> (usize, usize) {
        let tracked = self.tracked_destinations().await;
        let healthy = tracked.iter().filter(|t| t.health.is_healthy()).count();
        (healthy, tracked.len() - healthy)
    }
}

/// `Less` means the first candidate should be tried before the second
fn rank(
    a_healthy: bool,
    a_preference: f32,
    a_index: usize,
    b_healthy: bool,
    b_preference: f32,
    b_index: usize,
) -> Ordering {
    b_healthy
        .cmp(&a_healthy)
        .then(b_preference.total_cmp(&a_preference))
        .then(a_index.cmp(&b_index))
}
