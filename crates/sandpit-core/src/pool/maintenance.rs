//! Periodic pool maintenance: liveness checks, demand scaling and expiry.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};

use super::{InstanceProfile, Pool, RuntimeInstance};

/// Upper bound on instances created or destroyed by one scaling pass.
const SCALE_STEP: usize = 3;
/// Scale up when fewer than this many instances are idle.
const LOW_WATERMARK: usize = 2;

#[derive(Clone, Copy, Debug)]
enum Task {
    HealthCheck,
    AdjustSize,
    SweepExpired,
}

impl Pool {
    pub(super) async fn start_maintenance(self: &Arc<Self>) {
        let schedule = [
            (Task::HealthCheck, self.config.health_check_interval()),
            (Task::AdjustSize, self.config.scale_interval()),
            (Task::SweepExpired, self.config.expiry_interval()),
        ];

        let mut tasks = self.tasks.lock().await;
        for (task, period) in schedule {
            tasks.push(tokio::spawn(Self::run_periodic(Arc::clone(self), task, period)));
        }
    }

    async fn run_periodic(pool: Arc<Pool>, task: Task, period: Duration) {
        let mut ticker = interval_at(TokioInstant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = pool.cancel.cancelled() => {
                    log::debug!("Pool maintenance task {:?} stopped", task);
                    return;
                }
                _ = ticker.tick() => {
                    match task {
                        Task::HealthCheck => pool.health_check().await,
                        Task::AdjustSize => pool.adjust_size().await,
                        Task::SweepExpired => pool.sweep_expired().await,
                    }
                }
            }
        }
    }

    /// Destroy idle instances that fail the liveness probe, then backfill.
    /// Busy instances that fail are marked unhealthy and destroyed on release.
    pub async fn health_check(&self) {
        let (ids, busy_ids): (Vec<String>, Vec<String>) = {
            let state = self.state.lock().await;
            (
                state.available.iter().map(|i| i.id.clone()).collect(),
                state.busy.keys().cloned().collect(),
            )
        };

        let mut unhealthy = Vec::new();
        for id in ids {
            if !self.probe(&id).await {
                unhealthy.push(id);
            }
        }

        for id in busy_ids {
            if !self.probe(&id).await {
                if let Some(instance) = self.state.lock().await.busy.get_mut(&id) {
                    log::warn!("Busy instance {} failed liveness probe", instance.name);
                    instance.healthy = false;
                }
            }
        }

        if !unhealthy.is_empty() {
            let removed = self.take_idle_where(|i| unhealthy.contains(&i.id)).await;
            for instance in removed {
                log::info!("Health check removed unhealthy instance {}", instance.name);
                self.destroy(instance).await;
            }
        }

        self.ensure_min().await;
    }

    /// Grow when idle capacity runs low, shrink when there is a large surplus.
    pub async fn adjust_size(&self) {
        let (available, total) = {
            let state = self.state.lock().await;
            (state.available.len(), state.total)
        };
        let min = self.config.min_size;
        let max = self.config.max_size;

        if available < LOW_WATERMARK && total < max {
            let wanted = SCALE_STEP.min(max - total);
            let mut created = 0;
            for _ in 0..wanted {
                if !self.reserve_slot(max).await {
                    break;
                }
                match self.create_reserved(InstanceProfile::default()).await {
                    Ok(instance) => {
                        self.state.lock().await.available.push_back(instance);
                        self.released.notify_one();
                        created += 1;
                    }
                    Err(e) => {
                        log::error!("Failed to scale up pool: {}", e);
                        self.unreserve_slot().await;
                        break;
                    }
                }
            }
            if created > 0 {
                log::info!("Scaled pool up by {} instances", created);
            }
        } else if available > 2 * min && total > min {
            let surplus = (available - min).min(total - min).min(SCALE_STEP);
            let removed: Vec<RuntimeInstance> = {
                let mut state = self.state.lock().await;
                let take = surplus.min(state.available.len());
                let keep = state.available.len() - take;
                state.available.split_off(keep).into_iter().collect()
            };
            let count = removed.len();
            for instance in removed {
                self.destroy(instance).await;
            }
            if count > 0 {
                log::info!("Scaled pool down by {} instances", count);
            }
        }
    }

    /// Destroy idle instances past their use or idle limits, then backfill.
    pub async fn sweep_expired(&self) {
        let max_uses = self.config.max_uses;
        let max_idle = self.config.max_idle();
        let expired = self
            .take_idle_where(|i| i.is_expired(max_uses, max_idle))
            .await;

        if !expired.is_empty() {
            log::info!("Expiry sweep destroying {} instances", expired.len());
        }
        for instance in expired {
            self.destroy(instance).await;
        }

        self.ensure_min().await;
    }

    async fn take_idle_where<F>(&self, predicate: F) -> Vec<RuntimeInstance>
    where
        F: Fn(&RuntimeInstance) -> bool,
    {
        let mut state = self.state.lock().await;
        let (matched, kept): (Vec<_>, Vec<_>) =
            state.available.drain(..).partition(|i| predicate(i));
        state.available = kept.into();
        matched
    }
}
