//! Runtime instance pool
//!
//! A bounded set of pre-created, reusable instances. Every instance is in
//! exactly one of three places: the available queue, the busy map, or gone.
//! `total` is reserved before an instance is created and released only after
//! it has been destroyed, so `available + busy <= total <= max_size` holds at
//! every observation point.

mod instance;
mod maintenance;

#[cfg(test)]
mod tests;

pub use instance::{InstanceProfile, PoolStatistics, RuntimeInstance};

use futures_util::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::errors::SandpitError;
use crate::runtime::{ContainerRuntime, ExecCommand, InstanceSpec};

/// Grace period given to an instance before it is killed on destroy.
const STOP_GRACE: Duration = Duration::from_secs(5);
const CPU_QUOTA: i64 = 100_000;
const POOL_LABEL: &str = "sandpit.pool";

#[derive(Default)]
struct PoolState {
    available: VecDeque<RuntimeInstance>,
    busy: HashMap<String, RuntimeInstance>,
    total: usize,
    shutting_down: bool,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
}

pub struct Pool {
    runtime: Arc<dyn ContainerRuntime>,
    config: PoolConfig,
    /// Unprivileged user whose leftover processes are killed on release.
    run_user: Option<String>,
    state: Mutex<PoolState>,
    counters: Counters,
    released: Notify,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: PoolConfig) -> Arc<Self> {
        Self::with_run_user(runtime, config, None)
    }

    pub fn with_run_user(
        runtime: Arc<dyn ContainerRuntime>,
        config: PoolConfig,
        run_user: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            config,
            run_user,
            state: Mutex::new(PoolState::default()),
            counters: Counters::default(),
            released: Notify::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Verify the image, warm the pool to `min_size` and start maintenance.
    pub async fn init(self: &Arc<Self>) -> Result<(), SandpitError> {
        if !self.runtime.image_exists(&self.config.image).await? {
            return Err(SandpitError::Runtime(format!(
                "Image '{}' is not available locally",
                self.config.image
            )));
        }
        tokio::fs::create_dir_all(&self.config.work_root).await?;

        log::info!(
            "Initializing instance pool (min={}, max={}, image={})",
            self.config.min_size,
            self.config.max_size,
            self.config.image
        );

        let warmup = self.warm_up();
        if tokio::time::timeout(self.config.warmup_timeout(), warmup)
            .await
            .is_err()
        {
            log::warn!(
                "Pool warm-up did not finish within {:?}; continuing with a partial pool",
                self.config.warmup_timeout()
            );
        }

        self.start_maintenance().await;

        let stats = self.statistics().await;
        log::info!(
            "Instance pool ready: {} instances available",
            stats.available
        );
        Ok(())
    }

    /// Create instances in parallel until `min_size` is reached.
    pub async fn warm_up(&self) {
        let mut reservations = 0;
        {
            let mut state = self.state.lock().await;
            while state.total < self.config.min_size {
                state.total += 1;
                reservations += 1;
            }
        }

        let created = join_all(
            (0..reservations).map(|_| self.create_reserved(InstanceProfile::default())),
        )
        .await;

        let mut state = self.state.lock().await;
        for result in created {
            match result {
                Ok(instance) => state.available.push_back(instance),
                Err(e) => {
                    log::error!("Failed to create instance during warm-up: {}", e);
                    state.total = state.total.saturating_sub(1);
                }
            }
        }
    }

    pub async fn acquire(&self, timeout: Duration) -> Result<RuntimeInstance, SandpitError> {
        self.acquire_with(timeout, InstanceProfile::default()).await
    }

    /// Hand out a health-checked instance matching `profile`, marking it busy.
    pub async fn acquire_with(
        &self,
        timeout: Duration,
        profile: InstanceProfile,
    ) -> Result<RuntimeInstance, SandpitError> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(instance) = self.take_available(profile).await? {
                if self.probe(&instance.id).await {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Pool hit: {} (use {})", instance.name, instance.use_count);
                    return Ok(instance);
                }
                log::warn!("Instance {} failed liveness probe on acquire", instance.name);
                let unhealthy = self.state.lock().await.busy.remove(&instance.id);
                if let Some(unhealthy) = unhealthy {
                    self.destroy(unhealthy).await;
                }
                continue;
            }

            if self.reserve_slot(self.config.max_size).await {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                match self.create_reserved(profile).await {
                    Ok(mut instance) => {
                        instance.mark_used();
                        log::debug!("Pool miss: created {}", instance.name);
                        let mut state = self.state.lock().await;
                        state.busy.insert(instance.id.clone(), instance.clone());
                        return Ok(instance);
                    }
                    Err(e) => {
                        log::error!("Failed to create instance on demand: {}", e);
                        self.unreserve_slot().await;
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                log::warn!("Timed out after {:?} waiting for an instance", timeout);
                return Err(SandpitError::AcquireTimeout(timeout));
            }
            let wait = self.config.acquire_poll().min(deadline - now);
            let _ = tokio::time::timeout(wait, self.released.notified()).await;
        }
    }

    /// Clean an instance and return it to the available set, or destroy it if
    /// it has expired. Returns false for ids that are not currently busy.
    pub async fn release(self: &Arc<Self>, instance_id: &str) -> bool {
        let instance = self.state.lock().await.busy.remove(instance_id);
        let Some(mut instance) = instance else {
            log::warn!("Release of unknown or already released instance {}", instance_id);
            return false;
        };

        if !instance.healthy {
            log::info!("Instance {} is unhealthy, destroying it", instance.name);
            self.destroy(instance).await;
            self.spawn_backfill();
            return true;
        }

        if let Err(e) = self.cleanup(&instance).await {
            log::warn!("Cleanup of {} failed, destroying it: {}", instance.name, e);
            self.destroy(instance).await;
            self.spawn_backfill();
            return true;
        }

        if instance.is_expired(self.config.max_uses, self.config.max_idle()) {
            log::info!(
                "Instance {} expired after {} uses, destroying",
                instance.name,
                instance.use_count
            );
            self.destroy(instance).await;
            self.spawn_backfill();
            return true;
        }

        instance.last_used = Instant::now();
        let mut state = self.state.lock().await;
        if state.shutting_down {
            drop(state);
            self.destroy(instance).await;
        } else {
            state.available.push_back(instance);
            drop(state);
            self.released.notify_one();
        }
        true
    }

    pub async fn statistics(&self) -> PoolStatistics {
        let state = self.state.lock().await;
        let requests = self.counters.requests.load(Ordering::Relaxed);
        let hits = self.counters.hits.load(Ordering::Relaxed);
        PoolStatistics {
            total: state.total,
            available: state.available.len(),
            busy: state.busy.len(),
            requests,
            hits,
            misses: self.counters.misses.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            hit_rate: PoolStatistics::hit_rate(hits, requests),
        }
    }

    /// Stop maintenance and destroy every instance, busy ones included.
    pub async fn shutdown(&self) {
        log::info!("Shutting down instance pool");
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let instances: Vec<RuntimeInstance> = {
            let mut state = self.state.lock().await;
            state.shutting_down = true;
            let mut all: Vec<RuntimeInstance> = state.available.drain(..).collect();
            all.extend(state.busy.drain().map(|(_, instance)| instance));
            all
        };

        join_all(instances.into_iter().map(|instance| self.destroy(instance))).await;
        self.released.notify_waiters();
        log::info!("Instance pool shut down");
    }

    async fn take_available(
        &self,
        profile: InstanceProfile,
    ) -> Result<Option<RuntimeInstance>, SandpitError> {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(SandpitError::internal("instance pool is shut down"));
        }
        let position = state
            .available
            .iter()
            .position(|i| i.network_enabled == profile.network_enabled);
        let Some(mut instance) = position.and_then(|p| state.available.remove(p)) else {
            return Ok(None);
        };
        // Busy before the probe so no other caller can observe it as available.
        instance.mark_used();
        state.busy.insert(instance.id.clone(), instance.clone());
        Ok(Some(instance))
    }

    async fn probe(&self, id: &str) -> bool {
        match self.runtime.is_running(id).await {
            Ok(running) => running,
            Err(e) => {
                log::warn!("Liveness probe for {} failed: {}", id, e);
                false
            }
        }
    }

    /// Reserve room for one more instance if the pool has fewer than `limit`.
    async fn reserve_slot(&self, limit: usize) -> bool {
        let mut state = self.state.lock().await;
        if state.shutting_down || state.total >= limit.min(self.config.max_size) {
            return false;
        }
        state.total += 1;
        true
    }

    async fn unreserve_slot(&self) {
        let mut state = self.state.lock().await;
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.released.notify_one();
    }

    /// Create and start an instance for an already reserved slot.
    async fn create_reserved(&self, profile: InstanceProfile) -> Result<RuntimeInstance, SandpitError> {
        let short_id = Uuid::new_v4().simple().to_string();
        let name = format!("sandpit-pool-{}", &short_id[..8]);
        let host_dir = self.config.work_root.join(&name);

        tokio::fs::create_dir_all(&host_dir).await?;
        open_permissions(&host_dir).await?;

        let mut labels = HashMap::new();
        labels.insert(POOL_LABEL.to_string(), "true".to_string());
        labels.insert("sandpit.instance".to_string(), name.clone());

        let spec = InstanceSpec {
            name: name.clone(),
            image: self.config.image.clone(),
            host_mount: host_dir.clone(),
            container_mount: self.config.instance_workdir.clone(),
            memory_bytes: self.config.instance_memory_bytes,
            pids_limit: self.config.instance_pids_limit,
            cpu_quota: CPU_QUOTA,
            network_enabled: profile.network_enabled,
            labels,
        };

        let id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&host_dir).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.runtime.start(&id).await {
            let _ = self.runtime.remove(&id).await;
            let _ = tokio::fs::remove_dir_all(&host_dir).await;
            return Err(e.into());
        }

        log::info!("Created instance {} ({})", name, id);
        Ok(RuntimeInstance::new(
            id,
            name,
            host_dir,
            self.config.instance_workdir.clone(),
            profile.network_enabled,
        ))
    }

    /// Best-effort teardown. The slot is freed even if the runtime complains.
    async fn destroy(&self, instance: RuntimeInstance) {
        if let Err(e) = self.runtime.stop(&instance.id, STOP_GRACE).await {
            log::warn!("Failed to stop {}, killing it: {}", instance.name, e);
            if let Err(e) = self.runtime.kill(&instance.id).await {
                log::warn!("Failed to kill {}: {}", instance.name, e);
            }
        }
        if let Err(e) = self.runtime.remove(&instance.id).await {
            log::error!("Failed to remove {}: {}", instance.name, e);
        }
        let _ = open_permissions(&instance.host_dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&instance.host_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to remove directory {}: {}",
                    instance.host_dir.display(),
                    e
                );
            }
        }

        let mut state = self.state.lock().await;
        state.total = state.total.saturating_sub(1);
        drop(state);
        log::debug!("Destroyed instance {}", instance.name);
        self.released.notify_one();
    }

    /// Kill leftover user processes and empty the private directory.
    async fn cleanup(&self, instance: &RuntimeInstance) -> Result<(), SandpitError> {
        if let Some(user) = self.run_user.as_deref() {
            let user_name = user.split(':').next().unwrap_or(user);
            // pkill exits 1 when nothing matched; only transport errors count.
            self.runtime
                .exec_in(&instance.id, &ExecCommand::new(["pkill", "-9", "-u", user_name]))
                .await?;
        }

        let wipe = ExecCommand::new([
            "find",
            instance.container_dir.as_str(),
            "-mindepth",
            "1",
            "-delete",
        ]);
        self.runtime.exec_in(&instance.id, &wipe).await?;

        clear_dir(&instance.host_dir).await?;
        Ok(())
    }

    fn spawn_backfill(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.ensure_min().await;
        });
    }

    /// Create instances until `total >= min_size`. Stops at the first failure.
    pub async fn ensure_min(&self) {
        while self.reserve_slot(self.config.min_size).await {
            match self.create_reserved(InstanceProfile::default()).await {
                Ok(instance) => {
                    self.state.lock().await.available.push_back(instance);
                    self.released.notify_one();
                }
                Err(e) => {
                    log::error!("Failed to backfill pool: {}", e);
                    self.unreserve_slot().await;
                    break;
                }
            }
        }
    }
}

/// Remove everything inside `dir`, keeping the directory itself.
pub(crate) async fn clear_dir(dir: &Path) -> Result<(), SandpitError> {
    open_permissions(dir).await?;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dir).await?;
            return open_permissions(dir).await;
        }
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

/// The unprivileged run user must be able to write the private directory.
pub(crate) async fn open_permissions(dir: &Path) -> Result<(), SandpitError> {
    set_mode(dir, 0o777).await
}

#[cfg(unix)]
pub(crate) async fn set_mode(path: &Path, mode: u32) -> Result<(), SandpitError> {
    use std::os::unix::fs::PermissionsExt;
    match tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
pub(crate) async fn set_mode(_path: &Path, _mode: u32) -> Result<(), SandpitError> {
    Ok(())
}
