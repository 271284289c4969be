//! Tests for the runtime instance pool

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::test_utils::fake_runtime::FakeRuntime;
    use crate::test_utils::{test_pool, test_pool_config};
    use std::collections::HashSet;
    use tempfile::TempDir;

    async fn assert_bounds(pool: &Pool) {
        let stats = pool.statistics().await;
        assert!(
            stats.available + stats.busy <= stats.total,
            "available {} + busy {} > total {}",
            stats.available,
            stats.busy,
            stats.total
        );
        assert!(stats.total <= pool.config().max_size);
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let pool = test_pool(&dir, runtime.clone(), 2);

        let first = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.use_count, 1);
        assert!(first.host_dir.exists());
        assert!(pool.release(&first.id).await);

        let second = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.use_count, 2);

        let stats = pool.statistics().await;
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);
        assert_eq!(stats.busy, 1);
        assert_eq!(runtime.created_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, FakeRuntime::new(), 2);

        let attempts = (0..3).map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_millis(50)).await })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let succeeded: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let timed_out = results
            .iter()
            .filter(|r| matches!(r, Err(SandpitError::AcquireTimeout(_))))
            .count();

        assert_eq!(succeeded.len(), 2);
        assert_eq!(timed_out, 1);
        assert_ne!(succeeded[0].id, succeeded[1].id);

        let stats = pool.statistics().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.timeouts, 1);
        assert_bounds(&pool).await;
    }

    #[tokio::test]
    async fn test_waiter_gets_released_instance() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, FakeRuntime::new(), 1);

        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pool.release(&held.id).await);

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id, held.id);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_share_an_instance() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, FakeRuntime::new(), 3);
        let in_use = Arc::new(std::sync::Mutex::new(HashSet::new()));

        let workers = (0..12).map(|_| {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            tokio::spawn(async move {
                for _ in 0..5 {
                    let instance = pool.acquire(Duration::from_secs(5)).await.unwrap();
                    assert!(
                        in_use.lock().unwrap().insert(instance.id.clone()),
                        "instance {} handed out twice",
                        instance.id
                    );
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_use.lock().unwrap().remove(&instance.id);
                    assert!(pool.release(&instance.id).await);
                }
            })
        });
        for joined in join_all(workers).await {
            joined.unwrap();
        }

        let stats = pool.statistics().await;
        assert_eq!(stats.busy, 0);
        assert!(stats.total <= 3);
        assert_eq!(stats.requests, 60);
        assert_eq!(stats.hits + stats.misses, 60);
    }

    #[tokio::test]
    async fn test_double_release_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, FakeRuntime::new(), 2);

        let instance = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(pool.release(&instance.id).await);
        let before = pool.statistics().await;

        assert!(!pool.release(&instance.id).await);
        assert!(!pool.release("never-existed").await);

        assert_eq!(pool.statistics().await, before);
        assert_eq!(before.total, 1);
        assert_eq!(before.available, 1);
    }

    #[tokio::test]
    async fn test_instance_at_max_uses_is_destroyed_on_release() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_pool_config(&dir, 2);
        config.max_uses = 2;
        let pool = Pool::new(runtime.clone(), config);

        let first = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(&first.id).await;
        let again = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.use_count, 2);
        pool.release(&again.id).await;

        let stats = pool.statistics().await;
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total, 0);
        assert_eq!(runtime.removed(), vec![first.id.clone()]);
        assert!(!first.host_dir.exists());

        let fresh = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_ne!(fresh.id, first.id);
    }

    #[tokio::test]
    async fn test_release_empties_private_directory() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, FakeRuntime::new(), 1);

        let instance = pool.acquire(Duration::from_millis(50)).await.unwrap();
        std::fs::write(instance.host_dir.join("main.c"), "int main(){}").unwrap();
        std::fs::create_dir_all(instance.host_dir.join("nested/deeper")).unwrap();
        pool.release(&instance.id).await;

        assert!(instance.host_dir.exists());
        assert_eq!(std::fs::read_dir(&instance.host_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_instance_is_never_handed_out() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let pool = test_pool(&dir, runtime.clone(), 2);

        let instance = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(&instance.id).await;
        runtime.crash(&instance.id);

        let replacement = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_ne!(replacement.id, instance.id);
        assert!(runtime.removed().contains(&instance.id));
        assert_eq!(pool.statistics().await.total, 1);
    }

    #[tokio::test]
    async fn test_failed_creation_surfaces_as_timeout() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        runtime.set_fail_creates(true);
        let pool = test_pool(&dir, runtime, 2);

        let err = pool.acquire(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, SandpitError::AcquireTimeout(_)));
        assert!(err.is_retryable());
        assert_eq!(pool.statistics().await.total, 0);
    }

    #[tokio::test]
    async fn test_health_check_replaces_dead_instances() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_pool_config(&dir, 4);
        config.min_size = 2;
        let pool = Pool::new(runtime.clone(), config);
        pool.warm_up().await;
        assert_eq!(pool.statistics().await.available, 2);

        let victim = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(&victim.id).await;
        runtime.crash(&victim.id);

        pool.health_check().await;

        let stats = pool.statistics().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.available, 2);
        assert!(runtime.removed().contains(&victim.id));
        assert_eq!(runtime.created_count(), 3);
    }

    #[tokio::test]
    async fn test_busy_instance_failing_health_check_is_destroyed_on_release() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let pool = test_pool(&dir, runtime.clone(), 2);

        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(held.healthy);
        runtime.crash(&held.id);

        pool.health_check().await;
        assert_eq!(pool.statistics().await.busy, 1);
        assert!(!runtime.removed().contains(&held.id));

        assert!(pool.release(&held.id).await);
        let stats = pool.statistics().await;
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total, 0);
        assert!(runtime.removed().contains(&held.id));
    }

    #[tokio::test]
    async fn test_adjust_size_scales_up_when_idle_capacity_is_low() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, FakeRuntime::new(), 10);

        pool.adjust_size().await;
        let stats = pool.statistics().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.available, 3);
    }

    #[tokio::test]
    async fn test_adjust_size_scales_down_surplus() {
        let dir = TempDir::new().unwrap();
        let mut config = test_pool_config(&dir, 10);
        config.min_size = 1;
        let pool = Pool::new(FakeRuntime::new(), config);

        let held: Vec<_> = join_all((0..6).map(|_| pool.acquire(Duration::from_millis(100))))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        for instance in &held {
            pool.release(&instance.id).await;
        }
        assert_eq!(pool.statistics().await.available, 6);

        // At most three per pass, never below min_size.
        pool.adjust_size().await;
        assert_eq!(pool.statistics().await.total, 3);
        pool.adjust_size().await;
        assert_eq!(pool.statistics().await.total, 1);
        assert_bounds(&pool).await;
    }

    #[tokio::test]
    async fn test_sweep_expired_destroys_idle_instances_and_backfills() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_pool_config(&dir, 4);
        config.min_size = 1;
        config.max_idle_ms = 20;
        let pool = Pool::new(runtime.clone(), config);
        pool.warm_up().await;
        let original = runtime.created_count();

        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.sweep_expired().await;

        let stats = pool.statistics().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.available, 1);
        assert_eq!(runtime.removed().len(), original);
        assert_eq!(runtime.created_count(), original + 1);
    }

    #[tokio::test]
    async fn test_init_warms_pool_and_shutdown_destroys_everything() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let mut config = test_pool_config(&dir, 4);
        config.min_size = 3;
        let pool = Pool::new(runtime.clone(), config);

        pool.init().await.unwrap();
        assert_eq!(pool.statistics().await.available, 3);

        let busy = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.shutdown().await;

        let stats = pool.statistics().await;
        assert_eq!(stats.total, 0);
        assert_eq!(stats.available + stats.busy, 0);
        assert_eq!(runtime.removed().len(), 3);
        assert!(!pool.release(&busy.id).await);
        assert!(pool.acquire(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_init_requires_image() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        runtime.set_image_present(false);
        let pool = test_pool(&dir, runtime, 2);

        assert!(matches!(pool.init().await, Err(SandpitError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_network_profiles_are_kept_apart() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, FakeRuntime::new(), 2);

        let offline = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(&offline.id).await;

        let online = pool
            .acquire_with(
                Duration::from_millis(50),
                InstanceProfile {
                    network_enabled: true,
                },
            )
            .await
            .unwrap();
        assert_ne!(online.id, offline.id);
        assert!(online.network_enabled);
    }
}
