pub mod fake_runtime;
pub mod mock_webhook;

use std::sync::Arc;
use tempfile::TempDir;

use crate::config::{EngineConfig, PoolConfig};
use crate::pool::Pool;
use fake_runtime::FakeRuntime;

/// Pool settings sized for tests: no warm instances, quick polling, and a
/// work root under `dir`.
pub fn test_pool_config(dir: &TempDir, max_size: usize) -> PoolConfig {
    PoolConfig {
        min_size: 0,
        max_size,
        acquire_poll_ms: 5,
        work_root: dir.path().join("instances"),
        ..PoolConfig::default()
    }
}

pub fn test_engine_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pool = test_pool_config(dir, 2);
    config.execution.async_cleanup = false;
    config.execution.acquire_timeout_ms = 500;
    config.scheduler.workers = 2;
    config.callbacks.initial_backoff_ms = 10;
    config
}

pub fn test_pool(dir: &TempDir, runtime: Arc<FakeRuntime>, max_size: usize) -> Arc<Pool> {
    Pool::new(runtime, test_pool_config(dir, max_size))
}
