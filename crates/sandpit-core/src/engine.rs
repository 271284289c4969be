//! Engine facade wiring the pool, orchestrator and scheduler together.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::constraints::ConstraintCompiler;
use crate::errors::SandpitError;
use crate::executor::{ExecutionResult, Orchestrator};
use crate::language::{LanguageDescriptor, LanguageRegistry, StaticLanguageRegistry};
use crate::notifier::{Notifier, WebhookNotifier};
use crate::pool::{Pool, PoolStatistics};
use crate::runtime::ContainerRuntime;
use crate::scheduler::{JobStatus, QueueStatistics, Scheduler, WorkerQueue};
use crate::submission::{
    InMemorySubmissionStore, Submission, SubmissionRequest, SubmissionStore, SubmissionView,
};

pub struct Engine {
    pool: Arc<Pool>,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn SubmissionStore>,
    registry: Arc<dyn LanguageRegistry>,
    compiler: ConstraintCompiler,
    max_bundle_bytes: u64,
}

pub struct EngineBuilder {
    config: EngineConfig,
    runtime: Arc<dyn ContainerRuntime>,
    store: Option<Arc<dyn SubmissionStore>>,
    registry: Option<Arc<dyn LanguageRegistry>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl EngineBuilder {
    pub fn with_store(mut self, store: Arc<dyn SubmissionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn LanguageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Result<Engine, SandpitError> {
        let config = self.config;
        config.validate()?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => Self::configure_registry(&config)?,
        };
        let notifier = match self.notifier {
            Some(notifier) => Some(notifier),
            None => Self::configure_notifier(&config)?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemorySubmissionStore::new()));

        let run_user = config
            .execution
            .run_user
            .split(':')
            .next()
            .filter(|user| !user.is_empty())
            .map(str::to_string);
        let pool = Pool::with_run_user(Arc::clone(&self.runtime), config.pool.clone(), run_user);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&pool),
            self.runtime,
            config.execution.clone(),
        ));
        let scheduler = Scheduler::new(
            Arc::new(WorkerQueue::new(config.scheduler.queue_capacity)),
            Arc::clone(&store),
            orchestrator,
            Arc::clone(&registry),
            notifier,
            config.scheduler.workers,
        );

        Ok(Engine {
            pool,
            scheduler,
            store,
            registry,
            compiler: ConstraintCompiler::new(config.limits.clone()),
            max_bundle_bytes: config.execution.max_extract_bytes,
        })
    }

    fn configure_registry(config: &EngineConfig) -> Result<Arc<dyn LanguageRegistry>, SandpitError> {
        match &config.languages {
            Some(languages) => {
                for language in languages {
                    language.validate()?;
                }
                log::info!("Using {} configured languages", languages.len());
                Ok(Arc::new(StaticLanguageRegistry::new(languages.clone())))
            }
            None => Ok(Arc::new(StaticLanguageRegistry::builtin())),
        }
    }

    fn configure_notifier(config: &EngineConfig) -> Result<Option<Arc<dyn Notifier>>, SandpitError> {
        if !config.callbacks.enabled {
            log::info!("Webhook callbacks are disabled");
            return Ok(None);
        }
        let notifier = WebhookNotifier::new(config.callbacks.clone())?;
        Ok(Some(Arc::new(notifier)))
    }
}

impl Engine {
    pub fn builder(config: EngineConfig, runtime: Arc<dyn ContainerRuntime>) -> EngineBuilder {
        EngineBuilder {
            config,
            runtime,
            store: None,
            registry: None,
            notifier: None,
        }
    }

    /// Warm the pool, start the workers and pick up submissions left
    /// pending by a previous run.
    pub async fn start(&self) -> Result<(), SandpitError> {
        self.pool.init().await?;
        self.scheduler.start().await;
        self.scheduler.recover().await?;
        Ok(())
    }

    /// Validate a request and store it as a queued submission.
    pub async fn create_submission(&self, request: SubmissionRequest) -> Result<String, SandpitError> {
        let language = self.registry.resolve(request.language_id)?;
        let submission = Submission::create(request, &language, &self.compiler, self.max_bundle_bytes)?;
        let token = submission.token.clone();
        self.store.insert(submission).await?;
        log::debug!("Created submission {} ({})", token, language.name);
        Ok(token)
    }

    pub async fn schedule_async(&self, token: &str) -> Result<ExecutionResult, SandpitError> {
        self.scheduler.schedule_async(token).await
    }

    pub async fn schedule_delayed(
        &self,
        token: &str,
        delay: Duration,
    ) -> Result<ExecutionResult, SandpitError> {
        self.scheduler.schedule_delayed(token, delay).await
    }

    pub async fn execute_sync(&self, token: &str) -> Result<ExecutionResult, SandpitError> {
        self.scheduler.execute_sync(token).await
    }

    pub async fn cancel(&self, token: &str) -> bool {
        self.scheduler.cancel(token).await
    }

    pub async fn get_status(&self, token: &str) -> Result<SubmissionView, SandpitError> {
        self.store
            .load(token)
            .await?
            .map(|submission| submission.view())
            .ok_or_else(|| SandpitError::NotFound(format!("submission {}", token)))
    }

    pub async fn job_status(&self, token: &str) -> JobStatus {
        self.scheduler.job_status(token).await
    }

    pub async fn queue_statistics(&self) -> QueueStatistics {
        self.scheduler.statistics().await
    }

    pub async fn pool_statistics(&self) -> PoolStatistics {
        self.pool.statistics().await
    }

    pub fn languages(&self) -> Vec<LanguageDescriptor> {
        self.registry.list()
    }

    pub async fn shutdown(&self) {
        log::info!("Shutting down engine");
        self.scheduler.shutdown().await;
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::FileSystemAccess;
    use crate::status::Status;
    use crate::test_utils::fake_runtime::{ok_output, run_result, FakeRuntime, Script};
    use crate::test_utils::test_engine_config;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, runtime: Arc<FakeRuntime>) -> Engine {
        Engine::builder(test_engine_config(dir), runtime)
            .build()
            .unwrap()
    }

    fn hello(language_id: u32) -> SubmissionRequest {
        SubmissionRequest {
            language_id,
            source_code: Some("print('hi')".to_string()),
            expected_output: Some("hi".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_execute_sync() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::with_behavior(|script, path| match script {
            Script::Run => run_result(path, "hi\n", 0),
            _ => ok_output(""),
        });
        let engine = engine(&dir, runtime);
        engine.start().await.unwrap();

        let token = engine.create_submission(hello(71)).await.unwrap();
        assert_eq!(engine.get_status(&token).await.unwrap().status, Status::Queued);

        let result = engine.execute_sync(&token).await.unwrap();
        assert_eq!(result.status, Status::Accepted);

        let view = engine.get_status(&token).await.unwrap();
        assert_eq!(view.status, Status::Accepted);
        assert_eq!(view.stdout.as_deref(), Some("hi\n"));
        assert!(view.finished_at.is_some());

        let stats = engine.pool_statistics().await;
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.busy, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_async_flow_through_the_engine() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, FakeRuntime::new());
        engine.start().await.unwrap();

        let token = engine.create_submission(hello(71)).await.unwrap();
        let queued = engine.schedule_async(&token).await.unwrap();
        assert_eq!(queued.status, Status::Queued);

        let mut view = engine.get_status(&token).await.unwrap();
        for _ in 0..200 {
            if view.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            view = engine.get_status(&token).await.unwrap();
        }
        // The default fake prints nothing.
        assert_eq!(view.status, Status::WrongAnswer);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_requests_never_reach_the_pool() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let engine = engine(&dir, runtime.clone());

        let err = engine.create_submission(hello(9999)).await.unwrap_err();
        assert!(matches!(err, SandpitError::UnsupportedLanguage(_)));

        let mut request = hello(71);
        request.constraints.cpu_time_limit = Some(1_000.0);
        let err = engine.create_submission(request).await.unwrap_err();
        assert!(matches!(err, SandpitError::Validation(_)));

        let mut request = hello(71);
        request.compiler_options = Some("-O2; rm -rf /".to_string());
        let err = engine.create_submission(request).await.unwrap_err();
        assert!(matches!(err, SandpitError::Validation(_)));

        let mut request = hello(71);
        request.constraints.enable_network = Some(true);
        let err = engine.create_submission(request).await.unwrap_err();
        assert!(matches!(err, SandpitError::Validation(_)));

        assert_eq!(runtime.created_count(), 0);
        assert_eq!(engine.pool_statistics().await.requests, 0);
    }

    #[tokio::test]
    async fn test_unknown_token_lookups() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, FakeRuntime::new());

        assert!(matches!(
            engine.get_status("nope").await,
            Err(SandpitError::NotFound(_))
        ));
        assert!(matches!(
            engine.execute_sync("nope").await,
            Err(SandpitError::NotFound(_))
        ));
        assert_eq!(engine.job_status("nope").await, JobStatus::NotFound);
        assert!(!engine.cancel("nope").await);
    }

    #[tokio::test]
    async fn test_configured_languages_replace_builtins() {
        let dir = TempDir::new().unwrap();
        let mut config = test_engine_config(&dir);
        config.languages = Some(vec![LanguageDescriptor {
            id: 1,
            name: "Lua".to_string(),
            source_file: "main.lua".to_string(),
            compile_cmd: None,
            run_cmd: "lua main.lua".to_string(),
            default_time_limit: Some(1.0),
            default_memory_limit: None,
            is_archived: false,
        }]);
        let engine = Engine::builder(config, FakeRuntime::new()).build().unwrap();

        let languages = engine.languages();
        assert_eq!(languages.len(), 1);
        assert_eq!(languages[0].name, "Lua");
        assert!(engine.create_submission(hello(71)).await.is_err());
    }

    #[tokio::test]
    async fn test_start_recovers_stored_submissions() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemorySubmissionStore::new());
        let first = Engine::builder(test_engine_config(&dir), FakeRuntime::new())
            .with_store(store.clone())
            .build()
            .unwrap();
        let mut request = hello(71);
        request.constraints.filesystem = Some(FileSystemAccess::ReadWrite);
        let token = first.create_submission(request).await.unwrap();

        let second = Engine::builder(test_engine_config(&dir), FakeRuntime::new())
            .with_store(store)
            .build()
            .unwrap();
        second.start().await.unwrap();

        for _ in 0..200 {
            if second.get_status(&token).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(second.get_status(&token).await.unwrap().status.is_terminal());
        second.shutdown().await;
    }
}
