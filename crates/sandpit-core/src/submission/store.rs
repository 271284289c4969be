use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::Submission;
use crate::errors::SandpitError;

/// Persistence for submissions, keyed by token.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Store a new submission. Fails if the token already exists.
    async fn insert(&self, submission: Submission) -> Result<(), SandpitError>;

    async fn load(&self, token: &str) -> Result<Option<Submission>, SandpitError>;

    /// Overwrite a stored submission. Returns `false` without writing when the
    /// stored copy is already terminal, which makes repeated terminal writes
    /// harmless.
    async fn save(&self, submission: &Submission) -> Result<bool, SandpitError>;

    /// Submissions that have not reached a terminal status.
    async fn pending(&self) -> Result<Vec<Submission>, SandpitError>;

    async fn delete(&self, token: &str) -> Result<bool, SandpitError>;
}

#[derive(Default)]
pub struct InMemorySubmissionStore {
    submissions: RwLock<HashMap<String, Submission>>,
}

impl InMemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.submissions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.submissions.read().await.is_empty()
    }
}

#[async_trait]
impl SubmissionStore for InMemorySubmissionStore {
    async fn insert(&self, submission: Submission) -> Result<(), SandpitError> {
        let mut submissions = self.submissions.write().await;
        if submissions.contains_key(&submission.token) {
            return Err(SandpitError::internal(format!(
                "duplicate submission token {}",
                submission.token
            )));
        }
        submissions.insert(submission.token.clone(), submission);
        Ok(())
    }

    async fn load(&self, token: &str) -> Result<Option<Submission>, SandpitError> {
        Ok(self.submissions.read().await.get(token).cloned())
    }

    async fn save(&self, submission: &Submission) -> Result<bool, SandpitError> {
        let mut submissions = self.submissions.write().await;
        match submissions.get(&submission.token) {
            None => Err(SandpitError::NotFound(submission.token.clone())),
            Some(stored) if stored.is_terminal() => Ok(false),
            Some(_) => {
                submissions.insert(submission.token.clone(), submission.clone());
                Ok(true)
            }
        }
    }

    async fn pending(&self) -> Result<Vec<Submission>, SandpitError> {
        let submissions = self.submissions.read().await;
        let mut pending: Vec<Submission> = submissions
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.created_at);
        Ok(pending)
    }

    async fn delete(&self, token: &str) -> Result<bool, SandpitError> {
        Ok(self.submissions.write().await.remove(token).is_some())
    }
}
