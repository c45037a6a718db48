//! Hand a workflow step to the sub-agent manager

use async_trait::async_trait;
use conduit_foundation::Result;
use conduit_task::{SubAgentManager, SubAgentResult, SubAgentTask};
use tokio_util::sync::CancellationToken;

/// Runs a delegated workflow step
#[async_trait]
pub trait TaskDelegator: Send + Sync {
    /// Run `task` on `agent` when named, otherwise on whichever agent the
    /// router picks
    async fn delegate_task(
        &self,
        ctx: CancellationToken,
        task: SubAgentTask,
        agent: Option<&str>,
    ) -> Result<SubAgentResult>;
}

#[async_trait]
impl TaskDelegator for SubAgentManager {
    async fn delegate_task(
        &self,
        ctx: CancellationToken,
        task: SubAgentTask,
        agent: Option<&str>,
    ) -> Result<SubAgentResult> {
        match agent {
            Some(name) => self.execute(ctx, task, name).await,
            None => self.delegate(ctx, task).await,
        }
    }
}
