use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::ErrorClass;

/// Why a provisioning attempt failed, as reported to the broker front end.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperationFailure {
    pub class: ErrorClass,

    /// The variant of the error that stopped provisioning, e.g. `CreateResource`.
    pub category: &'static str,

    /// The full error chain.
    pub message: String,
}

/// The final status of one provisioning attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperationCompletion {
    pub instance_id: String,
    pub result: Result<(), OperationFailure>,
}

impl OperationCompletion {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Receives the outcome of every provisioning attempt, exactly once per attempt.
#[async_trait]
pub trait OperationTracker: Send + Sync {
    async fn complete(&self, completion: OperationCompletion);
}

#[async_trait]
impl OperationTracker for UnboundedSender<OperationCompletion> {
    async fn complete(&self, completion: OperationCompletion) {
        let instance_id = completion.instance_id.clone();
        if self.send(completion).is_err() {
            tracing::warn!(
                instance_id = %instance_id,
                "operation tracker has shut down, dropping completion"
            );
        }
    }
}
