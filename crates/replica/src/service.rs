//! Typed invocation channel to replicas.

use crate::error::ReplicaError;
use crate::messages::{ReplicaRequest, ReplicaResponse};
use async_trait::async_trait;

/// Sends a typed request to a named replica node.
#[async_trait]
pub trait ReplicaService: Send + Sync {
    async fn invoke(
        &self,
        node: &str,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaError>;
}
