use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::batch_context::BatchContext;
use crate::client::{EmbeddingClient, PushAck};

/// Training steps of one worker.
///
/// Pushes of step N are finished, or have failed, before any pull of step N + 1 is sent. A push
/// dispatched by `push_async` is awaited by the next `pull` or `flush`, and its error is returned
/// there. Pending pushes belong to the client, dropping the session does not lose them.
pub struct WorkerSession {
    client: Arc<EmbeddingClient>,
    step: u64,
}

impl WorkerSession {
    pub fn new(client: Arc<EmbeddingClient>) -> Self {
        Self { client, step: 0 }
    }

    #[inline]
    pub fn step(&self) -> u64 {
        self.step
    }

    #[inline]
    pub fn client(&self) -> Arc<EmbeddingClient> {
        self.client.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.client.pending_pushes()
    }

    /// Pull embeddings of current step, after all pending pushes are done.
    pub async fn pull(&mut self, varname: &str, ids: &[u64]) -> Result<BatchContext> {
        let dim = self.client.dim(varname)?;
        let vectors = self.client.pull(varname, ids, self.step).await?;

        BatchContext::new(self.step, varname, dim, ids.to_vec(), vectors)
    }

    /// Push gradients of the batch and wait for the result.
    pub async fn push(&mut self, ctx: BatchContext, grads: &[f32]) -> Result<PushAck> {
        ctx.check_grads(grads)?;

        self.client
            .push(ctx.varname(), ctx.ids(), grads, ctx.step())
            .await
    }

    /// Dispatch the push in background.
    pub fn push_async(&mut self, ctx: BatchContext, grads: Vec<f32>) -> Result<()> {
        ctx.check_grads(&grads)?;

        self.client
            .push_in_background(ctx.varname(), ctx.ids(), &grads, ctx.step())
    }

    /// Wait all pending pushes. The first error is returned after all of them finish.
    pub async fn flush(&mut self) -> Result<PushAck> {
        self.client.flush().await
    }

    /// Go to next step.
    pub fn next_step(&mut self) -> u64 {
        self.step += 1;
        self.step
    }

    /// Drop the pulled results of current step and go to next step. Pushes already dispatched are
    /// still awaited by the next pull or flush.
    pub fn abort_step(&mut self, contexts: Vec<BatchContext>) -> u64 {
        info!(
            "abort step {}, drop {} batch contexts, pending pushes: {}",
            self.step,
            contexts.len(),
            self.client.pending_pushes(),
        );

        drop(contexts);
        self.next_step()
    }
}
