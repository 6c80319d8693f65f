//! In-process worker entrypoints

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use runtime_core::{Collective, Result, WorkerContext};

/// The job body run by every rank of a [`TaskGroup`](crate::TaskGroup)
#[async_trait]
pub trait WorkerFn: Send + Sync + 'static {
    async fn run(&self, ctx: WorkerContext, collective: Arc<dyn Collective>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> WorkerFn for F
where
    F: Fn(WorkerContext, Arc<dyn Collective>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self, ctx: WorkerContext, collective: Arc<dyn Collective>) -> Result<()> {
        (self)(ctx, collective).await
    }
}
