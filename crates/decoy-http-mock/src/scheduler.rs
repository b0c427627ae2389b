//! Task scheduling with a cooperative `synchronous` escape hatch.
//!
//! The worker pool is the tokio runtime: `synchronous=false` hands the task
//! to `tokio::spawn`, `synchronous=true` runs it inline so the caller only
//! returns once the task (and its delay) has completed. Tasks are never
//! rejected.

use crate::error::ClientError;
use crate::model::{Delay, HttpResponse};
use crate::proxy::client::PendingResponse;
use std::future::Future;

#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Sleep for `delay`, then run `task`.
    pub async fn schedule<F>(&self, delay: Delay, synchronous: bool, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if synchronous {
            if !delay.is_zero() {
                tokio::time::sleep(delay.to_duration()).await;
            }
            task.await;
        } else {
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay.to_duration()).await;
                }
                task.await;
            });
        }
    }

    /// Run `task` now.
    pub async fn submit<F>(&self, synchronous: bool, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Delay::none(), synchronous, task).await;
    }

    /// Run `continuation` with the outcome of `pending` once it completes.
    /// With `synchronous=true` the caller blocks on the completion.
    pub async fn submit_on_complete<C, F>(
        &self,
        pending: PendingResponse,
        synchronous: bool,
        continuation: C,
    ) where
        C: FnOnce(Result<Option<HttpResponse>, ClientError>) -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        if synchronous {
            let outcome = pending.await;
            continuation(outcome).await;
        } else {
            tokio::spawn(async move {
                let outcome = pending.await;
                continuation(outcome).await;
            });
        }
    }
}
