//! 🧵 Workers: the ones who actually do the work while the job handle takes
//! all the credit in the sprint retro.
//!
//! Each runner (write batcher, query batcher, bulk data service) spawns a
//! fixed crew of workers. A worker owns its slice of the job, runs until its
//! input is exhausted or the job is interrupted, and reports back through its
//! `JoinHandle`. The job handle joins the crew and decides the final phase.

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{Error, Result};

/// 🏗️ A background worker, that does work. duh.
#[async_trait]
pub(crate) trait Worker: Sized + Send + 'static {
    /// 📊 What the worker hands back when it is done.
    type Report: Send + 'static;

    /// 🔄 The whole life of the worker.
    async fn work(self) -> Result<Self::Report>;

    /// 🚀 Spawn it onto the runtime.
    fn start(self) -> JoinHandle<Result<Self::Report>> {
        tokio::spawn(self.work())
    }
}

/// 🧺 Join every worker. All of them are awaited even when one fails, and the
/// first failure (in spawn order) wins.
///
/// A worker that panicked takes the caller down with it. That is a bug, not an outcome.
pub(crate) async fn join_crew<R>(handles: Vec<JoinHandle<Result<R>>>) -> Result<Vec<R>> {
    let mut reports = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for joined in join_all(handles).await {
        match joined {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(err)) => {
                warn!("💀 worker stopped with an error: {}", err);
                first_error.get_or_insert(err);
            }
            Err(join_error) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            Err(_) => {
                first_error.get_or_insert(Error::Cancelled);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(reports),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(u32);

    #[async_trait]
    impl Worker for Countdown {
        type Report = u32;

        async fn work(self) -> Result<u32> {
            if self.0 == 13 {
                return Err(Error::Topology("unlucky".into()));
            }
            Ok(self.0 * 2)
        }
    }

    #[tokio::test]
    async fn the_one_where_the_crew_reports_in_spawn_order() {
        let reports = join_crew(vec![Countdown(1).start(), Countdown(2).start()])
            .await
            .expect("💀 a perfectly healthy crew failed");
        assert_eq!(reports, vec![2, 4]);
    }

    #[tokio::test]
    async fn the_one_where_one_bad_apple_spoils_the_join() {
        let err = join_crew(vec![Countdown(1).start(), Countdown(13).start()])
            .await
            .expect_err("💀 the unlucky worker went unnoticed");
        assert!(matches!(err, Error::Topology(_)));
    }
}
