//! Bounded per-node fan-out
//!
//! Operations that touch every node (log collection, patch installation,
//! binary replacement) run through a [`WorkerPool`]. All workers are joined
//! before the caller continues; nothing keeps running in the background.

use std::future::Future;

use futures::stream::{self, StreamExt};
use tracing::{error, info};

use crate::error::{Error, Result};

/// Default number of nodes handled concurrently
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Outcome for one node of a settled fan-out.
#[derive(Debug)]
pub struct NodeOutcome<T> {
    /// Node the work ran against
    pub node: String,
    /// What happened
    pub result: Result<T>,
}

/// Runs one async job per node with a concurrency limit.
#[derive(Clone, Copy, Debug)]
pub struct WorkerPool {
    limit: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl WorkerPool {
    /// Pool running at most `limit` jobs at once (at least one)
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// Run `job` for every node and report each outcome.
    ///
    /// Outcomes are returned in the order of `nodes`.
    pub async fn run_settled<T, F, Fut>(
        &self,
        nodes: &[String],
        job: F,
    ) -> Vec<NodeOutcome<T>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let owned: Vec<(usize, String)> = nodes.iter().cloned().enumerate().collect();
        let mut outcomes: Vec<(usize, NodeOutcome<T>)> = stream::iter(owned)
            .map(|(index, node)| {
                let fut = job(node.clone());
                async move {
                    let result = fut.await;
                    (index, NodeOutcome { node, result })
                }
            })
            .buffer_unordered(self.limit)
            .collect()
            .await;
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Run `job` for every node; fail with [`Error::NodeFailures`] if any failed.
    ///
    /// Every job runs to completion before the aggregate error is returned.
    pub async fn run_all<T, F, Fut>(&self, operation: &str, nodes: &[String], job: F) -> Result<Vec<T>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        info!(operation = %operation, nodes = nodes.len(), "Running on all nodes");
        let outcomes = self.run_settled(nodes, job).await;

        let mut values = Vec::with_capacity(outcomes.len());
        let mut failed = Vec::new();
        let mut first = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(value) => values.push(value),
                Err(e) => {
                    error!(operation = %operation, node = %outcome.node, error = %e, "Node operation failed");
                    failed.push(outcome.node);
                    first.get_or_insert(e);
                }
            }
        }

        match first {
            None => Ok(values),
            Some(first) => Err(Error::NodeFailures {
                operation: operation.to_string(),
                failed,
                first: Box::new(first),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.1.0.{}", i + 4)).collect()
    }

    #[tokio::test]
    async fn all_jobs_are_joined_and_results_keep_node_order() {
        let pool = WorkerPool::new(2);
        let out = pool
            .run_all("hostname", &nodes(4), |node| async move { Ok(node.len()) })
            .await
            .unwrap();
        assert_eq!(out.len(), 4);
    }

    fn assert_send<T: Send>(_: T) {}

    #[test]
    fn fan_out_futures_can_cross_threads() {
        let nodes = nodes(3);
        assert_send(WorkerPool::default().run_all("hostname", &nodes, |node| async move {
            Ok(node)
        }));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_limit() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        pool.run_all("collect logs", &nodes(6), |_| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn when_some_nodes_fail_every_job_still_finishes_and_failures_are_named() {
        let pool = WorkerPool::new(3);
        let finished = Arc::new(AtomicUsize::new(0));

        let err = pool
            .run_all("install patches", &nodes(4), |node| {
                let finished = finished.clone();
                async move {
                    finished.fetch_add(1, Ordering::SeqCst);
                    if node.ends_with(".5") || node.ends_with(".7") {
                        Err(Error::ConnectionFailed {
                            target: node,
                            message: "Connection refused".to_string(),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(finished.load(Ordering::SeqCst), 4);
        match &err {
            Error::NodeFailures { failed, .. } => {
                assert_eq!(failed, &vec!["10.1.0.5".to_string(), "10.1.0.7".to_string()])
            }
            other => panic!("expected NodeFailures, got {:?}", other),
        }
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn settled_reports_each_node() {
        let outcomes = WorkerPool::default()
            .run_settled(&nodes(2), |node| async move {
                if node.ends_with(".4") {
                    Ok(())
                } else {
                    Err(Error::command_failed("tar failed"))
                }
            })
            .await;
        assert_eq!(outcomes[0].node, "10.1.0.4");
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
    }
}
