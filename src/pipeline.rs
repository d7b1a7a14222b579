//! Aggregation pipeline: fan out every applicable reader over a batch,
//! wait for all of them, combine what succeeded.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::candidate::{find_candidates, Candidate};
use crate::source::{Engines, InputItem, SourceError, SourceReader};

/// Lifecycle signals emitted to the caller of [`AggregationPipeline::run_observed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    InProgress,
    Complete(Vec<Candidate>),
}

/// Extraction pipeline orchestrator.
#[derive(Clone)]
pub struct AggregationPipeline {
    engines: Engines,
}

/// One fanned-out unit of work, labelled for logs.
struct Task {
    label: String,
    reader: &'static str,
    handle: JoinHandle<Result<Vec<Candidate>, SourceError>>,
}

impl AggregationPipeline {
    pub fn new(engines: Engines) -> Self {
        Self { engines }
    }

    /// Run the batch and return the combined candidates.
    pub async fn run(&self, items: Vec<InputItem>, extra_text: &str) -> Vec<Candidate> {
        self.run_observed(items, extra_text, |_| {}).await
    }

    /// Run the batch, reporting `InProgress` once up front and `Complete` once at the end.
    ///
    /// Every (item, applicable reader) pair runs concurrently. Failed or
    /// panicked tasks contribute nothing and never cancel the others.
    /// Results are combined in item order, then reader order, with the
    /// matches over `extra_text` appended last.
    pub async fn run_observed<F>(&self, items: Vec<InputItem>, extra_text: &str, mut observe: F) -> Vec<Candidate>
    where
        F: FnMut(PipelineStatus),
    {
        observe(PipelineStatus::InProgress);
        info!("Pipeline: starting batch of {} items", items.len());

        let mut tasks = Vec::new();
        for item in items.into_iter().map(Arc::new) {
            for reader in SourceReader::applicable(&item) {
                let engines = self.engines.clone();
                let task_item = Arc::clone(&item);
                tasks.push(Task {
                    label: item.label().to_string(),
                    reader: reader.name(),
                    handle: tokio::spawn(async move { reader.read(&task_item, &engines).await }),
                });
            }
        }

        let extra = extra_text.to_string();
        let extra_task: JoinHandle<Vec<Candidate>> = tokio::spawn(async move { find_candidates(&extra) });

        let mut combined = Vec::new();
        for task in tasks {
            match task.handle.await {
                Ok(Ok(found)) => {
                    debug!("{} [{}]: {} candidates", task.label, task.reader, found.len());
                    combined.extend(found);
                }
                Ok(Err(e)) => warn!("{} [{}]: {}", task.label, task.reader, e),
                Err(e) => warn!("{} [{}]: task failed: {}", task.label, task.reader, e),
            }
        }

        match extra_task.await {
            Ok(found) => combined.extend(found),
            Err(e) => warn!("extra text: task failed: {}", e),
        }

        info!("Pipeline: batch complete with {} candidates", combined.len());
        observe(PipelineStatus::Complete(combined.clone()));
        combined
    }
}
