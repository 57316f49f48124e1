//! Applies a mutation's fan-out to the cache backend.
//!
//! Called by the write path after the data-store mutation commits and before
//! the response is sent. Tags are invalidated one by one; tags that fail are
//! retried with backoff, and only those tags are re-issued. When retries run
//! out the failure is logged and the write still succeeds, leaving TTL expiry
//! as the bound on staleness for the tags that could not be reached.

use std::collections::BTreeSet;
use std::sync::Arc;

use canopy_core::{CanopyResult, ResourceMutationEvent, RetryPolicy};
use serde::Serialize;

use super::graph::InvalidationGraph;
use crate::backend::CacheBackend;
use crate::tag::Tag;

/// What one dispatch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    /// Canonical strings of the resolved fan-out.
    pub tags: BTreeSet<String>,
    /// Entries the backend reported dropped, summed over all tags.
    pub dropped: u64,
    /// Rounds issued, the first one included.
    pub attempts: u32,
    /// Tags still not invalidated when retries ran out.
    pub failed_tags: BTreeSet<String>,
}

impl InvalidationReport {
    /// True when every resolved tag was invalidated.
    pub fn is_complete(&self) -> bool {
        self.failed_tags.is_empty()
    }
}

/// Resolves mutation events and invalidates their tags.
pub struct InvalidationDispatcher<B: CacheBackend + ?Sized> {
    backend: Arc<B>,
    graph: InvalidationGraph,
    retry: RetryPolicy,
}

impl<B: CacheBackend + ?Sized> Clone for InvalidationDispatcher<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            graph: self.graph,
            retry: self.retry.clone(),
        }
    }
}

impl<B: CacheBackend + ?Sized> InvalidationDispatcher<B> {
    pub fn new(backend: Arc<B>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            graph: InvalidationGraph::new(),
            retry,
        }
    }

    pub fn graph(&self) -> &InvalidationGraph {
        &self.graph
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Invalidate every tag in `event`'s fan-out.
    ///
    /// Returns `Err` only for a malformed event (see
    /// [`InvalidationGraph::resolve`]). Backend failures are retried and, if
    /// they persist, reported through [`InvalidationReport::failed_tags`].
    pub async fn invalidate(&self, event: &ResourceMutationEvent) -> CanopyResult<InvalidationReport> {
        let tags = self.graph.resolve(event).inspect_err(|error| {
            tracing::warn!(
                event_id = %event.event_id,
                resource_type = %event.resource_type,
                resource_id = %event.resource_id,
                error = %error,
                "mutation event rejected before fan-out"
            );
        })?;
        let report = self.invalidate_tags(&tags).await;

        if report.is_complete() {
            tracing::debug!(
                event_id = %event.event_id,
                resource_type = %event.resource_type,
                resource_id = %event.resource_id,
                operation = %event.operation,
                tags = ?report.tags,
                dropped = report.dropped,
                attempts = report.attempts,
                "invalidated mutation fan-out"
            );
        } else {
            tracing::error!(
                event = "persistent_invalidation_failure",
                event_id = %event.event_id,
                resource_type = %event.resource_type,
                resource_id = %event.resource_id,
                failed_tags = ?report.failed_tags,
                attempts = report.attempts,
                backend = self.backend.name(),
                "invalidation retries exhausted, relying on TTL expiry"
            );
        }
        Ok(report)
    }

    /// Invalidate an explicit tag set with the same retry rules.
    pub async fn invalidate_tags(&self, tags: &BTreeSet<Tag>) -> InvalidationReport {
        let mut pending: Vec<&Tag> = tags.iter().collect();
        let mut dropped = 0u64;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut failed = Vec::new();

            for tag in pending {
                match self.backend.invalidate_tag(tag).await {
                    Ok(count) => dropped += count,
                    Err(error) => {
                        tracing::warn!(
                            tag = %tag,
                            attempt = attempts,
                            error = %error,
                            "tag invalidation failed"
                        );
                        failed.push(tag);
                    }
                }
            }
            pending = failed;

            if pending.is_empty() || !self.retry.should_retry(attempts) {
                break;
            }
            tokio::time::sleep(self.retry.backoff.delay_for_attempt(attempts - 1)).await;
        }

        InvalidationReport {
            tags: tags.iter().map(Tag::encode).collect(),
            dropped,
            attempts,
            failed_tags: pending.into_iter().map(Tag::encode).collect(),
        }
    }
}
