//! Durable work queue trait definition.
//!
//! At-least-once delivery with leases: a dequeued item stays invisible until
//! it is acknowledged or its lease expires. Duplicate deliveries are made
//! harmless by the run's `step_seq` guard.

use std::time::Duration;

use stepflow_types::error::RepositoryError;
use stepflow_types::run::WorkItem;
use uuid::Uuid;

pub trait WorkQueue: Send + Sync {
    fn enqueue(
        &self,
        item: &WorkItem,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Lease the oldest visible item for `lease`, incrementing its delivery count.
    fn dequeue(
        &self,
        lease: Duration,
    ) -> impl std::future::Future<Output = Result<Option<WorkItem>, RepositoryError>> + Send;

    /// Push the lease of a delivered item to `lease` from now. Long-running
    /// steps call this so the item is not redelivered while still executing.
    fn extend_lease(
        &self,
        item_id: &Uuid,
        lease: Duration,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove a processed item.
    fn ack(
        &self,
        item_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Release the lease and make the item visible again after `delay`.
    fn nack(
        &self,
        item_id: &Uuid,
        delay: Duration,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Number of items currently stored (leased or not).
    fn depth(&self) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
