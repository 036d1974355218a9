//! In-memory queue store
//!
//! Mirrors the PostgreSQL semantics, including the canonical dispatch
//! order, the keyset cursor, and the move-to-success/failure transfers.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CreateQueueJob, QueueCursor, QueueFailureRow, QueueJobRow, QueueStats, QueueSuccessRow,
};
use crate::store::QueueStore;

use super::InMemoryState;

/// In-memory implementation of [`QueueStore`].
#[derive(Clone)]
pub struct InMemoryQueueStore {
    state: Arc<InMemoryState>,
}

impl InMemoryQueueStore {
    pub fn new(state: Arc<InMemoryState>) -> Self {
        Self { state }
    }
}

/// Canonical dispatch order: `(priority desc, created_at asc, id asc)`.
fn dispatch_order(a: &QueueJobRow, b: &QueueJobRow) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Whether a job sorts strictly after the cursor position.
fn after_cursor(job: &QueueJobRow, cursor: &QueueCursor) -> bool {
    match job.priority.cmp(&cursor.priority) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => match job.created_at.cmp(&cursor.created_at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => job.id > cursor.id,
        },
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn submit(&self, job: CreateQueueJob) -> Result<QueueJobRow, StoreError> {
        let now = Utc::now();
        let status = if job.delay_until.is_some() {
            "delayed"
        } else {
            "waiting"
        };

        let row = QueueJobRow {
            id: Uuid::now_v7(),
            queue_name: job.queue_name,
            group_id: job.group_id,
            job_name: job.job_name,
            executor_name: job.executor_name,
            payload: job.payload,
            status: status.to_string(),
            priority: job.priority,
            attempts: 0,
            max_attempts: job.max_attempts,
            delay_until: job.delay_until,
            locked_by: None,
            locked_until: None,
            error_message: None,
            error_code: None,
            error_stack: None,
            metadata: job.metadata,
            started_at: None,
            created_at: now,
            updated_at: now,
        };

        self.state.queue_jobs.write().insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJobRow>, StoreError> {
        Ok(self.state.queue_jobs.read().get(&id).cloned())
    }

    async fn find_pending_jobs(
        &self,
        queue_name: &str,
        limit: usize,
        exclude_group_ids: &[String],
        cursor: Option<QueueCursor>,
    ) -> Result<Vec<QueueJobRow>, StoreError> {
        let now = Utc::now();
        let jobs = self.state.queue_jobs.read();

        let mut pending: Vec<QueueJobRow> = jobs
            .values()
            .filter(|j| j.queue_name == queue_name)
            .filter(|j| j.status == "waiting")
            .filter(|j| j.delay_until.is_none_or(|d| d <= now))
            .filter(|j| !j.is_locked(now))
            .filter(|j| {
                j.group_id
                    .as_ref()
                    .is_none_or(|g| !exclude_group_ids.contains(g))
            })
            .filter(|j| cursor.as_ref().is_none_or(|c| after_cursor(j, c)))
            .cloned()
            .collect();

        pending.sort_by(dispatch_order);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn lock_job_for_processing(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut jobs = self.state.queue_jobs.write();

        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != "waiting" || job.is_locked(now) {
            return Ok(false);
        }

        job.locked_by = Some(owner.to_string());
        job.locked_until = Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn renew_job_lock(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut jobs = self.state.queue_jobs.write();

        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.locked_by.as_deref() != Some(owner) || !job.is_locked(now) {
            return Ok(false);
        }

        job.locked_until = Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
        job.updated_at = now;
        Ok(true)
    }

    async fn unlock_job(&self, id: Uuid, owner: &str) -> Result<bool, StoreError> {
        let mut jobs = self.state.queue_jobs.write();

        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.locked_by.as_deref() != Some(owner) {
            return Ok(false);
        }

        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_executing(&self, id: Uuid, owner: &str) -> Result<bool, StoreError> {
        let mut jobs = self.state.queue_jobs.write();

        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.locked_by.as_deref() != Some(owner) || job.status != "waiting" {
            return Ok(false);
        }

        job.status = "executing".to_string();
        job.attempts += 1;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn reset_job_to_waiting(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.state.queue_jobs.write();

        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(job.status.as_str(), "executing" | "delayed" | "failed") {
            return Ok(false);
        }

        job.status = "waiting".to_string();
        job.locked_by = None;
        job.locked_until = None;
        job.delay_until = None;
        job.started_at = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn promote_due_delayed(&self, queue_name: &str) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.state.queue_jobs.write();
        let mut count = 0;

        for job in jobs.values_mut() {
            if job.queue_name == queue_name
                && job.status == "delayed"
                && matches!(job.delay_until, Some(d) if d <= now)
            {
                job.status = "waiting".to_string();
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn reset_all_job_locks(&self, queue_name: &str) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.state.queue_jobs.write();
        let mut count = 0;

        for job in jobs.values_mut() {
            if job.queue_name == queue_name && job.status == "executing" {
                job.status = "waiting".to_string();
                job.locked_by = None;
                job.locked_until = None;
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cleanup_expired_locks(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.state.queue_jobs.write();
        let mut count = 0;

        for job in jobs.values_mut() {
            if job.status == "executing"
                && matches!(job.locked_until, Some(until) if until < now)
            {
                job.status = "waiting".to_string();
                job.locked_by = None;
                job.locked_until = None;
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn move_to_success(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
        execution_time: Duration,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut jobs = self.state.queue_jobs.write();
        let job = jobs.remove(&id).ok_or(StoreError::JobNotFound(id))?;

        // Job metadata is dropped on the success move.
        self.state.queue_successes.write().insert(
            id,
            QueueSuccessRow {
                id,
                queue_name: job.queue_name,
                job_name: job.job_name,
                executor_name: job.executor_name,
                payload: job.payload,
                result,
                attempts: job.attempts,
                execution_time_ms: execution_time.as_millis() as i64,
                started_at: job.started_at,
                completed_at: now,
                created_at: job.created_at,
            },
        );
        Ok(())
    }

    async fn mark_as_failed(
        &self,
        id: Uuid,
        error_message: &str,
        error_code: Option<&str>,
        error_stack: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.state.queue_jobs.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;

        job.status = "failed".to_string();
        job.error_message = Some(error_message.to_string());
        job.error_code = error_code.map(str::to_string);
        job.error_stack = error_stack.map(str::to_string);
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn reschedule_for_retry(
        &self,
        id: Uuid,
        delay_until: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let mut jobs = self.state.queue_jobs.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;

        if job.status != "executing" {
            return Err(StoreError::JobNotFound(id));
        }

        job.status = "delayed".to_string();
        job.delay_until = Some(delay_until);
        job.error_message = Some(error_message.to_string());
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn retry_failed_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.state.queue_jobs.write();

        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != "failed" {
            return Ok(false);
        }

        job.status = "waiting".to_string();
        job.error_message = None;
        job.error_code = None;
        job.error_stack = None;
        job.delay_until = None;
        job.started_at = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn move_to_failure(&self, id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut jobs = self.state.queue_jobs.write();
        let job = jobs.remove(&id).ok_or(StoreError::JobNotFound(id))?;

        self.state.queue_failures.write().insert(
            id,
            QueueFailureRow {
                id,
                queue_name: job.queue_name,
                job_name: job.job_name,
                executor_name: job.executor_name,
                payload: job.payload,
                attempts: job.attempts,
                error_message: job.error_message,
                error_code: job.error_code,
                error_stack: job.error_stack,
                failed_at: now,
                created_at: job.created_at,
            },
        );
        Ok(())
    }

    async fn cancel_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.state.queue_jobs.write();

        let cancellable = jobs
            .get(&id)
            .is_some_and(|j| matches!(j.status.as_str(), "waiting" | "delayed" | "paused"));
        if cancellable {
            jobs.remove(&id);
        }
        Ok(cancellable)
    }

    async fn pause_group(&self, queue_name: &str, group_id: &str) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.state.queue_jobs.write();
        let mut count = 0;

        for job in jobs.values_mut() {
            if job.queue_name == queue_name
                && job.group_id.as_deref() == Some(group_id)
                && matches!(job.status.as_str(), "waiting" | "delayed")
            {
                job.status = "paused".to_string();
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn resume_group(&self, queue_name: &str, group_id: &str) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.state.queue_jobs.write();
        let mut count = 0;

        for job in jobs.values_mut() {
            if job.queue_name == queue_name
                && job.group_id.as_deref() == Some(group_id)
                && job.status == "paused"
            {
                job.status = if matches!(job.delay_until, Some(d) if d > now) {
                    "delayed".to_string()
                } else {
                    "waiting".to_string()
                };
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn paused_groups(&self, queue_name: &str) -> Result<Vec<String>, StoreError> {
        let jobs = self.state.queue_jobs.read();
        let mut groups: Vec<String> = jobs
            .values()
            .filter(|j| j.queue_name == queue_name && j.status == "paused")
            .filter_map(|j| j.group_id.clone())
            .collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn find_orphaned_executing_jobs(
        &self,
        older_than: Duration,
    ) -> Result<Vec<QueueJobRow>, StoreError> {
        let threshold = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let jobs = self.state.queue_jobs.read();

        let mut orphaned: Vec<QueueJobRow> = jobs
            .values()
            .filter(|j| j.status == "executing" && j.updated_at < threshold)
            .cloned()
            .collect();
        orphaned.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(orphaned)
    }

    async fn get_success(&self, id: Uuid) -> Result<Option<QueueSuccessRow>, StoreError> {
        Ok(self.state.queue_successes.read().get(&id).cloned())
    }

    async fn get_failure(&self, id: Uuid) -> Result<Option<QueueFailureRow>, StoreError> {
        Ok(self.state.queue_failures.read().get(&id).cloned())
    }

    async fn queue_depth(&self, queue_name: &str) -> Result<i64, StoreError> {
        let jobs = self.state.queue_jobs.read();
        Ok(jobs.values().filter(|j| j.queue_name == queue_name).count() as i64)
    }

    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError> {
        let jobs = self.state.queue_jobs.read();
        let mut stats = QueueStats::default();

        for job in jobs.values().filter(|j| j.queue_name == queue_name) {
            match job.status.as_str() {
                "waiting" => stats.waiting += 1,
                "executing" => stats.executing += 1,
                "paused" => stats.paused += 1,
                "delayed" => stats.delayed += 1,
                "failed" => stats.failed += 1,
                _ => {}
            }
        }
        stats.succeeded = self
            .state
            .queue_successes
            .read()
            .values()
            .filter(|s| s.queue_name == queue_name)
            .count() as i64;
        stats.rejected = self
            .state
            .queue_failures
            .read()
            .values()
            .filter(|f| f.queue_name == queue_name)
            .count() as i64;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryQueueStore {
        InMemoryQueueStore::new(InMemoryState::new())
    }

    fn job(queue: &str, name: &str) -> CreateQueueJob {
        CreateQueueJob::new(queue, name, "echo", serde_json::json!({"n": name}))
    }

    #[tokio::test]
    async fn test_dispatch_order_is_priority_then_age_then_id() {
        let queue = store();

        let low = queue.submit(job("q", "low")).await.unwrap();
        let high = queue
            .submit(job("q", "high").with_priority(10))
            .await
            .unwrap();
        let mid = queue.submit(job("q", "mid").with_priority(5)).await.unwrap();

        let pending = queue.find_pending_jobs("q", 10, &[], None).await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high.id, mid.id, low.id]);
    }

    #[tokio::test]
    async fn test_cursor_resumes_strictly_after() {
        let queue = store();
        for i in 0..5 {
            queue.submit(job("q", &format!("j{}", i))).await.unwrap();
        }

        let first = queue.find_pending_jobs("q", 2, &[], None).await.unwrap();
        assert_eq!(first.len(), 2);

        let cursor = QueueCursor::from_job(&first[1]);
        let rest = queue
            .find_pending_jobs("q", 10, &[], Some(cursor))
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|j| first.iter().all(|f| f.id != j.id)));
    }

    #[tokio::test]
    async fn test_delayed_jobs_become_eligible() {
        let queue = store();
        let future = Utc::now() + chrono::Duration::seconds(60);
        queue
            .submit(job("q", "later").with_delay_until(future))
            .await
            .unwrap();

        let pending = queue.find_pending_jobs("q", 10, &[], None).await.unwrap();
        assert!(pending.is_empty());

        let past = Utc::now() - chrono::Duration::seconds(1);
        queue
            .submit(job("q", "now").with_delay_until(past))
            .await
            .unwrap();

        // The promotion pass flips due delayed jobs to waiting.
        assert_eq!(queue.promote_due_delayed("q").await.unwrap(), 1);
        let pending = queue.find_pending_jobs("q", 10, &[], None).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let queue = store();
        let row = queue.submit(job("q", "a")).await.unwrap();
        let ttl = Duration::from_secs(30);

        assert!(queue
            .lock_job_for_processing(row.id, "w1", ttl)
            .await
            .unwrap());
        assert!(!queue
            .lock_job_for_processing(row.id, "w2", ttl)
            .await
            .unwrap());

        // Only the owner can unlock.
        assert!(!queue.unlock_job(row.id, "w2").await.unwrap());
        assert!(queue.unlock_job(row.id, "w1").await.unwrap());
        assert!(queue
            .lock_job_for_processing(row.id, "w2", ttl)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_move_to_success_drops_metadata() {
        let queue = store();
        let row = queue
            .submit(job("q", "a").with_metadata(serde_json::json!({"trace": "t1"})))
            .await
            .unwrap();

        queue
            .move_to_success(row.id, Some(serde_json::json!({"ok": true})), Duration::from_millis(12))
            .await
            .unwrap();

        assert!(queue.get_job(row.id).await.unwrap().is_none());
        let success = queue.get_success(row.id).await.unwrap().unwrap();
        assert_eq!(success.id, row.id);
        assert_eq!(success.result, Some(serde_json::json!({"ok": true})));
        assert_eq!(success.execution_time_ms, 12);
    }

    #[tokio::test]
    async fn test_failed_then_retry_round_trip() {
        let queue = store();
        let row = queue.submit(job("q", "a")).await.unwrap();

        queue
            .mark_as_failed(row.id, "boom", Some("E1"), None)
            .await
            .unwrap();
        let failed = queue.get_job(row.id).await.unwrap().unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        assert!(queue.retry_failed_job(row.id).await.unwrap());
        let retried = queue.get_job(row.id).await.unwrap().unwrap();
        assert_eq!(retried.status, "waiting");
        assert!(retried.error_message.is_none());

        // Equivalent to a fresh submit: claimable again.
        assert!(queue
            .lock_job_for_processing(row.id, "w1", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let queue = store();
        let row = queue.submit(job("q", "a")).await.unwrap();
        assert!(!queue.retry_failed_job(row.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pause_and_resume_group() {
        let queue = store();
        queue
            .submit(job("q", "a").with_group("g1"))
            .await
            .unwrap();
        queue
            .submit(job("q", "b").with_group("g1"))
            .await
            .unwrap();
        queue
            .submit(job("q", "c").with_group("g2"))
            .await
            .unwrap();

        assert_eq!(queue.pause_group("q", "g1").await.unwrap(), 2);
        assert_eq!(queue.paused_groups("q").await.unwrap(), vec!["g1"]);

        // Paused groups are excluded from dispatch regardless of filters.
        let pending = queue.find_pending_jobs("q", 10, &[], None).await.unwrap();
        assert_eq!(pending.len(), 1);

        assert_eq!(queue.resume_group("q", "g1").await.unwrap(), 2);
        let pending = queue.find_pending_jobs("q", 10, &[], None).await.unwrap();
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_exclude_groups_filters_dispatch() {
        let queue = store();
        queue.submit(job("q", "a").with_group("g1")).await.unwrap();
        queue.submit(job("q", "b").with_group("g2")).await.unwrap();
        queue.submit(job("q", "c")).await.unwrap();

        let pending = queue
            .find_pending_jobs("q", 10, &["g1".to_string()], None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|j| j.group_id.as_deref() != Some("g1")));
    }

    #[tokio::test]
    async fn test_cleanup_expired_locks_requeues() {
        let queue = store();
        let row = queue.submit(job("q", "a")).await.unwrap();

        assert!(queue
            .lock_job_for_processing(row.id, "w1", Duration::ZERO)
            .await
            .unwrap());
        assert!(queue.mark_executing(row.id, "w1").await.unwrap());

        let reset = queue.cleanup_expired_locks().await.unwrap();
        assert_eq!(reset, 1);
        let job = queue.get_job(row.id).await.unwrap().unwrap();
        assert_eq!(job.status, "waiting");
        assert!(job.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_move_to_failure() {
        let queue = store();
        let row = queue.submit(job("q", "a")).await.unwrap();
        queue.mark_as_failed(row.id, "fatal", None, None).await.unwrap();

        queue.move_to_failure(row.id).await.unwrap();
        assert!(queue.get_job(row.id).await.unwrap().is_none());
        let failure = queue.get_failure(row.id).await.unwrap().unwrap();
        assert_eq!(failure.error_message.as_deref(), Some("fatal"));
    }

    #[tokio::test]
    async fn test_cancel_waiting_job() {
        let queue = store();
        let row = queue.submit(job("q", "a")).await.unwrap();
        assert!(queue.cancel_job(row.id).await.unwrap());
        assert!(queue.get_job(row.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let queue = store();
        queue.submit(job("q", "a")).await.unwrap();
        let b = queue.submit(job("q", "b")).await.unwrap();
        queue.mark_as_failed(b.id, "x", None, None).await.unwrap();
        let c = queue.submit(job("q", "c")).await.unwrap();
        queue
            .move_to_success(c.id, None, Duration::from_millis(1))
            .await
            .unwrap();

        let stats = queue.queue_stats("q").await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
    }
}
