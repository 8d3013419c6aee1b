//! Job Repository
//!
//! Handles persistence of jobs. The claim, booking and completion paths are
//! single conditional updates: the job record is the only source of truth
//! for who holds a job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::domain::job::{Action, Booking, Job, JobId, JobResult, JobStatus};
use kiln_core::domain::requirement::Requirement;
use kiln_core::dto::job::NewJob;
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Secrets handed to the worker that claims a job
pub type Secrets = HashMap<String, String>;

/// Outcome of a claim attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The job moved Waiting → Building for this worker
    Claimed(Job),
    /// Someone else holds it, it is booked for another worker, or it already left Waiting
    AlreadyClaimed,
    NotFound,
    /// The job was cancelled
    Gone,
}

/// Outcome of a booking attempt
#[derive(Debug, Clone, PartialEq)]
pub enum BookOutcome {
    Booked,
    /// Booked by someone else, or no longer Waiting
    Conflict,
    NotFound,
    Gone,
}

/// Outcome of a result report
#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    Completed(Job),
    /// Another worker holds the job
    NotHolder,
    /// The job already reached this state, the report changes nothing
    AlreadyDone(JobStatus),
    NotFound,
}

/// Persistence operations on jobs
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Creates a Waiting job
    async fn create(&self, req: NewJob) -> Result<Job, sqlx::Error>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, sqlx::Error>;

    /// Secrets of a job, only read when handing it to its worker
    async fn secrets(&self, id: JobId) -> Result<Secrets, sqlx::Error>;

    /// Waiting jobs, oldest first, optionally restricted to a model
    async fn list_waiting(&self, model: Option<i64>) -> Result<Vec<Job>, sqlx::Error>;

    /// Waiting → Building if the job is unbooked, booked for `worker_name`
    /// or its booking expired
    async fn claim(
        &self,
        id: JobId,
        worker_id: &str,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, sqlx::Error>;

    /// Books a Waiting job that is unbooked or whose booking expired
    async fn book(
        &self,
        id: JobId,
        booking: &Booking,
        now: DateTime<Utc>,
    ) -> Result<BookOutcome, sqlx::Error>;

    /// Building → final status, only for the worker holding the job
    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: &JobResult,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome, sqlx::Error>;

    /// Marks every unfinished job of a run Cancelled, returns their ids
    async fn cancel_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<Vec<JobId>, sqlx::Error>;

    /// Deletes every job of a run, returns their ids
    async fn purge_run(&self, run_id: i64) -> Result<Vec<JobId>, sqlx::Error>;
}

// =============================================================================
// Postgres
// =============================================================================

const JOB_COLUMNS: &str = r#"
    id, run_id, action, requirements, status, worker_id,
    booked_worker_name, booked_hatchery_id, booked_until, model,
    parameters, queued_at, started_at, done_at
"#;

/// Postgres implementation of [`JobRepository`]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn status_of(&self, id: JobId) -> Result<Option<(String,)>, sqlx::Error> {
        sqlx::query_as::<_, (String,)>("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, req: NewJob) -> Result<Job, sqlx::Error> {
        let now = Utc::now();

        let (id,): (JobId,) = sqlx::query_as(
            r#"
            INSERT INTO jobs (run_id, action, requirements, status, model, parameters, secrets, queued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(req.run_id)
        .bind(Json(&req.action))
        .bind(Json(&req.requirements))
        .bind(JobStatus::Waiting.as_str())
        .bind(req.model)
        .bind(Json(&req.parameters))
        .bind(Json(&req.secrets))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(new_job(id, req, now))
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let sql = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn secrets(&self, id: JobId) -> Result<Secrets, sqlx::Error> {
        let row: Option<(Json<Secrets>,)> =
            sqlx::query_as("SELECT secrets FROM jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(secrets,)| secrets.0).unwrap_or_default())
    }

    async fn list_waiting(&self, model: Option<i64>) -> Result<Vec<Job>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {} FROM jobs
            WHERE status = $1 AND ($2::BIGINT IS NULL OR model = $2)
            ORDER BY queued_at ASC, id ASC
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(JobStatus::Waiting.as_str())
            .bind(model)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn claim(
        &self,
        id: JobId,
        worker_id: &str,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'Building', worker_id = $2, started_at = $4
            WHERE id = $1 AND status = 'Waiting'
              AND (booked_worker_name IS NULL OR booked_worker_name = $3 OR booked_until <= $4)
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let claimed = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(worker_name)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(row.into()));
        }

        Ok(match self.status_of(id).await? {
            None => ClaimOutcome::NotFound,
            Some((status,)) if status == JobStatus::Cancelled.as_str() => ClaimOutcome::Gone,
            Some(_) => ClaimOutcome::AlreadyClaimed,
        })
    }

    async fn book(
        &self,
        id: JobId,
        booking: &Booking,
        now: DateTime<Utc>,
    ) -> Result<BookOutcome, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET booked_worker_name = $2, booked_hatchery_id = $3, booked_until = $4
            WHERE id = $1 AND status = 'Waiting'
              AND (booked_worker_name IS NULL OR booked_until <= $5)
            "#,
        )
        .bind(id)
        .bind(&booking.worker_name)
        .bind(&booking.hatchery_id)
        .bind(booking.until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(BookOutcome::Booked);
        }

        Ok(match self.status_of(id).await? {
            None => BookOutcome::NotFound,
            Some((status,)) if status == JobStatus::Cancelled.as_str() => BookOutcome::Gone,
            Some(_) => BookOutcome::Conflict,
        })
    }

    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: &JobResult,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = $3, result = $4, done_at = $5
            WHERE id = $1 AND worker_id = $2 AND status = 'Building'
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let completed = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(result.status.as_str())
            .bind(Json(result))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = completed {
            return Ok(CompleteOutcome::Completed(row.into()));
        }

        Ok(match self.status_of(id).await? {
            None => CompleteOutcome::NotFound,
            Some((status,)) if status == JobStatus::Building.as_str() => {
                CompleteOutcome::NotHolder
            }
            Some((status,)) => CompleteOutcome::AlreadyDone(parse_status(&status)),
        })
    }

    async fn cancel_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<Vec<JobId>, sqlx::Error> {
        let rows: Vec<(JobId,)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = 'Cancelled', done_at = $2
            WHERE run_id = $1 AND status IN ('Waiting', 'Checking', 'Building')
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn purge_run(&self, run_id: i64) -> Result<Vec<JobId>, sqlx::Error> {
        let rows: Vec<(JobId,)> = sqlx::query_as("DELETE FROM jobs WHERE run_id = $1 RETURNING id")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

// =============================================================================
// In-memory
// =============================================================================

struct StoredJob {
    job: Job,
    secrets: Secrets,
    result: Option<JobResult>,
}

#[derive(Default)]
struct MemoryJobs {
    last_id: JobId,
    jobs: BTreeMap<JobId, StoredJob>,
    claims: u64,
}

/// In-memory implementation of [`JobRepository`]
///
/// Every check-and-set runs under one mutex, which gives the same
/// exclusivity as the conditional updates of the Postgres implementation.
#[derive(Default)]
pub struct MemoryJobRepository {
    inner: Mutex<MemoryJobs>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful claims since creation
    pub fn claim_count(&self) -> u64 {
        self.lock().claims
    }

    /// Result stored for a job, if one was reported
    pub fn result_of(&self, id: JobId) -> Option<JobResult> {
        self.lock().jobs.get(&id).and_then(|stored| stored.result.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryJobs> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create(&self, req: NewJob) -> Result<Job, sqlx::Error> {
        let mut inner = self.lock();
        inner.last_id += 1;
        let id = inner.last_id;
        let secrets = req.secrets.clone();
        let job = new_job(id, req, Utc::now());
        inner.jobs.insert(
            id,
            StoredJob {
                job: job.clone(),
                secrets,
                result: None,
            },
        );
        Ok(job)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        Ok(self.lock().jobs.get(&id).map(|stored| stored.job.clone()))
    }

    async fn secrets(&self, id: JobId) -> Result<Secrets, sqlx::Error> {
        Ok(self
            .lock()
            .jobs
            .get(&id)
            .map(|stored| stored.secrets.clone())
            .unwrap_or_default())
    }

    async fn list_waiting(&self, model: Option<i64>) -> Result<Vec<Job>, sqlx::Error> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .map(|stored| &stored.job)
            .filter(|job| job.status == JobStatus::Waiting)
            .filter(|job| model.is_none() || job.model == model)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.queued_at, job.id));
        Ok(jobs)
    }

    async fn claim(
        &self,
        id: JobId,
        worker_id: &str,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, sqlx::Error> {
        let mut inner = self.lock();
        let Some(stored) = inner.jobs.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };
        if stored.job.status == JobStatus::Cancelled {
            return Ok(ClaimOutcome::Gone);
        }
        if !stored.job.claimable_by(worker_name, now) {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        stored.job.status = JobStatus::Building;
        stored.job.worker_id = Some(worker_id.to_string());
        stored.job.started_at = Some(now);
        let job = stored.job.clone();
        inner.claims += 1;
        Ok(ClaimOutcome::Claimed(job))
    }

    async fn book(
        &self,
        id: JobId,
        booking: &Booking,
        now: DateTime<Utc>,
    ) -> Result<BookOutcome, sqlx::Error> {
        let mut inner = self.lock();
        let Some(stored) = inner.jobs.get_mut(&id) else {
            return Ok(BookOutcome::NotFound);
        };
        if stored.job.status == JobStatus::Cancelled {
            return Ok(BookOutcome::Gone);
        }
        if !stored.job.bookable(now) {
            return Ok(BookOutcome::Conflict);
        }
        stored.job.booked_by = Some(booking.clone());
        Ok(BookOutcome::Booked)
    }

    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: &JobResult,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome, sqlx::Error> {
        let mut inner = self.lock();
        let Some(stored) = inner.jobs.get_mut(&id) else {
            return Ok(CompleteOutcome::NotFound);
        };
        if stored.job.status != JobStatus::Building {
            return Ok(CompleteOutcome::AlreadyDone(stored.job.status));
        }
        if stored.job.worker_id.as_deref() != Some(worker_id) {
            return Ok(CompleteOutcome::NotHolder);
        }

        stored.job.status = result.status;
        stored.job.done_at = Some(now);
        stored.result = Some(result.clone());
        Ok(CompleteOutcome::Completed(stored.job.clone()))
    }

    async fn cancel_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<Vec<JobId>, sqlx::Error> {
        let mut inner = self.lock();
        let mut cancelled = Vec::new();
        for stored in inner.jobs.values_mut() {
            if stored.job.run_id == run_id && !stored.job.status.is_final() {
                stored.job.status = JobStatus::Cancelled;
                stored.job.done_at = Some(now);
                cancelled.push(stored.job.id);
            }
        }
        Ok(cancelled)
    }

    async fn purge_run(&self, run_id: i64) -> Result<Vec<JobId>, sqlx::Error> {
        let mut inner = self.lock();
        let purged: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|stored| stored.job.run_id == run_id)
            .map(|stored| stored.job.id)
            .collect();
        for id in &purged {
            inner.jobs.remove(id);
        }
        Ok(purged)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn new_job(id: JobId, req: NewJob, now: DateTime<Utc>) -> Job {
    Job {
        id,
        run_id: req.run_id,
        action: req.action,
        requirements: req.requirements,
        status: JobStatus::Waiting,
        worker_id: None,
        booked_by: None,
        model: req.model,
        parameters: req.parameters,
        queued_at: now,
        started_at: None,
        done_at: None,
    }
}

fn parse_status(s: &str) -> JobStatus {
    // An unknown status must never look claimable
    s.parse().unwrap_or(JobStatus::Fail)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: JobId,
    run_id: i64,
    action: Json<Action>,
    requirements: Json<Vec<Requirement>>,
    status: String,
    worker_id: Option<String>,
    booked_worker_name: Option<String>,
    booked_hatchery_id: Option<String>,
    booked_until: Option<DateTime<Utc>>,
    model: Option<i64>,
    parameters: Json<HashMap<String, serde_json::Value>>,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    done_at: Option<DateTime<Utc>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        let booked_by = match (row.booked_worker_name, row.booked_hatchery_id, row.booked_until) {
            (Some(worker_name), Some(hatchery_id), Some(until)) => Some(Booking {
                worker_name,
                hatchery_id,
                until,
            }),
            _ => None,
        };

        Job {
            id: row.id,
            run_id: row.run_id,
            action: row.action.0,
            requirements: row.requirements.0,
            status: parse_status(&row.status),
            worker_id: row.worker_id,
            booked_by,
            model: row.model,
            parameters: row.parameters.0,
            queued_at: row.queued_at,
            started_at: row.started_at,
            done_at: row.done_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn new_job_request(run_id: i64) -> NewJob {
        NewJob {
            run_id,
            action: Action {
                name: "build".to_string(),
                steps: vec![],
            },
            requirements: vec![],
            model: None,
            parameters: HashMap::new(),
            secrets: HashMap::from([("token".to_string(), "s3cr3t".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_racing_claims_have_exactly_one_winner() {
        let repo = Arc::new(MemoryJobRepository::new());
        let job = repo.create(new_job_request(1)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                let worker = format!("w{}", i);
                repo.claim(job.id, &worker, &worker, Utc::now()).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ClaimOutcome::Claimed(_) => winners += 1,
                outcome => assert_eq!(outcome, ClaimOutcome::AlreadyClaimed),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(repo.claim_count(), 1);
    }

    #[tokio::test]
    async fn test_reclaim_by_holder_changes_nothing() {
        let repo = MemoryJobRepository::new();
        let job = repo.create(new_job_request(1)).await.unwrap();
        let now = Utc::now();

        let first = repo.claim(job.id, "id-1", "w1", now).await.unwrap();
        let ClaimOutcome::Claimed(claimed) = first else {
            panic!("first claim must win");
        };

        let again = repo.claim(job.id, "id-1", "w1", now).await.unwrap();
        assert_eq!(again, ClaimOutcome::AlreadyClaimed);
        assert_eq!(repo.find_by_id(job.id).await.unwrap(), Some(claimed));
        assert_eq!(repo.claim_count(), 1);
    }

    #[tokio::test]
    async fn test_booking_reserves_until_expiry() {
        let repo = MemoryJobRepository::new();
        let job = repo.create(new_job_request(1)).await.unwrap();
        let now = Utc::now();
        let booking = Booking {
            worker_name: "w1".to_string(),
            hatchery_id: "h1".to_string(),
            until: now + Duration::seconds(30),
        };

        assert_eq!(repo.book(job.id, &booking, now).await.unwrap(), BookOutcome::Booked);
        assert_eq!(repo.book(job.id, &booking, now).await.unwrap(), BookOutcome::Conflict);
        assert_eq!(
            repo.claim(job.id, "id-2", "w2", now).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );

        let later = now + Duration::seconds(31);
        assert!(matches!(
            repo.claim(job.id, "id-2", "w2", later).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_job_is_gone() {
        let repo = MemoryJobRepository::new();
        let job = repo.create(new_job_request(4)).await.unwrap();
        repo.create(new_job_request(5)).await.unwrap();

        let cancelled = repo.cancel_run(4, Utc::now()).await.unwrap();
        assert_eq!(cancelled, vec![job.id]);
        assert_eq!(
            repo.claim(job.id, "id", "w", Utc::now()).await.unwrap(),
            ClaimOutcome::Gone
        );
        assert_eq!(repo.list_waiting(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_only_by_holder() {
        let repo = MemoryJobRepository::new();
        let job = repo.create(new_job_request(1)).await.unwrap();
        let now = Utc::now();
        repo.claim(job.id, "id-1", "w1", now).await.unwrap();

        let mut result = JobResult::failed("nope");
        assert_eq!(
            repo.complete(job.id, "id-2", &result, now).await.unwrap(),
            CompleteOutcome::NotHolder
        );

        result.status = JobStatus::Success;
        assert!(matches!(
            repo.complete(job.id, "id-1", &result, now).await.unwrap(),
            CompleteOutcome::Completed(Job { status: JobStatus::Success, .. })
        ));
        assert_eq!(
            repo.complete(job.id, "id-1", &result, now).await.unwrap(),
            CompleteOutcome::AlreadyDone(JobStatus::Success)
        );
        assert_eq!(repo.complete(99, "id-1", &result, now).await.unwrap(), CompleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_purge_run_and_secrets() {
        let repo = MemoryJobRepository::new();
        let job = repo.create(new_job_request(2)).await.unwrap();
        assert_eq!(repo.secrets(job.id).await.unwrap()["token"], "s3cr3t");

        assert_eq!(repo.purge_run(2).await.unwrap(), vec![job.id]);
        assert_eq!(repo.find_by_id(job.id).await.unwrap(), None);
        assert!(repo.secrets(job.id).await.unwrap().is_empty());
    }
}
