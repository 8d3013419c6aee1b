use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            run_id BIGINT NOT NULL,
            action JSONB NOT NULL,
            requirements JSONB NOT NULL DEFAULT '[]',
            status VARCHAR(50) NOT NULL,
            worker_id VARCHAR(255),
            booked_worker_name VARCHAR(255),
            booked_hatchery_id VARCHAR(255),
            booked_until TIMESTAMPTZ,
            model BIGINT,
            parameters JSONB NOT NULL DEFAULT '{}',
            secrets JSONB NOT NULL DEFAULT '{}',
            result JSONB,
            queued_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            done_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create logs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_logs (
            id BIGSERIAL PRIMARY KEY,
            job_id BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            step INTEGER NOT NULL,
            timestamp TIMESTAMPTZ NOT NULL,
            level VARCHAR(20) NOT NULL,
            message TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for the queue listing and claim lookups
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, queued_at)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_run_id ON jobs(run_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_logs_job_id ON job_logs(job_id, id)")
        .execute(pool)
        .await?;

    // Create workers table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id VARCHAR(255) PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            hatchery_id VARCHAR(255),
            model BIGINT,
            status VARCHAR(50) NOT NULL,
            job_id BIGINT,
            booked_job_id BIGINT,
            ttl_minutes INTEGER NOT NULL,
            registered_at TIMESTAMPTZ NOT NULL,
            last_beat TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workers_hatchery ON workers(hatchery_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
