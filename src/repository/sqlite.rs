use std::{future::Future, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use sqlx::{
    Row, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};

use crate::{
    BatchError,
    core::{
        context::ExecutionContext,
        execution::{BatchStatus, ExitStatus, JobExecution, JobInstance, JobParameters, StepExecution},
    },
};

use super::{
    JobRepository, RestartCheck, STALE_DESCRIPTION, check_restart, check_version, stale_failure,
};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS BATCH_JOB_INSTANCE (
        JOB_INSTANCE_ID INTEGER PRIMARY KEY AUTOINCREMENT,
        JOB_NAME TEXT NOT NULL,
        JOB_KEY TEXT NOT NULL,
        UNIQUE (JOB_NAME, JOB_KEY)
    )",
    "CREATE TABLE IF NOT EXISTS BATCH_JOB_EXECUTION (
        JOB_EXECUTION_ID INTEGER PRIMARY KEY AUTOINCREMENT,
        JOB_INSTANCE_ID INTEGER NOT NULL REFERENCES BATCH_JOB_INSTANCE (JOB_INSTANCE_ID),
        VERSION INTEGER NOT NULL,
        JOB_PARAMETERS TEXT NOT NULL,
        CREATE_TIME TEXT NOT NULL,
        START_TIME TEXT,
        END_TIME TEXT,
        STATUS TEXT NOT NULL,
        EXIT_CODE TEXT NOT NULL,
        EXIT_MESSAGE TEXT NOT NULL,
        LAST_UPDATED TEXT,
        EXECUTION_CONTEXT TEXT NOT NULL,
        FAILURES TEXT NOT NULL,
        SKIPPED_STEPS TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS BATCH_STEP_EXECUTION (
        STEP_EXECUTION_ID INTEGER PRIMARY KEY AUTOINCREMENT,
        VERSION INTEGER NOT NULL,
        STEP_NAME TEXT NOT NULL,
        JOB_EXECUTION_ID INTEGER NOT NULL REFERENCES BATCH_JOB_EXECUTION (JOB_EXECUTION_ID),
        START_TIME TEXT,
        END_TIME TEXT,
        STATUS TEXT NOT NULL,
        COMMIT_COUNT INTEGER NOT NULL,
        READ_COUNT INTEGER NOT NULL,
        FILTER_COUNT INTEGER NOT NULL,
        WRITE_COUNT INTEGER NOT NULL,
        READ_SKIP_COUNT INTEGER NOT NULL,
        WRITE_SKIP_COUNT INTEGER NOT NULL,
        PROCESS_SKIP_COUNT INTEGER NOT NULL,
        ROLLBACK_COUNT INTEGER NOT NULL,
        EXIT_CODE TEXT NOT NULL,
        EXIT_MESSAGE TEXT NOT NULL,
        LAST_UPDATED TEXT,
        EXECUTION_CONTEXT TEXT NOT NULL,
        FAILURES TEXT NOT NULL,
        RESUMED_FROM INTEGER
    )",
];

const SELECT_JOB_EXECUTION: &str = "SELECT E.JOB_EXECUTION_ID, E.JOB_INSTANCE_ID, E.VERSION,
    E.JOB_PARAMETERS, E.CREATE_TIME, E.START_TIME, E.END_TIME, E.STATUS, E.EXIT_CODE,
    E.EXIT_MESSAGE, E.LAST_UPDATED, E.EXECUTION_CONTEXT, E.FAILURES, E.SKIPPED_STEPS,
    I.JOB_NAME, I.JOB_KEY
    FROM BATCH_JOB_EXECUTION E
    JOIN BATCH_JOB_INSTANCE I ON E.JOB_INSTANCE_ID = I.JOB_INSTANCE_ID";

const SELECT_INSTANCE_STEPS: &str = "SELECT S.* FROM BATCH_STEP_EXECUTION S
    JOIN BATCH_JOB_EXECUTION E ON S.JOB_EXECUTION_ID = E.JOB_EXECUTION_ID
    WHERE E.JOB_INSTANCE_ID = ? AND S.STEP_NAME = ?";

/// Job repository persisting executions in SQLite through sqlx.
///
/// The trait is synchronous, so every call blocks on the current tokio
/// runtime with `block_in_place`. The repository must therefore be used from
/// a multi-threaded runtime.
pub struct SqliteJobRepository {
    pool: SqlitePool,
    stale_timeout: Option<Duration>,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            stale_timeout: None,
        }
    }

    /// Opens a pool on `url`, creating the database file when missing.
    pub async fn connect(url: &str) -> Result<Self, BatchError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_error)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_error)?;
        Ok(Self::new(pool))
    }

    /// See [`InMemoryJobRepository::with_stale_timeout`](super::InMemoryJobRepository::with_stale_timeout).
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = Some(timeout);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the repository tables when they do not exist yet.
    pub async fn initialize_schema(&self) -> Result<(), BatchError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }
        debug!("Batch repository schema ready");
        Ok(())
    }

    fn block_on<T>(
        &self,
        future: impl Future<Output = Result<T, BatchError>>,
    ) -> Result<T, BatchError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|error| BatchError::Repository(format!("no tokio runtime: {}", error)))?;
        tokio::task::block_in_place(|| handle.block_on(future))
    }
}

impl JobRepository for SqliteJobRepository {
    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            find_instance(&mut conn, job_name, &parameters.to_key()).await
        })
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            match find_instance(&mut conn, job_name, &parameters.to_key()).await? {
                Some(instance) => last_job_execution(&mut conn, instance.id).await,
                None => Ok(None),
            }
        })
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            // Launch checks and insert must not interleave with another launch
            sqlx::query("BEGIN IMMEDIATE")
                .execute(&mut *conn)
                .await
                .map_err(db_error)?;

            match create_job_execution(&mut conn, job_name, parameters, self.stale_timeout).await {
                Ok(execution) => {
                    sqlx::query("COMMIT")
                        .execute(&mut *conn)
                        .await
                        .map_err(db_error)?;
                    Ok(execution)
                }
                Err(error) => {
                    if let Err(rollback_error) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                        warn!("Rollback of job launch failed: {}", rollback_error);
                    }
                    Err(error)
                }
            }
        })
    }

    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            update_job(&mut conn, job_execution).await
        })
    }

    fn update_job_execution_context(
        &self,
        job_execution: &mut JobExecution,
    ) -> Result<(), BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            let sql = "UPDATE BATCH_JOB_EXECUTION SET EXECUTION_CONTEXT = ?
                WHERE JOB_EXECUTION_ID = ? AND VERSION = ?";
            update_context(
                &mut conn,
                sql,
                ("BATCH_JOB_EXECUTION", "JobExecution", "JOB_EXECUTION_ID"),
                job_execution.id,
                job_execution.version,
                &mut job_execution.execution_context,
            )
            .await
        })
    }

    fn get_job_execution(&self, id: u64) -> Result<Option<JobExecution>, BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            job_execution(&mut conn, id).await
        })
    }

    fn create_step_execution(
        &self,
        job_execution: &JobExecution,
        step_name: &str,
        mut context: ExecutionContext,
        resumed_from: Option<u64>,
    ) -> Result<StepExecution, BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            let now = Utc::now();
            let result = sqlx::query(
                "INSERT INTO BATCH_STEP_EXECUTION (VERSION, STEP_NAME, JOB_EXECUTION_ID, STATUS,
                    COMMIT_COUNT, READ_COUNT, FILTER_COUNT, WRITE_COUNT, READ_SKIP_COUNT,
                    WRITE_SKIP_COUNT, PROCESS_SKIP_COUNT, ROLLBACK_COUNT, EXIT_CODE, EXIT_MESSAGE,
                    LAST_UPDATED, EXECUTION_CONTEXT, FAILURES, RESUMED_FROM)
                VALUES (0, ?, ?, ?, 0, 0, 0, 0, 0, 0, 0, 0, ?, '', ?, ?, '[]', ?)",
            )
            .bind(step_name)
            .bind(job_execution.id as i64)
            .bind(BatchStatus::Starting.as_str())
            .bind(ExitStatus::EXECUTING)
            .bind(now.to_rfc3339())
            .bind(context.to_json()?)
            .bind(resumed_from.map(|id| id as i64))
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;

            let id = result.last_insert_rowid() as u64;
            let mut step = StepExecution::new(id, job_execution.id, step_name);
            context.clear_dirty();
            step.execution_context = context;
            step.resumed_from = resumed_from;
            step.last_updated = Some(now);
            step.set_stop_signal(job_execution.stop_signal.clone());
            Ok(step)
        })
    }

    fn update_step_execution(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<(), BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            update_step(&mut conn, step_execution).await
        })
    }

    fn update_step_execution_context(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<(), BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            let sql = "UPDATE BATCH_STEP_EXECUTION SET EXECUTION_CONTEXT = ?
                WHERE STEP_EXECUTION_ID = ? AND VERSION = ?";
            update_context(
                &mut conn,
                sql,
                ("BATCH_STEP_EXECUTION", "StepExecution", "STEP_EXECUTION_ID"),
                step_execution.id,
                step_execution.version,
                &mut step_execution.execution_context,
            )
            .await
        })
    }

    fn get_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            let sql = format!(
                "{} ORDER BY S.STEP_EXECUTION_ID DESC LIMIT 1",
                SELECT_INSTANCE_STEPS
            );
            let row = sqlx::query(&sql)
                .bind(job_instance.id as i64)
                .bind(step_name)
                .fetch_optional(&mut *conn)
                .await
                .map_err(db_error)?;
            row.as_ref().map(step_execution_from_row).transpose()
        })
    }

    fn get_step_execution_count(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, BatchError> {
        self.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            let sql = SELECT_INSTANCE_STEPS.replacen("S.*", "COUNT(*) AS STEP_COUNT", 1);
            let row = sqlx::query(&sql)
                .bind(job_instance.id as i64)
                .bind(step_name)
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error)?;
            get_count(&row, "STEP_COUNT")
        })
    }
}

async fn find_instance(
    conn: &mut SqliteConnection,
    job_name: &str,
    job_key: &str,
) -> Result<Option<JobInstance>, BatchError> {
    let row = sqlx::query(
        "SELECT JOB_INSTANCE_ID, JOB_NAME, JOB_KEY FROM BATCH_JOB_INSTANCE
        WHERE JOB_NAME = ? AND JOB_KEY = ?",
    )
    .bind(job_name)
    .bind(job_key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?;

    row.map(|row| {
        Ok(JobInstance {
            id: get_id(&row, "JOB_INSTANCE_ID")?,
            job_name: get_text(&row, "JOB_NAME")?,
            job_key: get_text(&row, "JOB_KEY")?,
        })
    })
    .transpose()
}

async fn create_job_execution(
    conn: &mut SqliteConnection,
    job_name: &str,
    parameters: &JobParameters,
    stale_timeout: Option<Duration>,
) -> Result<JobExecution, BatchError> {
    let job_key = parameters.to_key();

    let instance = match find_instance(conn, job_name, &job_key).await? {
        Some(instance) => instance,
        None => {
            let result =
                sqlx::query("INSERT INTO BATCH_JOB_INSTANCE (JOB_NAME, JOB_KEY) VALUES (?, ?)")
                    .bind(job_name)
                    .bind(&job_key)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_error)?;
            JobInstance {
                id: result.last_insert_rowid() as u64,
                job_name: job_name.to_string(),
                job_key,
            }
        }
    };

    let mut context = ExecutionContext::new();
    if let Some(mut last) = last_job_execution(conn, instance.id).await? {
        let activity = last
            .step_executions
            .iter()
            .filter_map(|step| step.last_updated)
            .chain(last.last_updated)
            .max();
        if check_restart(&last, activity, stale_timeout)? == RestartCheck::RecoverStale {
            recover_stale(conn, &mut last).await?;
        }
        context = last.execution_context;
    }
    context.clear_dirty();

    let mut execution = JobExecution::new(0, instance, parameters.clone());
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO BATCH_JOB_EXECUTION (JOB_INSTANCE_ID, VERSION, JOB_PARAMETERS, CREATE_TIME,
            STATUS, EXIT_CODE, EXIT_MESSAGE, LAST_UPDATED, EXECUTION_CONTEXT, FAILURES,
            SKIPPED_STEPS)
        VALUES (?, 0, ?, ?, ?, ?, '', ?, ?, '[]', '[]')",
    )
    .bind(execution.job_instance.id as i64)
    .bind(serde_json::to_string(parameters)?)
    .bind(execution.create_time.to_rfc3339())
    .bind(execution.status.as_str())
    .bind(execution.exit_status.exit_code.as_str())
    .bind(now.to_rfc3339())
    .bind(context.to_json()?)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    execution.id = result.last_insert_rowid() as u64;
    execution.execution_context = context;
    execution.last_updated = Some(now);
    debug!("Created job execution {}", execution.id);
    Ok(execution)
}

async fn recover_stale(
    conn: &mut SqliteConnection,
    execution: &mut JobExecution,
) -> Result<(), BatchError> {
    let now = Utc::now();
    for step in &mut execution.step_executions {
        if stale_failure(&mut step.status) {
            step.exit_status = ExitStatus::failed().with_description(STALE_DESCRIPTION);
            step.end_time = Some(now);
            update_step(conn, step).await?;
        }
    }
    if stale_failure(&mut execution.status) {
        execution.exit_status = ExitStatus::failed().with_description(STALE_DESCRIPTION);
        execution.end_time = Some(now);
        update_job(conn, execution).await?;
    }
    Ok(())
}

async fn job_execution(
    conn: &mut SqliteConnection,
    id: u64,
) -> Result<Option<JobExecution>, BatchError> {
    let sql = format!("{} WHERE E.JOB_EXECUTION_ID = ?", SELECT_JOB_EXECUTION);
    let row = sqlx::query(&sql)
        .bind(id as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
    match row {
        Some(row) => {
            let mut execution = job_execution_from_row(&row)?;
            execution.step_executions = step_executions(conn, execution.id).await?;
            Ok(Some(execution))
        }
        None => Ok(None),
    }
}

async fn last_job_execution(
    conn: &mut SqliteConnection,
    instance_id: u64,
) -> Result<Option<JobExecution>, BatchError> {
    let sql = format!(
        "{} WHERE E.JOB_INSTANCE_ID = ? ORDER BY E.JOB_EXECUTION_ID DESC LIMIT 1",
        SELECT_JOB_EXECUTION
    );
    let row = sqlx::query(&sql)
        .bind(instance_id as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
    match row {
        Some(row) => {
            let mut execution = job_execution_from_row(&row)?;
            execution.step_executions = step_executions(conn, execution.id).await?;
            Ok(Some(execution))
        }
        None => Ok(None),
    }
}

async fn step_executions(
    conn: &mut SqliteConnection,
    job_execution_id: u64,
) -> Result<Vec<StepExecution>, BatchError> {
    let rows = sqlx::query(
        "SELECT * FROM BATCH_STEP_EXECUTION WHERE JOB_EXECUTION_ID = ?
        ORDER BY STEP_EXECUTION_ID",
    )
    .bind(job_execution_id as i64)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;
    rows.iter().map(step_execution_from_row).collect()
}

async fn update_job(
    conn: &mut SqliteConnection,
    execution: &mut JobExecution,
) -> Result<(), BatchError> {
    let now = Utc::now();
    let context = match execution.execution_context.is_dirty() {
        true => Some(execution.execution_context.to_json()?),
        false => None,
    };
    let sql = format!(
        "UPDATE BATCH_JOB_EXECUTION SET VERSION = ?, START_TIME = ?, END_TIME = ?, STATUS = ?,
            EXIT_CODE = ?, EXIT_MESSAGE = ?, LAST_UPDATED = ?, FAILURES = ?, SKIPPED_STEPS = ?{}
        WHERE JOB_EXECUTION_ID = ? AND VERSION = ?",
        if context.is_some() { ", EXECUTION_CONTEXT = ?" } else { "" }
    );

    let mut query = sqlx::query(&sql)
        .bind(i64::from(execution.version) + 1)
        .bind(to_text(execution.start_time))
        .bind(to_text(execution.end_time))
        .bind(execution.status.as_str())
        .bind(execution.exit_status.exit_code.clone())
        .bind(execution.exit_status.exit_description.clone())
        .bind(now.to_rfc3339())
        .bind(serde_json::to_string(&execution.failure_exceptions)?)
        .bind(serde_json::to_string(&execution.skipped_steps)?);
    if let Some(context) = context {
        query = query.bind(context);
    }
    let result = query
        .bind(execution.id as i64)
        .bind(i64::from(execution.version))
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

    if result.rows_affected() == 0 {
        return Err(version_conflict(
            conn,
            ("BATCH_JOB_EXECUTION", "JobExecution", "JOB_EXECUTION_ID"),
            execution.id,
            execution.version,
        )
        .await);
    }

    execution.version += 1;
    execution.last_updated = Some(now);
    execution.execution_context.clear_dirty();
    Ok(())
}

async fn update_step(
    conn: &mut SqliteConnection,
    step: &mut StepExecution,
) -> Result<(), BatchError> {
    let now = Utc::now();
    let context = match step.execution_context.is_dirty() {
        true => Some(step.execution_context.to_json()?),
        false => None,
    };
    let sql = format!(
        "UPDATE BATCH_STEP_EXECUTION SET VERSION = ?, START_TIME = ?, END_TIME = ?, STATUS = ?,
            COMMIT_COUNT = ?, READ_COUNT = ?, FILTER_COUNT = ?, WRITE_COUNT = ?,
            READ_SKIP_COUNT = ?, WRITE_SKIP_COUNT = ?, PROCESS_SKIP_COUNT = ?, ROLLBACK_COUNT = ?,
            EXIT_CODE = ?, EXIT_MESSAGE = ?, LAST_UPDATED = ?, FAILURES = ?{}
        WHERE STEP_EXECUTION_ID = ? AND VERSION = ?",
        if context.is_some() { ", EXECUTION_CONTEXT = ?" } else { "" }
    );

    let mut query = sqlx::query(&sql)
        .bind(i64::from(step.version) + 1)
        .bind(to_text(step.start_time))
        .bind(to_text(step.end_time))
        .bind(step.status.as_str())
        .bind(step.commit_count as i64)
        .bind(step.read_count as i64)
        .bind(step.filter_count as i64)
        .bind(step.write_count as i64)
        .bind(step.read_skip_count as i64)
        .bind(step.write_skip_count as i64)
        .bind(step.process_skip_count as i64)
        .bind(step.rollback_count as i64)
        .bind(step.exit_status.exit_code.clone())
        .bind(step.exit_status.exit_description.clone())
        .bind(now.to_rfc3339())
        .bind(serde_json::to_string(&step.failure_exceptions)?);
    if let Some(context) = context {
        query = query.bind(context);
    }
    let result = query
        .bind(step.id as i64)
        .bind(i64::from(step.version))
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

    if result.rows_affected() == 0 {
        return Err(version_conflict(
            conn,
            ("BATCH_STEP_EXECUTION", "StepExecution", "STEP_EXECUTION_ID"),
            step.id,
            step.version,
        )
        .await);
    }

    step.version += 1;
    step.last_updated = Some(now);
    step.execution_context.clear_dirty();
    Ok(())
}

/// Table, entity and id column of a versioned record.
type Record = (&'static str, &'static str, &'static str);

async fn update_context(
    conn: &mut SqliteConnection,
    sql: &str,
    record: Record,
    id: u64,
    version: u32,
    context: &mut ExecutionContext,
) -> Result<(), BatchError> {
    if !context.is_dirty() {
        return Ok(());
    }
    let result = sqlx::query(sql)
        .bind(context.to_json()?)
        .bind(id as i64)
        .bind(i64::from(version))
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    if result.rows_affected() == 0 {
        return Err(version_conflict(conn, record, id, version).await);
    }
    context.clear_dirty();
    Ok(())
}

async fn version_conflict(
    conn: &mut SqliteConnection,
    (table, entity, id_column): Record,
    id: u64,
    expected: u32,
) -> BatchError {
    let sql = format!("SELECT VERSION FROM {} WHERE {} = ?", table, id_column);
    let row = match sqlx::query(&sql)
        .bind(id as i64)
        .fetch_optional(&mut *conn)
        .await
    {
        Ok(row) => row,
        Err(error) => return db_error(error),
    };
    match row {
        Some(row) => match get_version(&row) {
            Ok(found) => check_version(entity, id, expected, found)
                .err()
                .unwrap_or_else(|| {
                    BatchError::Repository(format!("{} {} was not updated", entity, id))
                }),
            Err(error) => error,
        },
        None => BatchError::Repository(format!("{} {} does not exist", entity, id)),
    }
}

fn job_execution_from_row(row: &SqliteRow) -> Result<JobExecution, BatchError> {
    let instance = JobInstance {
        id: get_id(row, "JOB_INSTANCE_ID")?,
        job_name: get_text(row, "JOB_NAME")?,
        job_key: get_text(row, "JOB_KEY")?,
    };
    let parameters: JobParameters = serde_json::from_str(&get_text(row, "JOB_PARAMETERS")?)?;

    let mut execution = JobExecution::new(get_id(row, "JOB_EXECUTION_ID")?, instance, parameters);
    execution.version = get_version(row)?;
    execution.create_time = parse_time(&get_text(row, "CREATE_TIME")?)?;
    execution.start_time = get_time(row, "START_TIME")?;
    execution.end_time = get_time(row, "END_TIME")?;
    execution.last_updated = get_time(row, "LAST_UPDATED")?;
    execution.status = get_text(row, "STATUS")?.parse()?;
    execution.exit_status = ExitStatus {
        exit_code: get_text(row, "EXIT_CODE")?,
        exit_description: get_text(row, "EXIT_MESSAGE")?,
    };
    execution.execution_context = ExecutionContext::from_json(&get_text(row, "EXECUTION_CONTEXT")?)?;
    execution.failure_exceptions = serde_json::from_str(&get_text(row, "FAILURES")?)?;
    execution.skipped_steps = serde_json::from_str(&get_text(row, "SKIPPED_STEPS")?)?;
    Ok(execution)
}

fn step_execution_from_row(row: &SqliteRow) -> Result<StepExecution, BatchError> {
    let mut step = StepExecution::new(
        get_id(row, "STEP_EXECUTION_ID")?,
        get_id(row, "JOB_EXECUTION_ID")?,
        &get_text(row, "STEP_NAME")?,
    );
    step.version = get_version(row)?;
    step.status = get_text(row, "STATUS")?.parse()?;
    step.exit_status = ExitStatus {
        exit_code: get_text(row, "EXIT_CODE")?,
        exit_description: get_text(row, "EXIT_MESSAGE")?,
    };
    step.commit_count = get_count(row, "COMMIT_COUNT")?;
    step.read_count = get_count(row, "READ_COUNT")?;
    step.filter_count = get_count(row, "FILTER_COUNT")?;
    step.write_count = get_count(row, "WRITE_COUNT")?;
    step.read_skip_count = get_count(row, "READ_SKIP_COUNT")?;
    step.write_skip_count = get_count(row, "WRITE_SKIP_COUNT")?;
    step.process_skip_count = get_count(row, "PROCESS_SKIP_COUNT")?;
    step.rollback_count = get_count(row, "ROLLBACK_COUNT")?;
    step.start_time = get_time(row, "START_TIME")?;
    step.end_time = get_time(row, "END_TIME")?;
    step.last_updated = get_time(row, "LAST_UPDATED")?;
    step.execution_context = ExecutionContext::from_json(&get_text(row, "EXECUTION_CONTEXT")?)?;
    step.failure_exceptions = serde_json::from_str(&get_text(row, "FAILURES")?)?;
    let resumed_from: Option<i64> = row.try_get("RESUMED_FROM").map_err(db_error)?;
    step.resumed_from = resumed_from.map(|id| id as u64);
    Ok(step)
}

fn db_error(error: sqlx::Error) -> BatchError {
    BatchError::Repository(format!("SQLite error: {}", error))
}

fn get_text(row: &SqliteRow, column: &str) -> Result<String, BatchError> {
    row.try_get(column).map_err(db_error)
}

fn get_id(row: &SqliteRow, column: &str) -> Result<u64, BatchError> {
    let value: i64 = row.try_get(column).map_err(db_error)?;
    u64::try_from(value)
        .map_err(|_| BatchError::Repository(format!("invalid {} {}", column, value)))
}

fn get_count(row: &SqliteRow, column: &str) -> Result<usize, BatchError> {
    let value: i64 = row.try_get(column).map_err(db_error)?;
    usize::try_from(value)
        .map_err(|_| BatchError::Repository(format!("invalid {} {}", column, value)))
}

fn get_version(row: &SqliteRow) -> Result<u32, BatchError> {
    let value: i64 = row.try_get("VERSION").map_err(db_error)?;
    u32::try_from(value).map_err(|_| BatchError::Repository(format!("invalid VERSION {}", value)))
}

fn get_time(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, BatchError> {
    let value: Option<String> = row.try_get(column).map_err(db_error)?;
    value.as_deref().map(parse_time).transpose()
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, BatchError> {
    DateTime::parse_from_rfc3339(text)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|error| BatchError::Repository(format!("invalid timestamp {}: {}", text, error)))
}

fn to_text(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|time| time.to_rfc3339())
}
