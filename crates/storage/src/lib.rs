use std::future::Future;
use std::path::{Path, PathBuf};
use std::{
    sync::mpsc::{self, Receiver, Sender},
    thread,
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    Connection, params, params_from_iter,
    types::{Value, ValueRef},
};
use tokio::{sync::oneshot, task};
use tracing::{debug, info, warn};

mod accounts;

pub use accounts::{Account, AccountStore};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open database at {path}: {reason}")]
    ConnectionFailed { path: PathBuf, reason: String },

    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("expected one row but found none")]
    NotFound,

    #[error("transaction rolled back: {0}")]
    TransactionFailed(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SqlValue {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

pub trait ToSql: Send + Sync {
    fn to_sql_value(&self) -> SqlValue;
}

impl ToSql for bool {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Boolean(*self)
    }
}

impl ToSql for i64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(*self)
    }
}

impl ToSql for i32 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }
}

impl ToSql for i8 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }
}

impl ToSql for u64 {
    fn to_sql_value(&self) -> SqlValue {
        // SQLite integers are signed 64-bit.
        SqlValue::Integer(i64::try_from(*self).unwrap_or(i64::MAX))
    }
}

impl ToSql for u32 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }
}

impl ToSql for f64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Real(*self)
    }
}

impl ToSql for String {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.clone())
    }
}

impl ToSql for str {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.to_string())
    }
}

impl ToSql for &str {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text((*self).to_string())
    }
}

impl ToSql for Vec<u8> {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Blob(self.clone())
    }
}

impl ToSql for DateTime<Utc> {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(timestamp(self))
    }
}

impl<T> ToSql for Option<T>
where
    T: ToSql,
{
    fn to_sql_value(&self) -> SqlValue {
        match self {
            Some(value) => value.to_sql_value(),
            None => SqlValue::Null,
        }
    }
}

/// Canonical text form of a stored timestamp. Fixed width, so text order is
/// time order inside SQL.
pub fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| StorageError::QueryFailed(format!("bad timestamp '{value}': {error}")))
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn text(&self, index: usize, column: &str) -> Result<String, StorageError> {
        match self.get(index) {
            Some(SqlValue::Text(s)) => Ok(s.clone()),
            _ => Err(StorageError::QueryFailed(format!("missing {column} column"))),
        }
    }

    pub fn opt_text(&self, index: usize) -> Option<String> {
        match self.get(index) {
            Some(SqlValue::Text(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn integer(&self, index: usize, column: &str) -> Result<i64, StorageError> {
        match self.get(index) {
            Some(SqlValue::Integer(i)) => Ok(*i),
            Some(SqlValue::Boolean(b)) => Ok(i64::from(*b)),
            _ => Err(StorageError::QueryFailed(format!("missing {column} column"))),
        }
    }

    pub fn real(&self, index: usize, column: &str) -> Result<f64, StorageError> {
        match self.get(index) {
            Some(SqlValue::Real(r)) => Ok(*r),
            Some(SqlValue::Integer(i)) => Ok(*i as f64),
            _ => Err(StorageError::QueryFailed(format!("missing {column} column"))),
        }
    }

    pub fn flag(&self, index: usize, column: &str) -> Result<bool, StorageError> {
        self.integer(index, column).map(|i| i != 0)
    }

    pub fn timestamp(&self, index: usize, column: &str) -> Result<DateTime<Utc>, StorageError> {
        parse_timestamp(&self.text(index, column)?)
    }

    pub fn opt_timestamp(&self, index: usize) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.opt_text(index)
            .map(|s| parse_timestamp(&s))
            .transpose()
    }
}

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, StorageError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(row.clone())
    }
}

impl FromRow for i64 {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        row.integer(0, "value")
    }
}

impl FromRow for String {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        row.text(0, "value")
    }
}

/// One statement of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: &[&dyn ToSql]) -> Self {
        Self {
            sql: sql.into(),
            params: collect_params(params),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

pub trait Database: Send + Sync + 'static {
    fn execute(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Run every statement in one transaction. Returns rows affected per
    /// statement; nothing is applied if any statement fails.
    fn execute_batch(
        &self,
        statements: Vec<Statement>,
    ) -> impl Future<Output = Result<Vec<u64>, StorageError>> + Send;

    fn query<T: FromRow + Send>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> impl Future<Output = Result<Vec<T>, StorageError>> + Send;

    fn query_one<T: FromRow + Send>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> impl Future<Output = Result<T, StorageError>> + Send;
}

#[derive(Debug)]
pub struct NativeDatabase {
    path: PathBuf,
    writer: Sender<WriteCommand>,
}

enum WriteCommand {
    Execute {
        statement: Statement,
        response: oneshot::Sender<Result<u64, StorageError>>,
    },
    Batch {
        statements: Vec<Statement>,
        response: oneshot::Sender<Result<Vec<u64>, StorageError>>,
    },
}

enum WriterState {
    Ready(Connection),
    Failed(String),
}

/// Pause before the single local retry of a failed write.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

fn collect_params(params: &[&dyn ToSql]) -> Vec<SqlValue> {
    params.iter().map(|param| param.to_sql_value()).collect()
}

fn sql_value_to_rusqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(integer) => Value::Integer(*integer),
        SqlValue::Real(real) => Value::Real(*real),
        SqlValue::Text(text) => Value::Text(text.clone()),
        SqlValue::Blob(bytes) => Value::Blob(bytes.clone()),
        SqlValue::Boolean(boolean) => Value::Integer(i64::from(*boolean)),
    }
}

fn sql_values_to_rusqlite_values(values: &[SqlValue]) -> Vec<Value> {
    values.iter().map(sql_value_to_rusqlite_value).collect()
}

fn value_ref_to_sql_value(value_ref: ValueRef<'_>) -> SqlValue {
    match value_ref {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(integer) => SqlValue::Integer(integer),
        ValueRef::Real(real) => SqlValue::Real(real),
        ValueRef::Text(text) => SqlValue::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| StorageError::ConnectionFailed {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
    }

    Connection::open(path).map_err(|error| StorageError::ConnectionFailed {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

fn configure_native_connection(connection: &Connection, path: &Path) -> Result<(), StorageError> {
    let failed = |error: rusqlite::Error| StorageError::ConnectionFailed {
        path: path.to_path_buf(),
        reason: error.to_string(),
    };
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(failed)?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .map_err(failed)?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .map_err(failed)?;
    Ok(())
}

fn open_native_connection(path: &Path) -> Result<Connection, StorageError> {
    let connection = open_connection(path)?;
    configure_native_connection(&connection, path)?;
    Ok(connection)
}

fn execute_statement(connection: &Connection, statement: &Statement) -> Result<u64, StorageError> {
    let values = sql_values_to_rusqlite_values(&statement.params);

    connection
        .execute(&statement.sql, params_from_iter(values.iter()))
        .map(|rows_affected| rows_affected as u64)
        .map_err(|error| StorageError::QueryFailed(error.to_string()))
}

fn execute_in_transaction(
    connection: &Connection,
    statements: &[Statement],
) -> Result<Vec<u64>, StorageError> {
    let tx = connection
        .unchecked_transaction()
        .map_err(|error| StorageError::TransactionFailed(error.to_string()))?;

    let mut affected = Vec::with_capacity(statements.len());
    for statement in statements {
        // Dropping `tx` on error rolls the batch back.
        let rows = execute_statement(&tx, statement)
            .map_err(|error| StorageError::TransactionFailed(error.to_string()))?;
        affected.push(rows);
    }

    tx.commit()
        .map_err(|error| StorageError::TransactionFailed(error.to_string()))?;
    Ok(affected)
}

fn query_rows(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, StorageError> {
    let mut statement = connection
        .prepare(sql)
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
    let values = sql_values_to_rusqlite_values(params);
    let column_count = statement.column_count();
    let mut rows = statement
        .query(params_from_iter(values.iter()))
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
    let mut output = Vec::new();

    while let Some(row) = rows
        .next()
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?
    {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let value = row
                .get_ref(index)
                .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
            values.push(value_ref_to_sql_value(value));
        }
        output.push(Row::new(values));
    }

    Ok(output)
}

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/001_initial.sql"),
}];

fn run_migrations(connection: &Connection) -> Result<(), StorageError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|error| StorageError::MigrationFailed {
            version: 0,
            reason: format!("failed to create _migrations table: {error}"),
        })?;

    for migration in MIGRATIONS {
        let is_applied: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                params![migration.version],
                |row| row.get(0),
            )
            .map_err(|error| StorageError::MigrationFailed {
                version: migration.version,
                reason: format!("failed to query migration state: {error}"),
            })?;

        if is_applied != 0 {
            continue;
        }

        let tx =
            connection
                .unchecked_transaction()
                .map_err(|error| StorageError::MigrationFailed {
                    version: migration.version,
                    reason: format!("failed to begin transaction: {error}"),
                })?;

        tx.execute_batch(migration.sql)
            .map_err(|error| StorageError::MigrationFailed {
                version: migration.version,
                reason: error.to_string(),
            })?;

        tx.execute(
            "INSERT INTO _migrations (version) VALUES (?1)",
            params![migration.version],
        )
        .map_err(|error| StorageError::MigrationFailed {
            version: migration.version,
            reason: format!("failed to record migration: {error}"),
        })?;

        tx.commit().map_err(|error| StorageError::MigrationFailed {
            version: migration.version,
            reason: format!("failed to commit migration: {error}"),
        })?;

        info!(version = migration.version, "applied migration");
    }

    Ok(())
}

fn run_writer(path: PathBuf, receiver: Receiver<WriteCommand>) {
    let state = match open_native_connection(&path) {
        Ok(connection) => WriterState::Ready(connection),
        Err(error) => WriterState::Failed(error.to_string()),
    };

    let unavailable = |reason: &String| StorageError::ConnectionFailed {
        path: path.clone(),
        reason: reason.clone(),
    };

    while let Ok(command) = receiver.recv() {
        match command {
            WriteCommand::Execute {
                statement,
                response,
            } => {
                let result = match &state {
                    WriterState::Ready(connection) => execute_statement(connection, &statement),
                    WriterState::Failed(reason) => Err(unavailable(reason)),
                };
                let _ = response.send(result);
            }
            WriteCommand::Batch {
                statements,
                response,
            } => {
                let result = match &state {
                    WriterState::Ready(connection) => {
                        execute_in_transaction(connection, &statements)
                    }
                    WriterState::Failed(reason) => Err(unavailable(reason)),
                };
                let _ = response.send(result);
            }
        }
    }

    debug!("storage writer stopped");
}

impl NativeDatabase {
    async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let setup_path = path.clone();

        task::spawn_blocking(move || {
            let connection = open_native_connection(&setup_path)?;
            run_migrations(&connection)?;
            Ok(())
        })
        .await
        .map_err(|error| StorageError::ConnectionFailed {
            path: path.clone(),
            reason: format!("failed to join native storage setup task: {error}"),
        })??;

        let (writer, receiver) = mpsc::channel();
        let writer_path = path.clone();

        thread::Builder::new()
            .name("storage_writer".to_string())
            .spawn(move || run_writer(writer_path, receiver))
            .map_err(|error| StorageError::ConnectionFailed {
                path: path.clone(),
                reason: format!("failed to spawn storage_writer task: {error}"),
            })?;

        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn submit<R>(
        &self,
        command: WriteCommand,
        response: oneshot::Receiver<Result<R, StorageError>>,
    ) -> Result<R, StorageError> {
        self.writer.send(command).map_err(|_| {
            StorageError::QueryFailed("storage writer task is unavailable".to_string())
        })?;

        response.await.map_err(|_| {
            StorageError::QueryFailed(
                "storage writer task terminated before responding".to_string(),
            )
        })?
    }

    async fn write_once(&self, statement: Statement) -> Result<u64, StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        let command = WriteCommand::Execute {
            statement,
            response: response_tx,
        };
        self.submit(command, response_rx).await
    }

    async fn batch_once(&self, statements: Vec<Statement>) -> Result<Vec<u64>, StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        let command = WriteCommand::Batch {
            statements,
            response: response_tx,
        };
        self.submit(command, response_rx).await
    }
}

impl Database for NativeDatabase {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError> {
        let statement = Statement::new(sql, params);
        match self.write_once(statement.clone()).await {
            Ok(rows) => Ok(rows),
            Err(error) => {
                warn!(error = %error, sql = statement.sql(), "write failed, retrying once");
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
                self.write_once(statement).await
            }
        }
    }

    async fn execute_batch(&self, statements: Vec<Statement>) -> Result<Vec<u64>, StorageError> {
        if statements.is_empty() {
            return Ok(Vec::new());
        }
        match self.batch_once(statements.clone()).await {
            Ok(rows) => Ok(rows),
            Err(error) => {
                warn!(error = %error, statements = statements.len(), "batch failed, retrying once");
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
                self.batch_once(statements).await
            }
        }
    }

    async fn query<T: FromRow + Send>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError> {
        let sql = sql.to_string();
        let params = collect_params(params);
        let path = self.path.clone();
        let rows = task::spawn_blocking(move || {
            let connection = open_native_connection(&path)?;
            query_rows(&connection, &sql, &params)
        })
        .await
        .map_err(|error| {
            StorageError::QueryFailed(format!("failed to join query task: {error}"))
        })??;

        rows.iter().map(T::from_row).collect()
    }

    async fn query_one<T: FromRow + Send>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<T, StorageError> {
        let mut rows = self.query(sql, params).await?;
        if rows.is_empty() {
            return Err(StorageError::NotFound);
        }

        Ok(rows.remove(0))
    }
}

pub async fn open_database(path: &Path) -> Result<NativeDatabase, StorageError> {
    NativeDatabase::open(path).await
}
