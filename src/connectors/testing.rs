//! In-memory stand-ins for a database connection.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::{
    connection_url::ConnectionUrl,
    connectors::{Adapter, AdapterFactory, Dialect, Session, SpatialAdapter},
    query::Statement,
    schema::Row,
    DatumError, Result,
};

pub type StatementLog = Arc<Mutex<Vec<Statement>>>;

/// Records every statement and answers queries with canned rows, picked by
/// the first registered SQL fragment the statement contains. Commits,
/// rollbacks and closes are logged as `COMMIT`, `ROLLBACK` and `CLOSE`.
///
/// A statement matching a [`fail_on`](Self::fail_on) fragment fails and, as
/// on Postgres, leaves the transaction aborted: every later statement fails
/// until the next rollback.
#[derive(Clone, Default)]
pub struct RecordingSession {
    log: StatementLog,
    responses: Vec<(String, Vec<Row>)>,
    failures: Vec<String>,
    aborted: bool,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, fragment: &str, rows: Vec<Row>) -> Self {
        self.responses.push((fragment.to_string(), rows));
        self
    }

    pub fn fail_on(mut self, fragment: &str) -> Self {
        self.failures.push(fragment.to_string());
        self
    }

    pub fn log(&self) -> StatementLog {
        Arc::clone(&self.log)
    }

    fn record(&self, statement: Statement) {
        self.log.lock().expect("statement log poisoned").push(statement);
    }

    fn check(&mut self, statement: &Statement) -> Result<()> {
        if self.aborted {
            return Err(DatumError::statement(
                &statement.sql,
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        let fails = self.failures.iter().any(|f| statement.sql.contains(f.as_str()))
            || statement
                .params
                .iter()
                .flatten()
                .any(|p| self.failures.iter().any(|f| p.contains(f.as_str())));
        if fails {
            self.aborted = true;
            return Err(DatumError::statement(&statement.sql, "statement failed"));
        }
        Ok(())
    }

    fn rows_for(&self, sql: &str) -> Vec<Row> {
        self.responses
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Session for RecordingSession {
    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.record(statement.clone());
        self.check(statement)?;
        Ok(self.rows_for(&statement.sql))
    }

    async fn execute(&mut self, statement: &Statement) -> Result<()> {
        self.record(statement.clone());
        self.check(statement)
    }

    async fn execute_raw(&mut self, sql: &str) -> Result<Vec<Row>> {
        let statement = Statement::new(sql);
        self.record(statement.clone());
        self.check(&statement)?;
        Ok(self.rows_for(sql))
    }

    async fn commit(&mut self) -> Result<()> {
        self.record(Statement::new("COMMIT"));
        if self.aborted {
            return Err(DatumError::Connection("Failed to commit: transaction aborted".to_string()));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.record(Statement::new("ROLLBACK"));
        self.aborted = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.record(Statement::new("CLOSE"));
        Ok(())
    }
}

/// Factory handing out adapters over a [`RecordingSession`], so the
/// database facade can be driven without a server.
pub struct FakeFactory<D> {
    pub scheme: &'static str,
    pub dialect: D,
    pub session: RecordingSession,
}

#[async_trait]
impl<D> AdapterFactory for FakeFactory<D>
where
    D: Dialect + Clone + 'static,
{
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    async fn connect(&self, url: &ConnectionUrl) -> Result<Box<dyn Adapter>> {
        Ok(Box::new(SpatialAdapter::new(
            self.dialect.clone(),
            Box::new(self.session.clone()),
            url.clone(),
        )))
    }
}
