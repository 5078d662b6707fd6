pub mod oracle;
pub mod postgis;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    connection_url::ConnectionUrl,
    geometry::{GeometryEncoder, MeasureScrub, ProjTransformer, WktTransformer},
    query::{count_statement, ReadQuery, Statement},
    schema::{CanonicalType, FieldDescriptor, Row, TableMetadata, TableName, Value},
    typemap::{typed_value, TypeMap},
    writer::{chunk_ranges, BatchWriter, WriteOptions, WriteSummary},
    DatumError, Result,
};

/// A native database connection. Rows come back keyed by lower-cased
/// column name.
#[async_trait]
pub trait Session: Send {
    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    async fn execute(&mut self, statement: &Statement) -> Result<()>;

    /// Runs statements in order, stopping at the first failure.
    async fn execute_many(&mut self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            self.execute(statement).await?;
        }
        Ok(())
    }

    /// Unparameterized SQL. Statements that produce no rows yield an empty
    /// vector rather than an error.
    async fn execute_raw(&mut self, sql: &str) -> Result<Vec<Row>>;

    async fn commit(&mut self) -> Result<()>;

    /// Discards uncommitted work. A no-op when nothing is pending.
    async fn rollback(&mut self) -> Result<()>;

    /// Releases the connection. Uncommitted work is rolled back.
    async fn close(&mut self) -> Result<()>;
}

/// Everything that differs between spatial backends: type names, quoting,
/// placeholders, geometry functions, surrogate keys, DDL and the catalog
/// queries used for introspection.
#[async_trait]
pub trait Dialect: Send + Sync {
    fn type_map(&self) -> &TypeMap;

    fn geometry(&self) -> GeometryEncoder;

    /// Schema used for unqualified table names.
    fn default_schema(&self, url: &ConnectionUrl) -> String;

    fn quote_ident(&self, name: &str) -> String;

    fn qualified_name(&self, owner: &str, name: &str) -> String {
        format!("{}.{}", self.quote_ident(owner), self.quote_ident(name))
    }

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Placeholder wrapped in whatever conversion turns bound text into a
    /// value of `kind`.
    fn bind_expr(&self, kind: CanonicalType, index: usize) -> String;

    fn limit(&self, sql: String, limit: usize) -> String;

    /// Whether reads can reproject geometry in SQL.
    fn transforms_on_server(&self) -> bool;

    fn multi_row_insert(&self) -> bool;

    fn lob_last(&self) -> bool {
        false
    }

    /// Expression producing a fresh surrogate key for `meta`, if the backend
    /// requires one on insert.
    fn next_id_expr(&self, _meta: &TableMetadata) -> Option<String> {
        None
    }

    /// Lists base tables in `schema`; the result column is `table_name`.
    fn list_tables(&self, schema: &str) -> Statement;

    fn truncate(&self, table: &str, cascade: bool) -> Result<Vec<String>>;

    fn create_table(&self, table: &str, fields: &[FieldDescriptor]) -> Vec<String>;

    fn drop_table(&self, table: &str) -> String;

    fn create_view(&self, view: &str, select: &str) -> String;

    fn drop_view(&self, view: &str) -> String;

    fn create_materialized_view(&self, _view: &str, _select: &str) -> Result<String> {
        Err(DatumError::Unsupported(
            "materialized views are not supported by this backend".to_string(),
        ))
    }

    fn drop_materialized_view(&self, _view: &str) -> Result<String> {
        Err(DatumError::Unsupported(
            "materialized views are not supported by this backend".to_string(),
        ))
    }

    fn create_index(&self, meta: &TableMetadata, index: &str, fields: &[&FieldDescriptor]) -> String;

    fn drop_index(&self, owner: &str, index: &str) -> String;

    async fn introspect(
        &self,
        session: &mut dyn Session,
        owner: &str,
        table: &TableName,
    ) -> Result<TableMetadata>;
}

/// The operations every backend offers. `Database` and `Table` are thin
/// wrappers over one boxed `Adapter`.
#[async_trait]
pub trait Adapter: Send {
    fn url(&self) -> &ConnectionUrl;

    async fn table_names(&mut self) -> Result<Vec<String>>;

    async fn introspect(&mut self, table: &TableName) -> Result<TableMetadata>;

    async fn read(&mut self, meta: &TableMetadata, query: &ReadQuery) -> Result<Vec<Row>>;

    /// Inserts `rows`, committing after every chunk.
    async fn write(
        &mut self,
        meta: &TableMetadata,
        rows: &[Row],
        options: &WriteOptions,
    ) -> Result<WriteSummary>;

    async fn count(&mut self, meta: &TableMetadata, filter: Option<&str>) -> Result<u64>;

    async fn delete(&mut self, meta: &TableMetadata, cascade: bool) -> Result<()>;

    async fn create_table(&mut self, table: &TableName, fields: &[FieldDescriptor]) -> Result<()>;

    async fn drop_table(&mut self, table: &TableName) -> Result<()>;

    async fn create_view(&mut self, view: &TableName, select: &str) -> Result<()>;

    async fn drop_view(&mut self, view: &TableName) -> Result<()>;

    async fn create_materialized_view(&mut self, view: &TableName, select: &str) -> Result<()>;

    async fn drop_materialized_view(&mut self, view: &TableName) -> Result<()>;

    async fn create_index(
        &mut self,
        meta: &TableMetadata,
        fields: &[&str],
        name: Option<&str>,
    ) -> Result<String>;

    async fn drop_index(&mut self, meta: &TableMetadata, fields: &[&str], name: Option<&str>) -> Result<()>;

    async fn execute(&mut self, sql: &str) -> Result<Vec<Row>>;

    async fn save(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Default index name: `<table>_<field>[_<field>...]_idx`.
pub fn index_name(table: &str, fields: &[&str]) -> String {
    let mut name = table.to_lowercase();
    for field in fields {
        name.push('_');
        name.push_str(&field.to_lowercase());
    }
    name.push_str("_idx");
    name
}

/// The adapter shared by all backends; the dialect supplies the differences.
pub struct SpatialAdapter<D: Dialect> {
    dialect: D,
    session: Box<dyn Session>,
    url: ConnectionUrl,
    transformer: Arc<dyn WktTransformer>,
}

impl<D: Dialect> SpatialAdapter<D> {
    pub fn new(dialect: D, session: Box<dyn Session>, url: ConnectionUrl) -> Self {
        Self {
            dialect,
            session,
            url,
            transformer: Arc::new(ProjTransformer),
        }
    }

    /// Replaces the collaborator used for client-side reprojection.
    pub fn with_transformer(mut self, transformer: Arc<dyn WktTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    fn owner_of(&self, table: &TableName) -> String {
        table
            .schema
            .clone()
            .unwrap_or_else(|| self.dialect.default_schema(&self.url))
    }

    fn qualified(&self, table: &TableName) -> String {
        self.dialect.qualified_name(&self.owner_of(table), &table.name)
    }

    async fn run_ddl(&mut self, sql: &[String]) -> Result<()> {
        for statement in sql {
            debug!("{}", statement);
            if let Err(e) = self.session.execute(&Statement::new(statement.clone())).await {
                return Err(self.abandon(e).await);
            }
        }
        self.session.commit().await
    }

    /// Rolls back after a failed statement so the session stays usable, and
    /// hands the original error back.
    async fn abandon(&mut self, err: DatumError) -> DatumError {
        if let Err(rollback_err) = self.session.rollback().await {
            warn!("Rollback after failed statement also failed: {}", rollback_err);
        }
        err
    }

    fn decode_geometry(
        &self,
        meta: &TableMetadata,
        query: &ReadQuery,
        rows: &mut [Row],
    ) -> Result<()> {
        let Some(key) = query.geom_key(meta) else {
            return Ok(());
        };
        let Some(first) = rows.first() else {
            return Ok(());
        };

        let first_wkt = first.get(&key).and_then(Value::as_str).unwrap_or("");
        let scrub = MeasureScrub::detect(meta.geom_type(), first_wkt);

        let reproject = match (query.to_srid, meta.srid()) {
            (Some(to), Some(from)) if to != from && !self.dialect.transforms_on_server() => {
                Some((from, to))
            }
            (Some(to), None) if !self.dialect.transforms_on_server() => {
                warn!(
                    "SRID of {} is unknown; returning geometry untransformed instead of EPSG:{}",
                    meta.table, to
                );
                None
            }
            _ => None,
        };

        if scrub.is_none() && reproject.is_none() {
            return Ok(());
        }

        for row in rows.iter_mut() {
            if let Some(Value::String(wkt)) = row.get_mut(&key) {
                if let Some(scrub) = scrub {
                    *wkt = scrub.apply(wkt);
                }
                if let Some((from, to)) = reproject {
                    *wkt = self.transformer.transform(wkt, from, to)?;
                }
            }
        }
        Ok(())
    }
}

/// Types number and date columns that the driver handed back as text.
fn type_values(meta: &TableMetadata, query: &ReadQuery, rows: &mut [Row]) {
    let kinds: Vec<(String, CanonicalType)> = meta
        .fields
        .iter()
        .filter(|f| matches!(f.kind, CanonicalType::Num | CanonicalType::Date))
        .map(|f| (query.output_key(&f.name), f.kind))
        .collect();
    if kinds.is_empty() {
        return;
    }
    for row in rows.iter_mut() {
        for (key, kind) in &kinds {
            if let Some(value) = row.get_mut(key) {
                let text = std::mem::replace(value, Value::Null);
                *value = typed_value(*kind, text);
            }
        }
    }
}

#[async_trait]
impl<D: Dialect> Adapter for SpatialAdapter<D> {
    fn url(&self) -> &ConnectionUrl {
        &self.url
    }

    async fn table_names(&mut self) -> Result<Vec<String>> {
        let schema = self.dialect.default_schema(&self.url);
        let rows = self.session.query(&self.dialect.list_tables(&schema)).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("table_name").and_then(Value::as_str))
            .map(String::from)
            .collect())
    }

    async fn introspect(&mut self, table: &TableName) -> Result<TableMetadata> {
        let owner = self.owner_of(table);
        let meta = self
            .dialect
            .introspect(self.session.as_mut(), &owner, table)
            .await?;
        debug!(
            "Introspected {}: {} fields, geometry {:?}",
            meta.table,
            meta.fields.len(),
            meta.geometry
        );
        Ok(meta)
    }

    async fn read(&mut self, meta: &TableMetadata, query: &ReadQuery) -> Result<Vec<Row>> {
        let statement = query.build_select(meta, &self.dialect)?;
        debug!("{}", statement.sql);
        let mut rows = match self.session.query(&statement).await {
            Ok(rows) => rows,
            Err(e) => return Err(self.abandon(e).await),
        };
        if rows.is_empty() {
            return Ok(rows);
        }
        type_values(meta, query, &mut rows);
        self.decode_geometry(meta, query, &mut rows)?;
        Ok(rows)
    }

    async fn write(
        &mut self,
        meta: &TableMetadata,
        rows: &[Row],
        options: &WriteOptions,
    ) -> Result<WriteSummary> {
        let writer = BatchWriter::new(&self.dialect, meta);
        let Some(plan) = writer.plan(rows, options.from_srid)? else {
            return Ok(WriteSummary::default());
        };

        let ranges = chunk_ranges(rows.len(), options.chunk_size)?;
        let total_chunks = ranges.len();
        let mut summary = WriteSummary::default();

        for (index, range) in ranges.into_iter().enumerate() {
            let chunk = &rows[range];
            let statements = writer.render_chunk(&plan, chunk)?;
            if let Some(first) = statements.first() {
                debug!("{}", first.sql);
            }
            if let Err(e) = self.session.execute_many(&statements).await {
                return Err(self.abandon(e).await);
            }
            self.session.commit().await?;

            summary.rows += chunk.len();
            summary.chunks += 1;
            info!(
                "Committed chunk {}/{} ({} rows) into {}",
                index + 1,
                total_chunks,
                chunk.len(),
                meta.table
            );
            if let Some(progress) = &options.progress {
                progress.inc(chunk.len() as u64);
            }
        }

        Ok(summary)
    }

    async fn count(&mut self, meta: &TableMetadata, filter: Option<&str>) -> Result<u64> {
        let statement = count_statement(meta, &self.dialect, filter);
        debug!("{}", statement.sql);
        let rows = match self.session.query(&statement).await {
            Ok(rows) => rows,
            Err(e) => return Err(self.abandon(e).await),
        };
        let count = rows
            .first()
            .and_then(|row| row.get("row_count"))
            .and_then(Value::as_i64)
            .ok_or_else(|| DatumError::statement(&statement.sql, "count query returned no value"))?;
        Ok(count.max(0) as u64)
    }

    async fn delete(&mut self, meta: &TableMetadata, cascade: bool) -> Result<()> {
        let table = self.dialect.qualified_name(&meta.owner, &meta.table.name);
        let statements = self.dialect.truncate(&table, cascade)?;
        self.run_ddl(&statements).await?;
        info!("Deleted all rows from {}", meta.table);
        Ok(())
    }

    async fn create_table(&mut self, table: &TableName, fields: &[FieldDescriptor]) -> Result<()> {
        let statements = self.dialect.create_table(&self.qualified(table), fields);
        self.run_ddl(&statements).await
    }

    async fn drop_table(&mut self, table: &TableName) -> Result<()> {
        let statement = self.dialect.drop_table(&self.qualified(table));
        self.run_ddl(&[statement]).await
    }

    async fn create_view(&mut self, view: &TableName, select: &str) -> Result<()> {
        let statement = self.dialect.create_view(&self.qualified(view), select);
        self.run_ddl(&[statement]).await
    }

    async fn drop_view(&mut self, view: &TableName) -> Result<()> {
        let statement = self.dialect.drop_view(&self.qualified(view));
        self.run_ddl(&[statement]).await
    }

    async fn create_materialized_view(&mut self, view: &TableName, select: &str) -> Result<()> {
        let statement = self
            .dialect
            .create_materialized_view(&self.qualified(view), select)?;
        self.run_ddl(&[statement]).await
    }

    async fn drop_materialized_view(&mut self, view: &TableName) -> Result<()> {
        let statement = self.dialect.drop_materialized_view(&self.qualified(view))?;
        self.run_ddl(&[statement]).await
    }

    async fn create_index(
        &mut self,
        meta: &TableMetadata,
        fields: &[&str],
        name: Option<&str>,
    ) -> Result<String> {
        if fields.is_empty() {
            return Err(DatumError::Configuration(
                "an index needs at least one field".to_string(),
            ));
        }
        let descriptors = fields
            .iter()
            .map(|field| {
                meta.field(field).ok_or_else(|| DatumError::UnknownField {
                    table: meta.table.to_string(),
                    field: field.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let index = name
            .map(String::from)
            .unwrap_or_else(|| index_name(&meta.table.name, fields));
        let statement = self.dialect.create_index(meta, &index, &descriptors);
        self.run_ddl(&[statement]).await?;
        Ok(index)
    }

    async fn drop_index(&mut self, meta: &TableMetadata, fields: &[&str], name: Option<&str>) -> Result<()> {
        let index = name
            .map(String::from)
            .unwrap_or_else(|| index_name(&meta.table.name, fields));
        let statement = self.dialect.drop_index(&meta.owner, &index);
        self.run_ddl(&[statement]).await
    }

    async fn execute(&mut self, sql: &str) -> Result<Vec<Row>> {
        debug!("{}", sql);
        self.session.execute_raw(sql).await
    }

    async fn save(&mut self) -> Result<()> {
        self.session.commit().await
    }

    async fn close(&mut self) -> Result<()> {
        self.session.close().await?;
        info!("Closed connection to {}", self.url);
        Ok(())
    }
}

/// Connects adapters for one URL scheme.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    fn scheme(&self) -> &'static str;

    async fn connect(&self, url: &ConnectionUrl) -> Result<Box<dyn Adapter>>;
}

/// Scheme → adapter constructor. Resolved once when a database is opened.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `postgis` and `oracle-stgeom` adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(postgis::PostgisFactory));
        registry.register(Arc::new(oracle::OracleStGeomFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories
            .insert(factory.scheme().to_lowercase(), factory);
    }

    pub fn schemes(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn resolve(&self, scheme: &str) -> Result<Arc<dyn AdapterFactory>> {
        self.factories
            .get(&scheme.to_lowercase())
            .cloned()
            .ok_or_else(|| DatumError::UnsupportedBackend(scheme.to_string()))
    }
}
