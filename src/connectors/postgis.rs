use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow},
    query::Query,
    Column, PgPool, Postgres, Row as SqlxRow, Transaction, TypeInfo,
};
use tracing::{info, warn};

use crate::{
    connection_url::ConnectionUrl,
    connectors::{Adapter, AdapterFactory, Dialect, Session, SpatialAdapter},
    geometry::{GeometryEncoder, POSTGIS_FUNCTIONS},
    query::Statement,
    schema::{
        CanonicalType, FieldDescriptor, GeometryColumn, Row, TableMetadata, TableName, Value,
    },
    typemap::{TypeMap, POSTGIS_TYPES},
    DatumError, Result,
};

const DEFAULT_PORT: u16 = 5432;

/// PostgreSQL with the PostGIS extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgisDialect;

#[async_trait]
impl Dialect for PostgisDialect {
    fn type_map(&self) -> &TypeMap {
        &POSTGIS_TYPES
    }

    fn geometry(&self) -> GeometryEncoder {
        GeometryEncoder::new(POSTGIS_FUNCTIONS)
    }

    fn default_schema(&self, url: &ConnectionUrl) -> String {
        url.schema.clone().unwrap_or_else(|| "public".to_string())
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn bind_expr(&self, kind: CanonicalType, index: usize) -> String {
        match kind {
            CanonicalType::Num => format!("CAST(${} AS NUMERIC)", index),
            CanonicalType::Date => format!("CAST(${} AS TIMESTAMP)", index),
            _ => self.placeholder(index),
        }
    }

    fn limit(&self, sql: String, limit: usize) -> String {
        format!("{} LIMIT {}", sql, limit)
    }

    fn transforms_on_server(&self) -> bool {
        true
    }

    fn multi_row_insert(&self) -> bool {
        true
    }

    fn list_tables(&self, schema: &str) -> Statement {
        Statement::new(
            "SELECT table_name::text AS table_name FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .bind(schema)
    }

    fn truncate(&self, table: &str, cascade: bool) -> Result<Vec<String>> {
        let mut sql = format!("TRUNCATE {} RESTART IDENTITY", table);
        if cascade {
            sql.push_str(" CASCADE");
        }
        Ok(vec![sql])
    }

    fn create_table(&self, table: &str, fields: &[FieldDescriptor]) -> Vec<String> {
        let mut columns = vec!["id serial PRIMARY KEY".to_string()];
        for field in fields.iter().filter(|f| !f.name.eq_ignore_ascii_case("id")) {
            let not_null = if field.nullable { "" } else { " NOT NULL" };
            columns.push(format!(
                "{} {}{}",
                self.quote_ident(&field.name),
                POSTGIS_TYPES.ddl_type(field.kind),
                not_null
            ));
        }
        vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table,
            columns.join(", ")
        )]
    }

    fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", table)
    }

    fn create_view(&self, view: &str, select: &str) -> String {
        format!("CREATE OR REPLACE VIEW {} AS {}", view, select)
    }

    fn drop_view(&self, view: &str) -> String {
        format!("DROP VIEW IF EXISTS {}", view)
    }

    fn create_materialized_view(&self, view: &str, select: &str) -> Result<String> {
        Ok(format!(
            "CREATE MATERIALIZED VIEW IF NOT EXISTS {} AS {}",
            view, select
        ))
    }

    fn drop_materialized_view(&self, view: &str) -> Result<String> {
        Ok(format!("DROP MATERIALIZED VIEW IF EXISTS {}", view))
    }

    fn create_index(&self, meta: &TableMetadata, index: &str, fields: &[&FieldDescriptor]) -> String {
        let spatial = fields.iter().any(|f| f.kind == CanonicalType::Geom);
        let columns = fields
            .iter()
            .map(|f| self.quote_ident(&f.name))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}{} ({})",
            self.quote_ident(index),
            self.qualified_name(&meta.owner, &meta.table.name),
            if spatial { " USING GIST" } else { "" },
            columns
        )
    }

    fn drop_index(&self, owner: &str, index: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", self.qualified_name(owner, index))
    }

    async fn introspect(
        &self,
        session: &mut dyn Session,
        owner: &str,
        table: &TableName,
    ) -> Result<TableMetadata> {
        let columns = session
            .query(
                &Statement::new(
                    "SELECT column_name::text AS column_name, data_type::text AS data_type, \
                     udt_name::text AS udt_name, is_nullable::text AS is_nullable \
                     FROM information_schema.columns \
                     WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                )
                .bind(owner)
                .bind(table.name.as_str()),
            )
            .await?;
        if columns.is_empty() {
            return Err(DatumError::TableNotFound(table.to_string()));
        }

        let mut fields = Vec::with_capacity(columns.len());
        for column in &columns {
            let name = text(column, "column_name");
            let data_type = text(column, "data_type");
            // PostGIS types surface as USER-DEFINED; the udt name says which.
            let native = if data_type.eq_ignore_ascii_case("USER-DEFINED") {
                text(column, "udt_name")
            } else {
                data_type
            };
            let kind = POSTGIS_TYPES.resolve(&name, &native)?;
            let mut field = FieldDescriptor::new(name, kind);
            field.nullable = !text(column, "is_nullable").eq_ignore_ascii_case("NO");
            fields.push(field);
        }

        let mut meta = TableMetadata::new(table.clone(), owner, fields)?;
        let qualified = self.qualified_name(owner, &table.name);

        if let Some(geom) = meta.geom_field_name().map(String::from) {
            let registered = session
                .query(
                    &Statement::new(
                        "SELECT srid, type::text AS type FROM geometry_columns \
                         WHERE f_table_schema = $1 AND f_table_name = $2 AND f_geometry_column = $3",
                    )
                    .bind(owner)
                    .bind(table.name.as_str())
                    .bind(geom.as_str()),
                )
                .await?;
            let registered = registered.first();

            let srid = registered
                .and_then(|row| row.get("srid"))
                .and_then(Value::as_i64)
                .filter(|srid| *srid > 0)
                .map(|srid| srid as i32);
            if srid.is_none() {
                warn!("SRID of {}.{} is unknown", table, geom);
            }

            let mut geom_type = registered
                .map(|row| text(row, "type").to_uppercase())
                .filter(|t| !t.is_empty() && t != "GEOMETRY");
            if geom_type.is_none() {
                let sample = session
                    .query(&Statement::new(format!(
                        "SELECT GeometryType({col}) AS geom_type FROM {table} WHERE {col} IS NOT NULL LIMIT 1",
                        col = self.quote_ident(&geom),
                        table = qualified
                    )))
                    .await?;
                geom_type = sample
                    .first()
                    .map(|row| text(row, "geom_type").to_uppercase())
                    .filter(|t| !t.is_empty());
            }

            meta.geometry = Some(GeometryColumn {
                field: geom,
                geom_type: geom_type.unwrap_or_else(|| "GEOMETRY".to_string()),
                srid,
            });
        }

        let pk = session
            .query(
                &Statement::new(
                    "SELECT a.attname::text AS pk FROM pg_index i \
                     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                     WHERE i.indrelid = CAST($1 AS regclass) AND i.indisprimary",
                )
                .bind(qualified),
            )
            .await?;
        meta.pk_field = pk.first().map(|row| text(row, "pk")).filter(|pk| !pk.is_empty());

        Ok(meta)
    }
}

fn text(row: &Row, key: &str) -> String {
    match row.get(key) {
        Some(Value::Null) | None => String::new(),
        Some(value) => value.to_string(),
    }
}

/// One connection with one open transaction; `commit` ends it and the next
/// statement starts another.
pub struct PgSession {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    pub async fn connect(url: &ConnectionUrl) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(url.host.as_deref().unwrap_or("localhost"))
            .port(url.port.unwrap_or(DEFAULT_PORT));
        if let Some(user) = &url.user {
            options = options.username(user);
        }
        if let Some(password) = &url.password {
            options = options.password(password);
        }
        if let Some(db) = &url.db_name {
            options = options.database(db);
        }

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| DatumError::Connection(format!("Failed to connect to PostGIS: {}", e)))?;

        Ok(Self { pool, tx: None })
    }

    async fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        if self.tx.is_none() {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatumError::Connection(format!("Failed to begin transaction: {}", e)))?;
            self.tx = Some(tx);
        }
        self.tx
            .as_mut()
            .ok_or_else(|| DatumError::Connection("No open transaction".to_string()))
    }

    /// A failed statement aborts the Postgres transaction; every later
    /// statement in it would fail too, so it is rolled back here.
    async fn abandon(&mut self, err: DatumError) -> DatumError {
        if let Err(rollback_err) = self.rollback().await {
            warn!("Rollback after failed statement also failed: {}", rollback_err);
        }
        err
    }
}

fn bind_all<'q>(sql: &'q str, params: &'q [Option<String>]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| query.bind(param.as_deref()))
}

#[async_trait]
impl Session for PgSession {
    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        let tx = self.tx().await?;
        let result = bind_all(&statement.sql, &statement.params)
            .fetch_all(&mut **tx)
            .await;
        match result {
            Ok(rows) => rows.iter().map(convert_row).collect(),
            Err(e) => Err(self.abandon(DatumError::statement(&statement.sql, e)).await),
        }
    }

    async fn execute(&mut self, statement: &Statement) -> Result<()> {
        let tx = self.tx().await?;
        let result = bind_all(&statement.sql, &statement.params)
            .execute(&mut **tx)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.abandon(DatumError::statement(&statement.sql, e)).await),
        }
    }

    async fn execute_raw(&mut self, sql: &str) -> Result<Vec<Row>> {
        let tx = self.tx().await?;
        let result = sqlx::query(sql).fetch_all(&mut **tx).await;
        match result {
            Ok(rows) => rows.iter().map(convert_row).collect(),
            Err(e) => Err(self.abandon(DatumError::statement(sql, e)).await),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .map_err(|e| DatumError::Connection(format!("Failed to commit: {}", e)))?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback()
                .await
                .map_err(|e| DatumError::Connection(format!("Failed to roll back: {}", e)))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.rollback().await?;
        self.pool.close().await;
        Ok(())
    }
}

fn convert_row(row: &PgRow) -> Result<Row> {
    let mut out = Row::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = extract_value(row, column.ordinal(), column.type_info().name())?;
        out.insert(column.name().to_lowercase(), value);
    }
    Ok(out)
}

fn extract_value(row: &PgRow, index: usize, type_name: &str) -> Result<Value> {
    let decode_err = |e: sqlx::Error| {
        DatumError::General(anyhow::anyhow!(
            "Failed to decode {} column {}: {}",
            type_name,
            index,
            e
        ))
    };

    let value = match type_name {
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map_err(decode_err)?
            .map(|v| Value::Integer(v as i64)),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map_err(decode_err)?
            .map(|v| Value::Integer(v as i64)),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map_err(decode_err)?
            .map(Value::Integer),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map_err(decode_err)?
            .map(|v| Value::Float(v as f64)),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)
            .map_err(decode_err)?
            .map(Value::Float),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(index)
            .map_err(decode_err)?
            .map(Value::Decimal),
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map_err(decode_err)?
            .map(Value::Boolean),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map_err(decode_err)?
            .map(Value::Date),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map_err(decode_err)?
            .map(|dt| Value::Date(DateTime::from_naive_utc_and_offset(dt, Utc))),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)
            .map_err(decode_err)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Value::Date(DateTime::from_naive_utc_and_offset(dt, Utc))),
        _ => row
            .try_get::<Option<String>, _>(index)
            .map_err(decode_err)?
            .map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Opens `postgis://` URLs.
pub struct PostgisFactory;

#[async_trait]
impl AdapterFactory for PostgisFactory {
    fn scheme(&self) -> &'static str {
        "postgis"
    }

    async fn connect(&self, url: &ConnectionUrl) -> Result<Box<dyn Adapter>> {
        let session = PgSession::connect(url).await?;
        info!("Connected to {}", url);
        Ok(Box::new(SpatialAdapter::new(
            PostgisDialect,
            Box::new(session),
            url.clone(),
        )))
    }
}
