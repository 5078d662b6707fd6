//! Batch insert planning.
//!
//! A batch is planned once from its first row (column set, LOB ordering,
//! surrogate key injection, multi-part casting) and then rendered chunk by
//! chunk. Each chunk is committed on its own, so a failure in chunk `k`
//! leaves chunks `1..k` in the table; callers recover by re-reading.

use indicatif::ProgressBar;
use std::ops::Range;

use crate::{
    connectors::Dialect,
    geometry::{empty_literal, is_empty, needs_force_multi},
    query::Statement,
    schema::{CanonicalType, Row, TableMetadata, Value},
    typemap::prepare_value,
    DatumError, Result,
};

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// SRID of the incoming WKT. Defaults to the table SRID.
    pub from_srid: Option<i32>,
    /// Rows per committed chunk. `None` writes the batch as one unit.
    pub chunk_size: Option<usize>,
    /// Advanced by the number of rows in each committed chunk.
    pub progress: Option<ProgressBar>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_srid(mut self, srid: i32) -> Self {
        self.from_srid = Some(srid);
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    pub fn progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSummary {
    pub rows: usize,
    pub chunks: usize,
}

/// Splits `len` rows into ordered, non-overlapping chunk ranges.
pub fn chunk_ranges(len: usize, chunk_size: Option<usize>) -> Result<Vec<Range<usize>>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let size = match chunk_size {
        Some(0) => {
            return Err(DatumError::Configuration(
                "chunk size must be greater than zero".to_string(),
            ))
        }
        Some(size) if size < len => size,
        _ => len,
    };
    Ok((0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
enum ColumnSource {
    /// Bound from the row key `key`.
    Value { key: String, kind: CanonicalType },
    /// Bound from the row key `key` through the geometry codec.
    Geometry { key: String },
    /// Backend expression, nothing bound.
    Expression(String),
}

#[derive(Debug, Clone, PartialEq)]
struct PlannedColumn {
    name: String,
    source: ColumnSource,
}

/// Bind parameters one statement may carry; the Postgres protocol sends the
/// count as a `u16`.
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Column layout and geometry handling shared by every chunk of a batch.
#[derive(Debug, Clone)]
pub struct WritePlan {
    table_sql: String,
    columns: Vec<PlannedColumn>,
    geom_type: Option<String>,
    source_srid: Option<i32>,
    target_srid: Option<i32>,
    force_multi: bool,
}

impl WritePlan {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn force_multi(&self) -> bool {
        self.force_multi
    }

    /// Columns that take a bind parameter per row.
    fn bound_columns(&self) -> usize {
        self.columns
            .iter()
            .filter(|c| !matches!(c.source, ColumnSource::Expression(_)))
            .count()
    }
}

pub struct BatchWriter<'a> {
    dialect: &'a dyn Dialect,
    meta: &'a TableMetadata,
}

impl<'a> BatchWriter<'a> {
    pub fn new(dialect: &'a dyn Dialect, meta: &'a TableMetadata) -> Self {
        Self { dialect, meta }
    }

    /// Plans a batch from the keys of its first row.
    pub fn plan(&self, rows: &[Row], from_srid: Option<i32>) -> Result<Option<WritePlan>> {
        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let mut columns = Vec::with_capacity(first.len() + 1);
        for key in first.keys() {
            let field = self.meta.field(key).ok_or_else(|| DatumError::UnknownField {
                table: self.meta.table.to_string(),
                field: key.clone(),
            })?;
            let source = match field.kind {
                CanonicalType::Geom => ColumnSource::Geometry { key: key.clone() },
                kind => ColumnSource::Value {
                    key: key.clone(),
                    kind,
                },
            };
            columns.push(PlannedColumn {
                name: field.name.clone(),
                source,
            });
        }

        if self.dialect.lob_last() {
            let (mut plain, lobs): (Vec<_>, Vec<_>) = columns.into_iter().partition(|c| {
                !matches!(c.source, ColumnSource::Value { kind: CanonicalType::Lob, .. })
            });
            plain.extend(lobs);
            columns = plain;
        }

        if let (Some(objectid), Some(next_id)) =
            (&self.meta.objectid_field, self.dialect.next_id_expr(self.meta))
        {
            if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(objectid)) {
                columns.insert(
                    0,
                    PlannedColumn {
                        name: objectid.clone(),
                        source: ColumnSource::Expression(next_id),
                    },
                );
            }
        }

        let geom_key = columns.iter().find_map(|c| match &c.source {
            ColumnSource::Geometry { key } => Some(key.as_str()),
            _ => None,
        });
        let sample = geom_key.and_then(|key| {
            rows.iter()
                .filter_map(|row| row.get(key).and_then(Value::as_str))
                .find(|wkt| !is_empty(wkt))
        });
        let force_multi = needs_force_multi(self.meta.geom_type(), sample);

        Ok(Some(WritePlan {
            table_sql: self
                .dialect
                .qualified_name(&self.meta.owner, &self.meta.table.name),
            columns,
            geom_type: self.meta.geom_type().map(String::from),
            source_srid: from_srid.or(self.meta.srid()),
            target_srid: self.meta.srid(),
            force_multi,
        }))
    }

    /// Renders one chunk: multi-row INSERTs where the backend takes them,
    /// otherwise one INSERT per row sharing the same SQL text. Multi-row
    /// statements are split so none binds more than [`MAX_BIND_PARAMS`].
    pub fn render_chunk(&self, plan: &WritePlan, rows: &[Row]) -> Result<Vec<Statement>> {
        let column_list = plan
            .columns
            .iter()
            .map(|c| self.dialect.quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        if self.dialect.multi_row_insert() {
            let rows_per_statement = (MAX_BIND_PARAMS / plan.bound_columns().max(1)).max(1);
            let mut statements = Vec::new();
            for group in rows.chunks(rows_per_statement) {
                let mut params = Vec::with_capacity(group.len() * plan.columns.len());
                let mut tuples = Vec::with_capacity(group.len());
                for row in group {
                    tuples.push(self.render_tuple(plan, row, &mut params)?);
                }
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES {}",
                    plan.table_sql,
                    column_list,
                    tuples.join(", ")
                );
                statements.push(Statement::with_params(sql, params));
            }
            return Ok(statements);
        }

        rows.iter()
            .map(|row| {
                let mut params = Vec::with_capacity(plan.columns.len());
                let tuple = self.render_tuple(plan, row, &mut params)?;
                Ok(Statement::with_params(
                    format!("INSERT INTO {} ({}) VALUES {}", plan.table_sql, column_list, tuple),
                    params,
                ))
            })
            .collect()
    }

    fn render_tuple(
        &self,
        plan: &WritePlan,
        row: &Row,
        params: &mut Vec<Option<String>>,
    ) -> Result<String> {
        let encoder = self.dialect.geometry();
        let mut exprs = Vec::with_capacity(plan.columns.len());

        for column in &plan.columns {
            match &column.source {
                ColumnSource::Expression(expr) => exprs.push(expr.clone()),
                ColumnSource::Value { key, kind } => {
                    let value = row.get(key).unwrap_or(&Value::Null);
                    params.push(prepare_value(&column.name, *kind, value)?);
                    exprs.push(self.dialect.bind_expr(*kind, params.len()));
                }
                ColumnSource::Geometry { key } => {
                    let wkt = match row.get(key).unwrap_or(&Value::Null) {
                        Value::Null => empty_literal(plan.geom_type.as_deref()),
                        Value::String(s) if is_empty(s) => {
                            if s.trim().is_empty() {
                                empty_literal(plan.geom_type.as_deref())
                            } else {
                                s.trim().to_string()
                            }
                        }
                        Value::String(s) => s.clone(),
                        other => {
                            return Err(DatumError::InvalidValue {
                                field: column.name.clone(),
                                message: format!("expected WKT text, got '{}'", other),
                            })
                        }
                    };
                    let placeholder = self.dialect.placeholder(params.len() + 1);
                    let encoded = encoder.encode(
                        &placeholder,
                        &wkt,
                        plan.source_srid,
                        plan.target_srid,
                        plan.force_multi,
                    );
                    params.push(Some(encoded.wkt));
                    exprs.push(encoded.expr);
                }
            }
        }

        Ok(format!("({})", exprs.join(", ")))
    }
}
