use indexmap::IndexMap;

use crate::{
    connectors::Dialect,
    schema::{CanonicalType, TableMetadata},
    DatumError, Result,
};

/// SQL text plus the values bound to its placeholders, in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Option<String>>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<Option<String>>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn bind(mut self, value: impl Into<String>) -> Self {
        self.params.push(Some(value.into()));
        self
    }
}

/// Options for reading rows out of a table.
///
/// ```ignore
/// let query = ReadQuery::new()
///     .fields(["address", "owner"])
///     .alias("owner", "owner_name")
///     .filter("zoning = 'RM1'")
///     .sort(["address"])
///     .limit(10);
/// ```
#[derive(Debug, Clone)]
pub struct ReadQuery {
    pub(crate) fields: Option<Vec<String>>,
    pub(crate) aliases: IndexMap<String, String>,
    pub(crate) include_geom: bool,
    pub(crate) to_srid: Option<i32>,
    pub(crate) filter: Option<String>,
    pub(crate) sort: Vec<String>,
    pub(crate) limit: Option<usize>,
}

impl Default for ReadQuery {
    fn default() -> Self {
        Self {
            fields: None,
            aliases: IndexMap::new(),
            include_geom: true,
            to_srid: None,
            filter: None,
            sort: Vec::new(),
            limit: None,
        }
    }
}

impl ReadQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the non-geometry columns read. Defaults to all of them.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Renames `field` to `alias` in the returned rows. Applies to the
    /// geometry field too.
    pub fn alias(mut self, field: impl Into<String>, alias: impl Into<String>) -> Self {
        self.aliases.insert(field.into().to_lowercase(), alias.into());
        self
    }

    pub fn include_geom(mut self, include: bool) -> Self {
        self.include_geom = include;
        self
    }

    /// Reprojects geometry into `srid` before it is returned.
    pub fn to_srid(mut self, srid: i32) -> Self {
        self.to_srid = Some(srid);
        self
    }

    /// Raw predicate inserted as the WHERE clause. It is not escaped.
    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.filter = Some(predicate.into());
        self
    }

    pub fn sort<I, S>(mut self, sort: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = sort.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn output_name<'a>(&'a self, field: &'a str) -> &'a str {
        self.aliases
            .get(&field.to_lowercase())
            .map(String::as_str)
            .unwrap_or(field)
    }

    /// Lower-cased key the geometry value carries in result rows.
    pub fn geom_key(&self, meta: &TableMetadata) -> Option<String> {
        if !self.include_geom {
            return None;
        }
        meta.geom_field_name().map(|field| self.output_key(field))
    }

    /// Row key under which `field` is returned.
    pub(crate) fn output_key(&self, field: &str) -> String {
        self.output_name(field).to_lowercase()
    }

    /// Renders the SELECT for `meta` in the given dialect.
    pub fn build_select(&self, meta: &TableMetadata, dialect: &dyn Dialect) -> Result<Statement> {
        let table = meta.table.to_string();
        let names: Vec<String> = match &self.fields {
            Some(requested) => requested
                .iter()
                .map(|name| {
                    meta.field(name)
                        .map(|f| f.name.clone())
                        .ok_or_else(|| DatumError::UnknownField {
                            table: table.clone(),
                            field: name.clone(),
                        })
                })
                .collect::<Result<Vec<_>>>()?,
            None => meta.non_geom_fields().into_iter().map(String::from).collect(),
        };

        let mut columns: Vec<String> = Vec::new();
        for name in names.iter().filter(|n| {
            meta.field(n).map(|f| f.kind != CanonicalType::Geom).unwrap_or(true)
        }) {
            columns.push(self.select_item(dialect.quote_ident(name), name, dialect));
        }

        if self.include_geom {
            if let Some(geom) = meta.geom_field_name() {
                let server_srid = match self.to_srid {
                    Some(to) if dialect.transforms_on_server() && Some(to) != meta.srid() => Some(to),
                    _ => None,
                };
                let selector = dialect
                    .geometry()
                    .wkt_selector(&dialect.quote_ident(geom), server_srid);
                columns.push(format!(
                    "{} AS {}",
                    selector,
                    dialect.quote_ident(self.output_name(geom))
                ));
            }
        }

        if columns.is_empty() {
            return Err(DatumError::Configuration(format!(
                "No columns selected from {}",
                table
            )));
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            dialect.qualified_name(&meta.owner, &meta.table.name)
        );
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        if !self.sort.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.sort.join(", "));
        }
        if let Some(limit) = self.limit {
            sql = dialect.limit(sql, limit);
        }

        Ok(Statement::new(sql))
    }

    fn select_item(&self, quoted: String, field: &str, dialect: &dyn Dialect) -> String {
        match self.aliases.get(&field.to_lowercase()) {
            Some(alias) => format!("{} AS {}", quoted, dialect.quote_ident(alias)),
            None => quoted,
        }
    }
}

/// `SELECT COUNT(*)` over the table with an optional raw predicate.
pub fn count_statement(meta: &TableMetadata, dialect: &dyn Dialect, filter: Option<&str>) -> Statement {
    let mut sql = format!(
        "SELECT COUNT(*) AS row_count FROM {}",
        dialect.qualified_name(&meta.owner, &meta.table.name)
    );
    if let Some(filter) = filter {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
    Statement::new(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{oracle::OracleStGeomDialect, postgis::PostgisDialect};
    use crate::schema::{FieldDescriptor, GeometryColumn, TableName};

    fn parcels(owner: &str) -> TableMetadata {
        let mut meta = TableMetadata::new(
            TableName::parse("parcels").unwrap(),
            owner,
            vec![
                FieldDescriptor::new("objectid", CanonicalType::Num),
                FieldDescriptor::new("address", CanonicalType::Text),
                FieldDescriptor::new("shape", CanonicalType::Geom),
            ],
        )
        .unwrap();
        meta.geometry = Some(GeometryColumn {
            field: "shape".to_string(),
            geom_type: "POLYGON".to_string(),
            srid: Some(2272),
        });
        meta
    }

    #[test]
    fn test_default_select_postgis() {
        let stmt = ReadQuery::new()
            .build_select(&parcels("public"), &PostgisDialect)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"objectid\", \"address\", ST_AsText(\"shape\") AS \"shape\" FROM \"public\".\"parcels\""
        );
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_with_aliases_filter_sort_limit() {
        let stmt = ReadQuery::new()
            .fields(["address"])
            .alias("address", "addr")
            .alias("shape", "geom")
            .filter("address LIKE '12%'")
            .sort(["address", "objectid DESC"])
            .limit(5)
            .build_select(&parcels("public"), &PostgisDialect)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"address\" AS \"addr\", ST_AsText(\"shape\") AS \"geom\" FROM \"public\".\"parcels\" \
             WHERE address LIKE '12%' ORDER BY address, objectid DESC LIMIT 5"
        );
    }

    #[test]
    fn test_select_without_geometry() {
        let stmt = ReadQuery::new()
            .include_geom(false)
            .build_select(&parcels("public"), &PostgisDialect)
            .unwrap();
        assert!(!stmt.sql.contains("ST_AsText"));
    }

    #[test]
    fn test_server_side_transform() {
        let meta = parcels("public");
        let stmt = ReadQuery::new().to_srid(4326).build_select(&meta, &PostgisDialect).unwrap();
        assert!(stmt.sql.contains("ST_AsText(ST_Transform(\"shape\", 4326)) AS \"shape\""));

        let same = ReadQuery::new().to_srid(2272).build_select(&meta, &PostgisDialect).unwrap();
        assert!(!same.sql.contains("ST_Transform"));
    }

    #[test]
    fn test_oracle_select_uses_rownum_and_client_transform() {
        let stmt = ReadQuery::new()
            .to_srid(4326)
            .sort(["ADDRESS"])
            .limit(3)
            .build_select(&parcels("GIS"), &OracleStGeomDialect)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM (SELECT \"OBJECTID\", \"ADDRESS\", SDE.ST_AsText(\"SHAPE\") AS \"SHAPE\" \
             FROM \"GIS\".\"PARCELS\" ORDER BY ADDRESS) WHERE ROWNUM <= 3"
        );
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = ReadQuery::new()
            .fields(["nope"])
            .build_select(&parcels("public"), &PostgisDialect)
            .unwrap_err();
        assert!(matches!(err, DatumError::UnknownField { .. }));
    }

    #[test]
    fn test_geom_key_follows_alias() {
        let meta = parcels("public");
        assert_eq!(ReadQuery::new().geom_key(&meta).as_deref(), Some("shape"));
        assert_eq!(ReadQuery::new().alias("shape", "Geom").geom_key(&meta).as_deref(), Some("geom"));
        assert_eq!(ReadQuery::new().include_geom(false).geom_key(&meta), None);
    }

    #[test]
    fn test_count_statement() {
        let stmt = count_statement(&parcels("public"), &PostgisDialect, Some("address IS NULL"));
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) AS row_count FROM \"public\".\"parcels\" WHERE address IS NULL"
        );
    }
}
