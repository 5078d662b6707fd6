use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use crate::{
    config::{Config, LogLevel, YamlConfig},
    connectors::AdapterRegistry,
    database::Database,
    load::{read_csv, CsvOptions},
    query::ReadQuery,
    writer::WriteOptions,
    DatumError, Result,
};

#[derive(Parser)]
#[command(name = "datum")]
#[command(about = "Read, write and manage spatial tables in PostGIS and Oracle ST_Geometry")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database connection URL, e.g. postgis://user@host:5432/db
    #[arg(short = 'd', long = "connection", global = true, value_name = "URL")]
    pub connection: Option<String>,

    /// YAML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level: debug, info, warn, error
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Secret ID for the connection password (resolves to DATUM_SECRET_{id})
    #[arg(long, global = true, value_name = "ID")]
    pub secret_id: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Remove every row from a table and reset its identity sequences
    Truncate {
        table: String,

        /// Also truncate tables that reference this one
        #[arg(long)]
        cascade: bool,
    },
    /// List the base tables in the default schema
    Tables,
    /// Show the fields and geometry metadata of a table
    Describe { table: String },
    /// Count rows, optionally matching a WHERE predicate
    Count {
        table: String,

        #[arg(long, value_name = "PREDICATE")]
        filter: Option<String>,
    },
    /// Print rows as JSON lines
    Read {
        table: String,

        /// Comma-separated field list
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        #[arg(long, value_name = "PREDICATE")]
        filter: Option<String>,

        /// Comma-separated ORDER BY entries, e.g. "name,objectid DESC"
        #[arg(long, value_delimiter = ',')]
        sort: Vec<String>,

        #[arg(long, value_name = "N")]
        limit: Option<usize>,

        /// Reproject geometries to this SRID
        #[arg(long, value_name = "SRID")]
        to_srid: Option<i32>,

        /// Leave the geometry column out
        #[arg(long)]
        no_geom: bool,
    },
    /// Append the rows of a CSV file to a table
    Load {
        table: String,
        file: PathBuf,

        /// Rows per committed chunk
        #[arg(long, value_name = "N")]
        chunk_size: Option<usize>,

        /// SRID of the WKT in the file, when it differs from the table's
        #[arg(long, value_name = "SRID")]
        from_srid: Option<i32>,

        #[arg(long, default_value = ",")]
        delimiter: char,
    },
}

impl Cli {
    /// Merges the config file (if any) with the command-line flags; flags win.
    pub fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => YamlConfig::from_file(path)?.into_config()?,
            None => Config::default(),
        };
        if let Some(connection) = &self.connection {
            config.connection = connection.clone();
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.secret_id.is_some() {
            config.secret_id = self.secret_id.clone();
        }
        if config.connection.is_empty() {
            return Err(DatumError::Configuration(
                "no connection given; use --connection or a config file".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Runs `command` against the built-in adapters.
pub async fn run(command: &Commands, config: &Config, out: &mut dyn Write) -> Result<()> {
    run_with(command, config, &AdapterRegistry::with_defaults(), out).await
}

pub async fn run_with(
    command: &Commands,
    config: &Config,
    registry: &AdapterRegistry,
    out: &mut dyn Write,
) -> Result<()> {
    let db = Database::open_with(&config.connection_url()?, registry).await?;
    let result = execute(&db, command, config, out).await;
    let closed = db.close().await;
    result.and(closed)
}

async fn execute(
    db: &Database,
    command: &Commands,
    config: &Config,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Commands::Truncate { table, cascade } => {
            db.table(table).await?.delete(*cascade).await?;
            info!("Truncated {}", table);
        }
        Commands::Tables => {
            for name in db.tables().await? {
                writeln!(out, "{}", name)?;
            }
        }
        Commands::Describe { table } => {
            let table = db.table(table).await?;
            writeln!(out, "table: {}", table.name())?;
            if let Some(geom) = table.geom_field() {
                writeln!(
                    out,
                    "geometry: {} {} (srid {})",
                    geom,
                    table.geom_type().unwrap_or("unknown"),
                    table
                        .srid()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                )?;
            }
            if let Some(pk) = table.pk_field() {
                writeln!(out, "primary key: {}", pk)?;
            }
            if let Some(objectid) = table.objectid_field() {
                writeln!(out, "objectid: {}", objectid)?;
            }
            for field in table.fields() {
                let null = if field.nullable { "" } else { " not null" };
                writeln!(out, "  {} {}{}", field.name, field.kind, null)?;
            }
        }
        Commands::Count { table, filter } => {
            let count = db.table(table).await?.count(filter.as_deref()).await?;
            writeln!(out, "{}", count)?;
        }
        Commands::Read {
            table,
            fields,
            filter,
            sort,
            limit,
            to_srid,
            no_geom,
        } => {
            let table = db.table(table).await?;
            let mut query = ReadQuery::new()
                .sort(sort.iter().cloned())
                .include_geom(!no_geom);
            if !fields.is_empty() {
                query = query.fields(fields.iter().cloned());
            }
            if let Some(filter) = filter {
                query = query.filter(filter.as_str());
            }
            if let Some(limit) = limit {
                query = query.limit(*limit);
            }
            if let Some(srid) = to_srid.or(config.to_srid) {
                query = query.to_srid(srid);
            }
            for row in table.read(&query).await? {
                writeln!(out, "{}", serde_json::to_string(&row)?)?;
            }
        }
        Commands::Load {
            table,
            file,
            chunk_size,
            from_srid,
            delimiter,
        } => {
            let delimiter = u8::try_from(*delimiter).map_err(|_| {
                DatumError::Configuration(format!("delimiter must be ASCII, got '{}'", delimiter))
            })?;
            let rows = read_csv(file, CsvOptions { delimiter })?;
            let table = db.table(table).await?;

            let pb = ProgressBar::new(rows.len() as u64);
            let style = ProgressStyle::default_bar()
                .template("{bar:40.cyan/blue} {percent}% ({pos}/{len}) {msg}")
                .map_err(|e| DatumError::Configuration(e.to_string()))?
                .progress_chars("█▇▆▅▄▃▂▁  ");
            pb.set_style(style);

            let mut options = WriteOptions::new()
                .chunk_size(chunk_size.unwrap_or(config.chunk_size))
                .progress(pb.clone());
            if let Some(srid) = from_srid.or(config.from_srid) {
                options = options.from_srid(srid);
            }
            let summary = table.write(&rows, &options).await?;
            pb.finish_with_message("Complete");
            info!(
                "Loaded {} rows into {} in {} chunks",
                summary.rows,
                table.name(),
                summary.chunks
            );
        }
    }
    Ok(())
}
