//! fbwire - command-line probe for Firebird servers
//!
//! Connects with the wire protocol engine, authenticates, attaches and runs
//! one command.

use clap::{Parser, Subcommand};
use colored::Colorize;
use fbwire_client::{Connection, ConnectionConfig, Database, WireCrypt};
use fbwire_protocol::clumplet::{vax_integer, InfoItem, InfoReader};
use fbwire_protocol::consts::*;
use fbwire_protocol::{FieldDescriptor, ParameterBuffer, RowValue};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fbwire")]
#[command(about = "Probe and query Firebird servers over the wire protocol")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "FBWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Database path or alias
    #[arg(short, long)]
    database: Option<String>,

    /// Login name
    #[arg(short, long)]
    user: Option<String>,

    /// Password
    #[arg(long, env = "FBWIRE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Wire encryption: disabled, enabled or required
    #[arg(long)]
    wire_crypt: Option<WireCrypt>,

    /// Protocol versions to offer (e.g. 13,15,16)
    #[arg(long, value_delimiter = ',')]
    protocol: Option<Vec<u32>>,

    /// Log protocol exchanges
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Negotiate, authenticate and attach, then report what was agreed
    Probe,

    /// Run one SQL statement and print its rows
    Query {
        /// SQL text
        sql: String,

        /// Rows per fetch
        #[arg(short, long, default_value = "100")]
        batch: usize,
    },

    /// Print database info
    Info,

    /// Write the content of a blob to stdout
    Blob {
        /// Blob id (decimal or 0x-prefixed hex)
        id: String,
    },

    /// Print the effective configuration as YAML
    Config,
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = build_config(&cli)?;
    if let Commands::Config = cli.command {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let connection = fbwire_client::connect(&config).map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    connection.authenticate()?;
    let database = connection.database();
    database.attach(ParameterBuffer::dpb())?;

    let result = match cli.command {
        Commands::Probe => probe(&connection, &database),
        Commands::Query { sql, batch } => query(&database, &sql, batch),
        Commands::Info => info(&database),
        Commands::Blob { id } => blob(&database, &id),
        Commands::Config => Ok(()),
    };

    if let Err(e) = &result {
        eprintln!("{}: {}", "Error".red(), e);
    }
    if let Err(e) = database.detach() {
        tracing::warn!("detach failed: {}", e);
    }
    result
}

fn build_config(cli: &Cli) -> CliResult<ConnectionConfig> {
    let mut config = match &cli.config {
        Some(path) => ConnectionConfig::from_file(path)?,
        None => ConnectionConfig::default(),
    };
    config.apply_env_overrides()?;

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(database) = &cli.database {
        config.database = database.clone();
    }
    if let Some(user) = &cli.user {
        config.user = Some(user.clone());
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone());
    }
    if let Some(wire_crypt) = cli.wire_crypt {
        config.wire_crypt = wire_crypt;
    }
    if let Some(versions) = &cli.protocol {
        config.protocol_versions = versions.clone();
    }
    if config.database.is_empty() {
        return Err("no database given (use --database or FBWIRE_DATABASE)".into());
    }
    Ok(config)
}

fn probe(connection: &Connection, database: &Database) -> CliResult<()> {
    println!("{}: {}", "Address".bold(), connection.config().address());
    println!("{}: {}", "Protocol".bold(), connection.protocol_version());
    match connection.encryption() {
        Some(id) => println!("{}: {}", "Encryption".bold(), id.to_string().green()),
        None => println!("{}: {}", "Encryption".bold(), "none".yellow()),
    }
    if let Some(handle) = database.handle() {
        println!("{}: {}", "Attachment".bold(), handle);
    }
    database.ping()?;
    println!("{}", "OK".green());
    Ok(())
}

fn query(database: &Database, sql: &str, batch: usize) -> CliResult<()> {
    let transaction = database.start_transaction(&ParameterBuffer::tpb())?;
    let mut statement = database.create_statement();
    let fields = statement.prepare(&transaction, sql)?.fields.clone();
    let singleton = statement.execute(&transaction, &[])?;

    let mut out = std::io::stdout().lock();
    if !fields.is_empty() {
        let header: Vec<String> = fields
            .fields()
            .iter()
            .map(|f| if f.alias.is_empty() { f.field_name.clone() } else { f.alias.clone() })
            .collect();
        writeln!(out, "{}", header.join("\t").bold())?;
    }
    if let Some(row) = singleton {
        print_row(&mut out, fields.fields(), &row)?;
    }
    let mut count = 0usize;
    if statement.has_open_cursor() {
        for row in statement.rows(batch) {
            print_row(&mut out, fields.fields(), &row?)?;
            count += 1;
        }
        writeln!(out, "{}", format!("{} row(s)", count).dimmed())?;
    } else {
        let counts = statement.row_counts()?;
        writeln!(
            out,
            "{}",
            format!(
                "inserted {}, updated {}, deleted {}",
                counts.inserted, counts.updated, counts.deleted
            )
            .dimmed()
        )?;
    }

    statement.free()?;
    transaction.commit()?;
    Ok(())
}

fn print_row(
    out: &mut impl Write,
    fields: &[FieldDescriptor],
    row: &RowValue,
) -> std::io::Result<()> {
    let values: Vec<String> = fields
        .iter()
        .zip(row)
        .map(|(field, value)| match value {
            Some(value) => render(field, value),
            None => "<null>".to_string(),
        })
        .collect();
    writeln!(out, "{}", values.join("\t"))
}

/// Formats a raw column value; types without a textual form print as hex.
fn render(field: &FieldDescriptor, value: &[u8]) -> String {
    let integer = match (field.base_type(), value.len()) {
        (SQL_SHORT | SQL_LONG, 4) => {
            Some(i32::from_be_bytes([value[0], value[1], value[2], value[3]]) as i64)
        }
        (SQL_INT64, 8) => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(value);
            Some(i64::from_be_bytes(bytes))
        }
        _ => None,
    };
    match (field.base_type(), integer) {
        (_, Some(n)) if field.scale < 0 => {
            let divisor = 10f64.powi(-field.scale);
            format!("{:.*}", (-field.scale) as usize, n as f64 / divisor)
        }
        (_, Some(n)) => n.to_string(),
        (SQL_VARYING | SQL_TEXT, None) => String::from_utf8_lossy(value).trim_end().to_string(),
        (SQL_BLOB | SQL_QUAD, None) if value.len() == 8 => format!("blob:0x{}", hex::encode(value)),
        _ => format!("0x{}", hex::encode(value)),
    }
}

fn info(database: &Database) -> CliResult<()> {
    let items = [
        ISC_INFO_FIREBIRD_VERSION,
        ISC_INFO_ODS_VERSION,
        ISC_INFO_ODS_MINOR_VERSION,
        ISC_INFO_END,
    ];
    let data = database.info(&items, 1024)?;
    for item in InfoReader::new(&data) {
        match item? {
            InfoItem::Value {
                item: ISC_INFO_FIREBIRD_VERSION,
                data,
            } => {
                // count, then (length, text) per version string
                let mut rest = data.get(1..).unwrap_or_default();
                while let Some((&len, tail)) = rest.split_first() {
                    let len = (len as usize).min(tail.len());
                    println!("{}: {}", "Server".bold(), String::from_utf8_lossy(&tail[..len]));
                    rest = &tail[len..];
                }
            }
            InfoItem::Value {
                item: ISC_INFO_ODS_VERSION,
                data,
            } => println!("{}: {}", "ODS major".bold(), vax_integer(data)),
            InfoItem::Value {
                item: ISC_INFO_ODS_MINOR_VERSION,
                data,
            } => println!("{}: {}", "ODS minor".bold(), vax_integer(data)),
            InfoItem::Value { .. } => {}
            InfoItem::Truncated => eprintln!("{}", "info response truncated".yellow()),
        }
    }
    Ok(())
}

fn parse_blob_id(text: &str) -> CliResult<i64> {
    let id = match text.strip_prefix("0x").or_else(|| text.strip_prefix("blob:0x")) {
        Some(hex) => u64::from_str_radix(hex, 16)? as i64,
        None => text.parse()?,
    };
    Ok(id)
}

fn blob(database: &Database, id: &str) -> CliResult<()> {
    let blob_id = parse_blob_id(id)?;
    let transaction = database.start_transaction(&ParameterBuffer::tpb())?;
    let mut blob = database.open_blob(&transaction, blob_id, None);
    blob.open()?;
    let length = blob.length()?;
    tracing::debug!(blob_id, length, "reading blob");

    let mut out = std::io::stdout().lock();
    while let Some(chunk) = blob.read(fbwire_client::blob::MAX_SEGMENT_SIZE)? {
        out.write_all(&chunk)?;
    }
    out.flush()?;
    blob.close()?;
    transaction.commit()?;
    Ok(())
}
