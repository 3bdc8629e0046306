use crate::services::reconcile::OrphanPolicy;
use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use std::env;

const DEFAULT_PORT: u16 = 7392;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    /// `None` keeps the index in memory only.
    pub database_url: Option<String>,
    pub orphan_policy: OrphanPolicy,
    pub max_upload_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Bucket/object store over HTTP")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides OBJECT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// SQLite catalog URL (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// What to do with unreferenced blobs at startup (overrides OBJECT_STORE_ORPHAN_POLICY)
    #[arg(long, value_enum)]
    pub orphan_policy: Option<OrphanPolicy>,

    /// Largest accepted request body in bytes (overrides OBJECT_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Apply the catalog schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |name| env::var(name))?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    fn merge<F>(args: Args, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let lookup = |name: &str| -> Result<Option<String>> {
            match var(name) {
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let port = match args.port {
            Some(port) => port,
            None => match lookup("OBJECT_STORE_PORT")? {
                Some(value) => value
                    .parse::<u16>()
                    .with_context(|| format!("parsing OBJECT_STORE_PORT value `{}`", value))?,
                None => DEFAULT_PORT,
            },
        };

        let orphan_policy = match args.orphan_policy {
            Some(policy) => policy,
            None => match lookup("OBJECT_STORE_ORPHAN_POLICY")? {
                Some(value) => OrphanPolicy::from_str(&value, true).map_err(|err| {
                    anyhow!("parsing OBJECT_STORE_ORPHAN_POLICY value `{}`: {}", value, err)
                })?,
                None => OrphanPolicy::default(),
            },
        };

        let max_upload_bytes = match args.max_upload_bytes {
            Some(limit) => limit,
            None => match lookup("OBJECT_STORE_MAX_UPLOAD_BYTES")? {
                Some(value) => value.parse::<usize>().with_context(|| {
                    format!("parsing OBJECT_STORE_MAX_UPLOAD_BYTES value `{}`", value)
                })?,
                None => DEFAULT_MAX_UPLOAD_BYTES,
            },
        };

        let database_url = match args.database_url {
            Some(url) => Some(url),
            None => lookup("OBJECT_STORE_DATABASE_URL")?,
        }
        .filter(|url| !url.trim().is_empty());

        Ok(Self {
            host: match args.host {
                Some(host) => host,
                None => lookup("OBJECT_STORE_HOST")?.unwrap_or_else(|| "0.0.0.0".into()),
            },
            port,
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => lookup("OBJECT_STORE_STORAGE_DIR")?
                    .unwrap_or_else(|| "./data/objects".into()),
            },
            database_url,
            orphan_policy,
            max_upload_bytes,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
