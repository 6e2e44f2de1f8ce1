use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, fmt, path::PathBuf, str::FromStr};

/// Longest grant lifetime, the SigV4 presign limit of seven days.
pub const MAX_GRANT_TTL_SECS: u64 = 604_800;

/// Which object store backend serves transfer payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Files on local disk, grants served by this process.
    Local,
    /// Any S3-compatible bucket, presigned URLs.
    S3,
}

/// Connection settings for the S3 backend. Every field is optional so the
/// service can start without them; requests then fail as unavailable.
#[derive(Clone, Default)]
pub struct S3Settings {
    pub bucket: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub store_backend: StoreBackend,
    pub storage_dir: String,
    /// Base URL clients use to reach this service; listing and grant URLs
    /// are built from it.
    pub public_url: String,
    pub signing_secret: Option<String>,
    pub upload_grant_ttl_secs: u64,
    pub download_grant_ttl_secs: u64,
    pub bcrypt_cost: u32,
    pub admin_token: Option<String>,
    pub s3: S3Settings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            database_url: "sqlite://./data/meta/transfers.db".into(),
            store_backend: StoreBackend::Local,
            storage_dir: "./data/objects".into(),
            public_url: "http://127.0.0.1:3000".into(),
            signing_secret: None,
            upload_grant_ttl_secs: 900,
            download_grant_ttl_secs: 900,
            bcrypt_cost: 10,
            admin_token: None,
            s3: S3Settings {
                region: "us-east-1".into(),
                ..S3Settings::default()
            },
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("store_backend", &self.store_backend)
            .field("storage_dir", &self.storage_dir)
            .field("public_url", &self.public_url)
            .field("signing_secret", &self.signing_secret.as_ref().map(|_| "<redacted>"))
            .field("upload_grant_ttl_secs", &self.upload_grant_ttl_secs)
            .field("download_grant_ttl_secs", &self.download_grant_ttl_secs)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("s3", &self.s3)
            .finish()
    }
}

/// Command-line + environment configuration.
///
/// Secrets (signing secret, admin token, S3 keys) are read from the
/// environment only.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file transfer service")]
pub struct Args {
    /// Host to bind to (overrides TRANSFER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TRANSFER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides TRANSFER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object store backend (overrides TRANSFER_STORE_BACKEND)
    #[arg(long, value_enum)]
    pub store_backend: Option<StoreBackend>,

    /// Directory for the local backend (overrides TRANSFER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Public base URL of this service (overrides TRANSFER_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Upload grant lifetime in seconds (overrides TRANSFER_UPLOAD_GRANT_TTL_SECS)
    #[arg(long)]
    pub upload_grant_ttl_secs: Option<u64>,

    /// Download grant lifetime in seconds (overrides TRANSFER_DOWNLOAD_GRANT_TTL_SECS)
    #[arg(long)]
    pub download_grant_ttl_secs: Option<u64>,

    /// bcrypt cost factor for new password hashes (overrides TRANSFER_BCRYPT_COST)
    #[arg(long)]
    pub bcrypt_cost: Option<u32>,

    /// S3 bucket name (overrides TRANSFER_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// S3 region (overrides TRANSFER_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// S3 endpoint for non-AWS stores (overrides TRANSFER_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Copy legacy `.metadata.json` documents into the metadata table
    MigrateLegacy,
    /// Upload files to a running server and print the share link
    Send(SendArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct SendArgs {
    /// Files or directories to send
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Server base URL (defaults to the configured public URL)
    #[arg(long)]
    pub server: Option<String>,

    /// Protect the transfer with this password
    #[arg(long)]
    pub password: Option<String>,

    /// Creator email recorded on the transfer
    #[arg(long)]
    pub email: Option<String>,
}

/// What the binary was asked to do.
#[derive(Debug, Clone)]
pub enum RunMode {
    Serve,
    Migrate,
    MigrateLegacy,
    Send(SendArgs),
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        // Parse CLI once
        let args = Args::parse();
        let cfg = Self::from_sources(&args, |name| env::var(name).ok())?;

        let mode = match args.command {
            Some(Command::MigrateLegacy) => RunMode::MigrateLegacy,
            Some(Command::Send(send)) => RunMode::Send(send),
            None if args.migrate => RunMode::Migrate,
            None => RunMode::Serve,
        };
        Ok((cfg, mode))
    }

    /// Merge CLI args over environment values over defaults.
    pub fn from_sources<F>(args: &Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        // --- Environment fallback ---
        let env_backend = match var("TRANSFER_STORE_BACKEND") {
            Some(value) => <StoreBackend as ValueEnum>::from_str(&value, true)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("parsing TRANSFER_STORE_BACKEND value `{}`", value))?,
            None => defaults.store_backend,
        };

        // --- Merge ---
        let host = args
            .host
            .clone()
            .or_else(|| var("TRANSFER_HOST"))
            .unwrap_or(defaults.host);
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&var, "TRANSFER_PORT", defaults.port)?,
        };
        let public_url = args
            .public_url
            .clone()
            .or_else(|| var("TRANSFER_PUBLIC_URL"))
            .unwrap_or_else(|| {
                let shown_host = match host.as_str() {
                    "0.0.0.0" | "::" => "127.0.0.1",
                    other => other,
                };
                format!("http://{}:{}", shown_host, port)
            })
            .trim_end_matches('/')
            .to_string();

        let cfg = Self {
            database_url: args
                .database_url
                .clone()
                .or_else(|| var("TRANSFER_DATABASE_URL"))
                .unwrap_or(defaults.database_url),
            store_backend: args.store_backend.unwrap_or(env_backend),
            storage_dir: args
                .storage_dir
                .clone()
                .or_else(|| var("TRANSFER_STORAGE_DIR"))
                .unwrap_or(defaults.storage_dir),
            signing_secret: var("TRANSFER_SIGNING_SECRET"),
            upload_grant_ttl_secs: match args.upload_grant_ttl_secs {
                Some(v) => v,
                None => parse_var(
                    &var,
                    "TRANSFER_UPLOAD_GRANT_TTL_SECS",
                    defaults.upload_grant_ttl_secs,
                )?,
            },
            download_grant_ttl_secs: match args.download_grant_ttl_secs {
                Some(v) => v,
                None => parse_var(
                    &var,
                    "TRANSFER_DOWNLOAD_GRANT_TTL_SECS",
                    defaults.download_grant_ttl_secs,
                )?,
            },
            bcrypt_cost: match args.bcrypt_cost {
                Some(v) => v,
                None => parse_var(&var, "TRANSFER_BCRYPT_COST", defaults.bcrypt_cost)?,
            },
            admin_token: var("TRANSFER_ADMIN_TOKEN"),
            s3: S3Settings {
                bucket: args.s3_bucket.clone().or_else(|| var("TRANSFER_S3_BUCKET")),
                region: args
                    .s3_region
                    .clone()
                    .or_else(|| var("TRANSFER_S3_REGION"))
                    .unwrap_or(defaults.s3.region),
                endpoint: args
                    .s3_endpoint
                    .clone()
                    .or_else(|| var("TRANSFER_S3_ENDPOINT")),
                access_key: var("TRANSFER_S3_ACCESS_KEY"),
                secret_key: var("TRANSFER_S3_SECRET_KEY"),
            },
            host,
            port,
            public_url,
        };

        if !(4..=31).contains(&cfg.bcrypt_cost) {
            anyhow::bail!("TRANSFER_BCRYPT_COST must be between 4 and 31, got {}", cfg.bcrypt_cost);
        }
        for (name, secs) in [
            ("TRANSFER_UPLOAD_GRANT_TTL_SECS", cfg.upload_grant_ttl_secs),
            ("TRANSFER_DOWNLOAD_GRANT_TTL_SECS", cfg.download_grant_ttl_secs),
        ] {
            if !(1..=MAX_GRANT_TTL_SECS).contains(&secs) {
                anyhow::bail!(
                    "{} must be between 1 and {} seconds, got {}",
                    name,
                    MAX_GRANT_TTL_SECS,
                    secs
                );
            }
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}
