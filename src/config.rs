use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

/// Upper bound for the orphan grace period (30 days).
pub const MAX_ORPHAN_GRACE_SECS: i64 = 30 * 24 * 60 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub reaper_interval_secs: u64,
    pub orphan_grace_secs: i64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Temporary image sharing service")]
pub struct Args {
    /// Host to bind to (overrides TEMPSHARE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TEMPSHARE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where image blobs are stored (overrides TEMPSHARE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TEMPSHARE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket that receives uploads (overrides TEMPSHARE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Seconds between expiry sweeps (overrides TEMPSHARE_REAPER_INTERVAL_SECS)
    #[arg(long)]
    pub reaper_interval_secs: Option<u64>,

    /// Minimum age before an unreferenced blob or row is reconciled
    /// (overrides TEMPSHARE_ORPHAN_GRACE_SECS)
    #[arg(long)]
    pub orphan_grace_secs: Option<i64>,

    /// Run migrations and exit
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
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let text = |name: &str, default: &str| -> Result<String> {
            match lookup(name) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => text("TEMPSHARE_HOST", "0.0.0.0")?,
            },
            port: match args.port {
                Some(port) => port,
                None => parsed(&lookup, "TEMPSHARE_PORT", 3000)?,
            },
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => text("TEMPSHARE_STORAGE_DIR", "./data/objects")?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => text("TEMPSHARE_DATABASE_URL", "sqlite://./data/meta/tempshare.db")?,
            },
            bucket: match args.bucket {
                Some(bucket) => bucket,
                None => text("TEMPSHARE_BUCKET", "images")?,
            },
            reaper_interval_secs: match args.reaper_interval_secs {
                Some(secs) => secs,
                None => parsed(&lookup, "TEMPSHARE_REAPER_INTERVAL_SECS", 60)?,
            },
            orphan_grace_secs: match args.orphan_grace_secs {
                Some(secs) => secs,
                None => parsed(&lookup, "TEMPSHARE_ORPHAN_GRACE_SECS", 600)?,
            },
        };

        if cfg.reaper_interval_secs == 0 {
            anyhow::bail!("reaper interval must be at least one second");
        }
        if cfg.orphan_grace_secs < 0 {
            anyhow::bail!("orphan grace period cannot be negative");
        }
        if cfg.orphan_grace_secs > MAX_ORPHAN_GRACE_SECS {
            anyhow::bail!(
                "orphan grace period must be at most {} seconds, got {}",
                MAX_ORPHAN_GRACE_SECS,
                cfg.orphan_grace_secs
            );
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T, F>(lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
