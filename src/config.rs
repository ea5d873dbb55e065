use crate::services::authorizer::DEFAULT_TOKENINFO_URL;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Bucket every upload lands in.
    pub bucket: String,
    /// SQLite URL; the in-memory datastore is used when absent.
    pub database_url: Option<String>,
    /// Object-store URL (`gs://`, `s3://`, `file://`); the in-memory
    /// backend is used when absent.
    pub storage_url: Option<String>,
    /// OAuth2 client id tokens must be issued to.
    pub oauth_client_id: String,
    pub tokeninfo_url: String,
    /// When set, `<collection>.<root_domain>` hosts address a collection
    /// directly, next to path-style routing.
    pub root_domain: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Content-addressed blob collections")]
pub struct Args {
    /// Host to bind to (overrides BLOBSHELF_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BLOBSHELF_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bucket uploads are stored in (overrides BLOBSHELF_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// SQLite database URL (overrides BLOBSHELF_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object store URL (overrides BLOBSHELF_STORAGE_URL)
    #[arg(long)]
    pub storage_url: Option<String>,

    /// OAuth2 client id (overrides BLOBSHELF_OAUTH_CLIENT_ID)
    #[arg(long)]
    pub oauth_client_id: Option<String>,

    /// Token introspection endpoint (overrides BLOBSHELF_TOKENINFO_URL)
    #[arg(long)]
    pub tokeninfo_url: Option<String>,

    /// Root domain for per-collection hosts (overrides BLOBSHELF_ROOT_DOMAIN)
    #[arg(long)]
    pub root_domain: Option<String>,

    /// Create the database schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |key| env::var(key))?, migrate))
    }

    /// Merge parsed arguments with values looked up through `var`.
    fn merge<F>(args: Args, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let lookup = |key: &str| -> Result<Option<String>> {
            match var(key) {
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };

        let env_port = match lookup("BLOBSHELF_PORT")? {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing BLOBSHELF_PORT value `{}`", value))?,
            None => 8080,
        };

        let bucket = match args.bucket.or(lookup("BLOBSHELF_BUCKET")?) {
            Some(bucket) if !bucket.is_empty() => bucket,
            _ => bail!("no bucket set (use --bucket or BLOBSHELF_BUCKET)"),
        };
        let oauth_client_id = match args.oauth_client_id.or(lookup("BLOBSHELF_OAUTH_CLIENT_ID")?) {
            Some(id) if !id.is_empty() => id,
            _ => bail!(
                "no auth client id set (use --oauth-client-id or BLOBSHELF_OAUTH_CLIENT_ID)"
            ),
        };

        Ok(Self {
            host: args
                .host
                .or(lookup("BLOBSHELF_HOST")?)
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.unwrap_or(env_port),
            bucket,
            database_url: args.database_url.or(lookup("BLOBSHELF_DATABASE_URL")?),
            storage_url: args.storage_url.or(lookup("BLOBSHELF_STORAGE_URL")?),
            oauth_client_id,
            tokeninfo_url: args
                .tokeninfo_url
                .or(lookup("BLOBSHELF_TOKENINFO_URL")?)
                .unwrap_or_else(|| DEFAULT_TOKENINFO_URL.into()),
            root_domain: args
                .root_domain
                .or(lookup("BLOBSHELF_ROOT_DOMAIN")?)
                .filter(|domain| !domain.is_empty()),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
