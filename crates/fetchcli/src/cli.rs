//! Exposes the command line application.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;

use fetchcache::caching::{FetchError, RequestOptions};
use fetchcache::config::Config;
use fetchcache::types::{Method, Payload, Response, ResponseType};
use fetchcache::{FetchCache, logging, metrics};

/// Fetches resources through a persistent cache.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a URL, serving it from cache where allowed.
    Fetch(FetchArgs),

    /// Remove expired entries from the persistent cache.
    Purge {
        /// Remove every entry, expired or not.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BodyType {
    Text,
    Json,
    Blob,
    Arraybuffer,
    Document,
}

impl From<BodyType> for ResponseType {
    fn from(ty: BodyType) -> Self {
        match ty {
            BodyType::Text => ResponseType::Text,
            BodyType::Json => ResponseType::Json,
            BodyType::Blob => ResponseType::Blob,
            BodyType::Arraybuffer => ResponseType::ArrayBuffer,
            BodyType::Document => ResponseType::Document,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::Get,
            HttpMethod::Head => Method::Head,
            HttpMethod::Post => Method::Post,
            HttpMethod::Put => Method::Put,
            HttpMethod::Patch => Method::Patch,
            HttpMethod::Delete => Method::Delete,
        }
    }
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// The URL to fetch.
    url: String,

    /// The HTTP method. Defaults to GET, or POST if a body is given.
    #[arg(long, short = 'X', value_enum)]
    method: Option<HttpMethod>,

    /// An additional request header, as `Name: value`.
    #[arg(long = "header", short = 'H', value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// The request body.
    #[arg(long, short)]
    data: Option<String>,

    /// How to interpret the response body.
    #[arg(long, value_enum, default_value = "text")]
    response_type: BodyType,

    /// Persist the response for the given duration, e.g. `1h`.
    #[arg(long, value_parser = humantime::parse_duration)]
    ttl: Option<Duration>,

    /// Only serve cached responses written within the given duration.
    #[arg(long, value_parser = humantime::parse_duration)]
    max_age: Option<Duration>,

    /// Always go to the network, and replace the cached response.
    #[arg(long)]
    force: bool,

    /// Do not serve cached responses.
    #[arg(long)]
    no_cache: bool,

    /// Cache requests with a body under this key.
    #[arg(long)]
    post_cache_key: Option<String>,

    /// Use the blocking client.
    #[arg(long)]
    blocking: bool,
}

impl FetchArgs {
    fn request_options(&self) -> RequestOptions {
        RequestOptions {
            method: self.method.map(Method::from),
            headers: self.headers.iter().cloned().collect(),
            response_type: self.response_type.into(),
            allow_cache: !self.no_cache,
            force_cache_update: self.force,
            max_age: self.max_age,
            local_storage_expiration: self.ttl,
            post_cache_key: self.post_cache_key.clone(),
        }
    }
}

fn parse_header(header: &str) -> Result<(String, String)> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| anyhow!("expected `Name: value`, got `{header}`"))?;
    Ok((name.trim().to_owned(), value.trim().to_owned()))
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config.logging, console::user_attended_stderr());
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let cache = FetchCache::from_config(&config)?;
    match cli.command {
        Command::Fetch(args) => fetch(&cache, args),
        Command::Purge { all } => {
            let stats = cache.purge(all);
            tracing::info!(removed = stats.removed(), "Purged persistent cache");
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

fn fetch(cache: &FetchCache, args: FetchArgs) -> Result<()> {
    let options = args.request_options();
    tracing::debug!(url = %args.url, blocking = args.blocking, "Fetching");
    let body = args.data.map(Bytes::from);

    let result = if args.blocking {
        cache.fetch_cached_blocking(&args.url, body, options)
    } else {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;
        runtime.block_on(cache.fetch_cached(&args.url, body, options))
    };

    match result {
        Ok(response) => print_response(response),
        Err(err) => {
            print_error(&err)?;
            Err(err).context("request failed")
        }
    }
}

fn print_response(response: Response) -> Result<()> {
    eprintln!(
        "{} written at {}",
        style(response.status).green().bold(),
        response.cached_time.to_rfc3339()
    );

    let mut stdout = std::io::stdout().lock();
    match response.payload {
        Payload::Text(text) => writeln!(stdout, "{text}")?,
        Payload::Json(value) => writeln!(stdout, "{}", serde_json::to_string_pretty(&value)?)?,
        Payload::Blob(bytes) | Payload::ArrayBuffer(bytes) | Payload::Document(bytes) => {
            stdout.write_all(&bytes)?
        }
    }
    Ok(())
}

fn print_error(err: &FetchError) -> Result<()> {
    eprintln!("{} {}", style(err.status()).red().bold(), err.message());
    if let Some(data) = err.data() {
        eprintln!("{}", serde_json::to_string_pretty(data)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_options() {
        let cli = Cli::try_parse_from([
            "fetchcli",
            "fetch",
            "https://example.com/lists",
            "--ttl",
            "1h",
            "--max-age",
            "5m",
            "-H",
            "Accept: application/json",
            "--response-type",
            "json",
        ])
        .unwrap();

        let Command::Fetch(args) = cli.command else {
            panic!("expected a fetch command");
        };
        let options = args.request_options();
        assert!(options.allow_cache);
        assert!(!options.force_cache_update);
        assert_eq!(options.response_type, ResponseType::Json);
        assert_eq!(options.local_storage_expiration, Some(Duration::from_secs(3600)));
        assert_eq!(options.max_age, Some(Duration::from_secs(300)));
        assert_eq!(options.headers["Accept"], "application/json");
    }

    #[test]
    fn test_invalid_header() {
        let result = Cli::try_parse_from(["fetchcli", "fetch", "/x", "-H", "no-colon"]);
        assert!(result.is_err());
    }
}
