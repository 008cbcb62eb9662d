//! AeroBucket CLI: S3 bucket file manager
//!
//! Usage:
//!   aerobucket-cli connect --bucket <b> --region <r> --access-key <k> --secret-key <s> [--remember]
//!   aerobucket-cli ls [prefix]              List a virtual folder
//!   aerobucket-cli put <files..> [--prefix] Upload files with progress bars
//!   aerobucket-cli get <key> [local]        Download an object
//!   aerobucket-cli share <key> [--ttl]      Print a presigned link
//!   aerobucket-cli cors                     Print the recommended CORS rules

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use aerobucket::browser::{folder_display_name, ListFailure, ListStatus};
use aerobucket::config::{self, CodecMode};
use aerobucket::credential_store::{CredentialStore, Credentials, RestoreOutcome};
use aerobucket::crypto::CredentialCodec;
use aerobucket::file_types::FilterType;
use aerobucket::providers::UploadSource;
use aerobucket::session::{Connection, Preview, Session};
use aerobucket::upload::{format_eta, format_speed, UploadEvent};
use aerobucket::{cors, BrowserEvent};

#[derive(Parser)]
#[command(
    name = "aerobucket-cli",
    about = "AeroBucket CLI: browse, upload and share objects in an S3 bucket",
    version,
    long_about = "Works with AWS S3 and S3-compatible services (MinIO, R2, Wasabi, ...).\nRun `connect --remember` once; later commands reuse the remembered credentials."
)]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// S3-compatible endpoint URL (overrides the config file)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Use path-style addressing
    #[arg(long, global = true)]
    path_style: bool,

    /// Passphrase sealing the remembered credentials
    #[arg(long, global = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate credentials, test the bucket and store them
    Connect {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        region: String,
        #[arg(long)]
        access_key: String,
        #[arg(long)]
        secret_key: String,
        /// Keep credentials across runs (otherwise they die with this process)
        #[arg(long)]
        remember: bool,
    },
    /// Forget stored credentials
    Disconnect,
    /// Show the remembered connection
    Status,
    /// List a virtual folder
    Ls {
        /// Prefix to list (default: bucket root)
        #[arg(default_value = "")]
        prefix: String,
        /// all, image, video, doc, code
        #[arg(long, default_value = "all")]
        filter: FilterType,
        /// Case-insensitive name filter
        #[arg(long)]
        search: Option<String>,
    },
    /// Upload files
    Put {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Destination prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Download an object
    Get {
        key: String,
        /// Local destination (default: object name)
        local: Option<PathBuf>,
    },
    /// Print an object as text
    Cat { key: String },
    /// Delete objects
    Rm {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Rename an object within its folder
    Mv { key: String, new_name: String },
    /// Copy an object
    Cp { from: String, to: String },
    /// Create a folder
    Mkdir { path: String },
    /// Print a presigned download link
    Share {
        key: String,
        /// Link lifetime in seconds (default from config)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Show how an object would be previewed
    Preview { key: String },
    /// Print the recommended bucket CORS configuration
    Cors,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "aerobucket=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn open_session(cli: &Cli) -> anyhow::Result<Session> {
    let mut config = config::load_config();
    if let Some(ref endpoint) = cli.endpoint {
        config.endpoint = Some(endpoint.clone());
    }
    if cli.path_style {
        config.path_style = true;
    }
    config::validate_config(&mut config);

    let codec = match (&cli.passphrase, config.credential_codec) {
        (Some(passphrase), _) => CredentialCodec::Passphrase(passphrase.clone().into()),
        (None, CodecMode::Passphrase) => bail!("--passphrase is required (credential_codec = passphrase)"),
        (None, CodecMode::Obfuscated) => CredentialCodec::Obfuscated,
    };

    Ok(Session::new(config, CredentialStore::with_default_locations(codec)))
}

/// Restore remembered credentials or explain how to get some
async fn restored(session: &Session) -> anyhow::Result<Connection> {
    match session.restore().await? {
        RestoreOutcome::Restored { .. } => Ok(session.connection().await?),
        RestoreOutcome::Nothing => bail!("Not connected. Run `aerobucket-cli connect --remember ...` first."),
        RestoreOutcome::Discarded => {
            bail!("Stored credentials could not be read and were cleared. Connect again.")
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_start_matches('/');
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// Print the failure of the last listing, with CORS guidance when relevant
fn report_list_failure(status: &ListStatus, bucket: &str) {
    if let ListStatus::Failed(failure) = status {
        match failure {
            ListFailure::NeedsCorsSetup(_) => eprintln!("{}", cors::setup_instructions(bucket)),
            ListFailure::AccessDenied(m) => eprintln!("Access denied: {}", m),
            ListFailure::Other(m) => eprintln!("Listing failed: {}", m),
        }
    }
}

async fn cmd_ls(connection: &Connection, prefix: &str, filter: FilterType, search: Option<String>) -> anyhow::Result<()> {
    let browser = &connection.browser;
    browser.dispatch(BrowserEvent::SetFilter(filter)).await;
    if let Some(query) = search {
        browser.dispatch(BrowserEvent::SetSearch(query)).await;
    }

    if let Err(e) = browser.navigate(&normalize_prefix(prefix)).await {
        report_list_failure(&browser.snapshot().await.status, connection.store.bucket());
        return Err(e.into());
    }

    let state = browser.snapshot().await;
    let trail: Vec<String> = state.breadcrumbs().into_iter().map(|c| c.label).collect();
    println!("{}:/{}", connection.store.bucket(), trail.join("/"));

    if state.is_empty_folder() {
        println!("(empty folder)");
        return Ok(());
    }
    for folder in state.visible_folders() {
        println!("{:>10}  {:<20}  {}/", "DIR", "", folder_display_name(&folder.prefix, &state.prefix));
    }
    for file in state.visible_files() {
        let modified = file
            .last_modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{:>10}  {:<20}  {}", format_size(file.size), modified, file.name());
    }
    Ok(())
}

async fn cmd_put(connection: &Connection, files: Vec<PathBuf>, prefix: &str) -> anyhow::Result<()> {
    let uploads = &connection.uploads;
    let mut events = uploads.subscribe();

    let sources = files
        .iter()
        .map(UploadSource::from_path)
        .collect::<Result<Vec<_>, _>>()?;
    let mut handles = Vec::new();
    for (path, result) in files.iter().zip(uploads.start_batch(sources, &normalize_prefix(prefix)).await) {
        match result {
            Ok(handle) => handles.push(handle),
            Err(e) => eprintln!("Skipping {}: {}", path.display(), e),
        }
    }

    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{msg:24!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {prefix}")?
        .progress_chars("=> ");
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    for task in uploads.active() {
        let bar = multi.add(ProgressBar::new(task.total_bytes));
        bar.set_style(style.clone());
        bar.set_message(task.file_name.clone());
        bars.insert(task.id, bar);
    }

    let waits = futures_util::future::join_all(handles.into_iter().map(|h| h.wait()));
    tokio::pin!(waits);

    let results = loop {
        tokio::select! {
            results = &mut waits => break results,
            Ok(event) = events.recv() => match event {
                UploadEvent::Progress(snapshot) => {
                    if let Some(bar) = bars.get(&snapshot.id) {
                        bar.set_position(snapshot.loaded_bytes);
                        bar.set_prefix(format!(
                            "{} eta {}",
                            format_speed(snapshot.metrics.bytes_per_sec),
                            format_eta(snapshot.metrics.eta)
                        ));
                    }
                }
                UploadEvent::Completed { id, .. } => {
                    if let Some(bar) = bars.get(&id) {
                        bar.finish_with_message("done");
                    }
                }
                UploadEvent::Failed { id, error, .. } => {
                    if let Some(bar) = bars.get(&id) {
                        bar.abandon_with_message(format!("failed: {}", error));
                    }
                }
                UploadEvent::Cancelled { id } => {
                    if let Some(bar) = bars.get(&id) {
                        bar.abandon_with_message("cancelled");
                    }
                }
                UploadEvent::Started { .. } => {}
            },
            _ = tokio::signal::ctrl_c() => {
                let cancelled = uploads.cancel_all();
                eprintln!("Cancelling {} upload(s)...", cancelled);
            }
        }
    };

    let failed = results.iter().filter(|r| r.is_err()).count();
    for result in &results {
        match result {
            Ok(key) => println!("Uploaded {}", key),
            Err(e) => eprintln!("Error: {}", e),
        }
    }
    if failed > 0 {
        bail!("{} of {} upload(s) failed", failed, results.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Cors = cli.command {
        println!("{}", cors::recommended_json());
        return Ok(());
    }
    let session = open_session(&cli)?;

    match cli.command {
        Commands::Cors => {}
        Commands::Connect {
            bucket,
            region,
            access_key,
            secret_key,
            remember,
        } => {
            let credentials = Credentials::new(bucket, region, access_key, secret_key);
            let connection = session.connect(&credentials, remember).await?;
            println!("Connecting to {} ...", connection.store.display_name());
            if let Err(e) = connection.browser.list().await {
                report_list_failure(&connection.browser.snapshot().await.status, connection.store.bucket());
                return Err(e).context("Bucket is not reachable with these credentials");
            }
            println!(
                "Connection test: OK{}",
                if remember { " (credentials remembered)" } else { "" }
            );
        }
        Commands::Disconnect => {
            session.disconnect().await;
            println!("Disconnected. Stored credentials removed.");
        }
        Commands::Status => match session.restore().await? {
            RestoreOutcome::Restored { remember } => {
                if let Some(credentials) = session.credentials().await {
                    println!("Bucket:     {}", credentials.bucket_name);
                    println!("Region:     {}", credentials.region);
                    println!("Access key: {}", credentials.access_key_id);
                }
                println!(
                    "Endpoint:   {}",
                    session.config().endpoint.as_deref().unwrap_or("AWS S3")
                );
                println!("Stored:     {}", if remember { "persistent" } else { "session" });
            }
            RestoreOutcome::Nothing => println!("Not connected."),
            RestoreOutcome::Discarded => println!("Stored credentials were unreadable and have been cleared."),
        },
        Commands::Ls { prefix, filter, search } => {
            let connection = restored(&session).await?;
            cmd_ls(&connection, &prefix, filter, search).await?;
        }
        Commands::Put { files, prefix } => {
            let connection = restored(&session).await?;
            cmd_put(&connection, files, &prefix).await?;
        }
        Commands::Get { key, local } => {
            restored(&session).await?;
            let local = local.unwrap_or_else(|| PathBuf::from(key.rsplit('/').next().unwrap_or("download")));
            let bytes = session.download(&key, &local).await?;
            println!("Downloaded {} → {} ({})", key, local.display(), format_size(bytes));
        }
        Commands::Cat { key } => {
            let connection = restored(&session).await?;
            print!("{}", connection.store.get_text_content(&key).await?);
        }
        Commands::Rm { keys } => {
            let connection = restored(&session).await?;
            connection.store.delete(&keys).await?;
            println!("Deleted {} object(s)", keys.len());
        }
        Commands::Mv { key, new_name } => {
            let connection = restored(&session).await?;
            let parent = match key.rfind('/') {
                Some(idx) => key[..=idx].to_string(),
                None => String::new(),
            };
            connection.browser.dispatch(BrowserEvent::Navigate(parent)).await;
            let new_key = connection.browser.rename(&key, &new_name).await?;
            println!("Renamed {} → {}", key, new_key);
        }
        Commands::Cp { from, to } => {
            let connection = restored(&session).await?;
            connection.store.copy(&from, &to).await?;
            println!("Copied {} → {}", from, to);
        }
        Commands::Mkdir { path } => {
            let connection = restored(&session).await?;
            let key = connection.store.create_folder(&path).await?;
            println!("Created {}", key);
        }
        Commands::Share { key, ttl } => {
            restored(&session).await?;
            println!("{}", session.share(&key, ttl).await?);
        }
        Commands::Preview { key } => {
            restored(&session).await?;
            match session.preview(&key).await? {
                Preview::Text { content } => print!("{}", content),
                preview => println!("{}", serde_json::to_string_pretty(&preview)?),
            }
        }
    }

    Ok(())
}
