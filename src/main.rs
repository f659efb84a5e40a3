//! msc - Main entry point
//!
//! Command-line client for the MediaServer API.

use anyhow::{Context, Result};
use mediaserver_client::cli::{load_config, CliArgs, Command, ProgressDisplay};
use mediaserver_client::transfer::{format_bytes, SegmentedUploadOptions, UploadOptions};
use mediaserver_client::{
    ApiRequest, ApiResponse, BackupOptions, Catalog, ClientConfig, DownloadOutcome, MediaServerClient, MetadataOptions,
    Method, ResourceOptions,
};
use std::path::Path;
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    let config = load_config(&args).context("Invalid configuration")?;

    init_logging(&config, args.verbose);
    debug!("CLI arguments: {:?}", args);

    let quiet = args.quiet;
    let client = MediaServerClient::new(config).context("Failed to create the API client")?;

    match run(&client, args.command, quiet).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{:#}", e);
            Err(e)
        }
    }
}

/// Initialize logging from the resolved log level
fn init_logging(config: &ClientConfig, verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized with level {}", config.tracing_level());
}

async fn run(client: &MediaServerClient, command: Command, quiet: bool) -> Result<()> {
    match command {
        Command::Ping => {
            let version = client.server_version().await.context("Failed to get the server version")?;
            let root = client.check_server().await.context("The server did not answer")?;
            println!("{} answers, version {}", client.config().server_url, version);
            debug!("API root: {}", root);
        }

        Command::Api { uri, method, params } => {
            let method: Method = method.parse()?;
            let req = params.into_iter().fold(ApiRequest::new(method, uri.as_str()), |req, (k, v)| {
                if method.uses_query() {
                    req.param(k, v)
                } else {
                    req.field(k, v)
                }
            });
            match client.api(req).await.with_context(|| format!("Request to \"{}\" failed", uri))? {
                ApiResponse::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                ApiResponse::Text(text) => println!("{}", text),
                ApiResponse::Raw(response) => {
                    println!("HTTP {}", response.status());
                    if let Some(length) = response.content_length() {
                        println!("Content-Length: {}", length);
                    }
                }
            }
        }

        Command::Upload { file, title } => {
            let size = std::fs::metadata(&file)
                .with_context(|| format!("Cannot read \"{}\"", file.display()))?
                .len();
            let title = title.or_else(|| file_stem(&file));
            info!("Uploading \"{}\" ({})", file.display(), format_bytes(size));

            let mut display = ProgressDisplay::new(quiet, Some(size));
            let response = {
                let mut callback = display.callback();
                client
                    .add_media(title.as_deref(), Some(&file), &[], Some(&mut callback))
                    .await
                    .context("Upload failed")?
            };
            display.finish()?;
            let oid = response.get("oid").and_then(|v| v.as_str()).unwrap_or("?");
            display.print_status(&format!("Media created: {}", oid))?;
        }

        Command::UploadHls { m3u8, remote_dir } => {
            let options = SegmentedUploadOptions {
                remote_dir,
                ..SegmentedUploadOptions::default()
            };
            let mut display = ProgressDisplay::new(quiet, None);
            let dir_name = {
                let mut callback = display.callback();
                client
                    .hls_upload(&m3u8, &options, Some(&mut callback))
                    .await
                    .context("HLS upload failed")?
            };
            display.finish()?;
            display.print_status(&format!("Uploaded to remote directory \"{}\"", dir_name))?;
        }

        Command::DownloadMetadata { oid, dir } => {
            let item = client.get_item(&oid).await.context("Failed to get the media")?;
            let outcome = client
                .download_media_metadata(&item, &dir, &MetadataOptions::default())
                .await
                .context("Metadata download failed")?;
            report_download(&outcome, quiet);
        }

        Command::DownloadResource { oid, dir, playable } => {
            let item = client.get_item(&oid).await.context("Failed to get the media")?;
            let options = ResourceOptions {
                must_be_playable: playable,
                ..ResourceOptions::default()
            };
            let outcome = client
                .download_best_resource(&item, &dir, &options)
                .await
                .context("Resource download failed")?;
            report_download(&outcome, quiet);
        }

        Command::Backup { oid, dir, replicate_tree, playable } => {
            let item = client.get_item(&oid).await.context("Failed to get the media")?;
            let options = BackupOptions {
                must_be_playable: playable,
                replicate_tree,
            };
            let outcome = client.backup_media(&item, &dir, &options).await.context("Backup failed")?;
            if !quiet {
                println!("{}", outcome.path().display());
            }
        }

        Command::Catalog { format, output } => {
            let catalog = client.get_catalog(format, None).await.context("Catalog export failed")?;
            let text = match catalog {
                Catalog::Json(value) => serde_json::to_string_pretty(&value)?,
                Catalog::Csv(text) => text,
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, text).with_context(|| format!("Cannot write \"{}\"", path.display()))?;
                    info!("Catalog written to \"{}\"", path.display());
                }
                None => println!("{}", text),
            }
        }

        Command::ImportUsers { csv } => {
            let summary = client.import_users_csv(&csv, None, None).await.context("Users import failed")?;
            if !quiet {
                println!(
                    "{} user(s) imported in group \"{}\" ({})",
                    summary.imported, summary.group_name, summary.group_id
                );
                for email in &summary.failed {
                    println!("Failed: {}", email);
                }
            }
        }

        Command::RemoveAllContent { yes } => {
            if !yes {
                anyhow::bail!("Refusing to delete all content without --yes");
            }
            let removed = client.remove_all_content(None, None).await.context("Content removal failed")?;
            if !quiet {
                println!("{} channel(s) deleted", removed);
            }
        }
    }
    Ok(())
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

fn report_download(outcome: &DownloadOutcome, quiet: bool) {
    if quiet {
        return;
    }
    match outcome {
        DownloadOutcome::Downloaded(path) => println!("Downloaded {}", path.display()),
        DownloadOutcome::Unchanged => println!("Already up to date"),
        DownloadOutcome::NoResource => println!("No resource to download"),
    }
}
