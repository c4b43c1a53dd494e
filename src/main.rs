//! hotpatch CLI - operator tool for the hot-patching toolkit.
//!
//! Inspects hot-patch metadata in PE files, runs the trace/logging service,
//! stops a running instance and drains the crash report repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use hotpatch::repository::{CopyToDirectory, CrashKeys, SystemClock};
use hotpatch::{
    EndpointConfig, HotPatchingMetadata, LoggerService, MappedImage, PeHeaders, ReportRepository, RepositoryConfig,
    RpcClient, Service, ServiceConfig, ServiceRegistration,
};

/// Hot-patching instrumentation toolkit.
#[derive(Parser)]
#[command(name = "hotpatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the hot-patch metadata of a PE file
    Metadata {
        /// Image file on disk
        image: PathBuf,
    },

    /// Run the trace/logging service until a client asks it to stop
    Service {
        /// Instance id clients select with HOTPATCH_INSTANCE_ID
        #[arg(long, default_value = hotpatch::trace::endpoint::DEFAULT_INSTANCE_ID)]
        instance_id: String,

        /// Directory for trace files
        #[arg(long)]
        trace_dir: PathBuf,

        /// Directory for minidumps (defaults to the trace directory)
        #[arg(long)]
        minidump_dir: Option<PathBuf>,

        /// Text log output (defaults to stderr)
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Ask a running service instance to stop
    Stop {
        #[arg(long, default_value = hotpatch::trace::endpoint::DEFAULT_INSTANCE_ID)]
        instance_id: String,

        /// Seconds to wait for the service to become ready
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Upload pending crash reports
    Upload {
        /// Repository root
        #[arg(long)]
        root: PathBuf,

        /// Where reports that fail every retry are kept
        #[arg(long)]
        permanent_failure_dir: PathBuf,

        /// Seconds before a failed report is retried
        #[arg(long, default_value = "3600")]
        retry_interval: u64,

        /// Reject every report instead of accepting it
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Metadata { image } => {
            list_metadata(&image)?;
        }

        Commands::Service {
            instance_id,
            trace_dir,
            minidump_dir,
            log_file,
        } => {
            run_service(instance_id, trace_dir, minidump_dir, log_file)?;
        }

        Commands::Stop { instance_id, timeout } => {
            let endpoint = EndpointConfig::with_instance_id(instance_id);
            let mut client = RpcClient::connect(&endpoint, Duration::from_secs(timeout))
                .with_context(|| format!("cannot reach {}", endpoint.endpoint_name()))?;
            client.stop()?;
            println!("Stop requested: {}", endpoint.endpoint_name());
        }

        Commands::Upload {
            root,
            permanent_failure_dir,
            retry_interval,
            dry_run,
        } => {
            upload(root, permanent_failure_dir, Duration::from_secs(retry_interval), dry_run)?;
        }
    }

    Ok(())
}

fn list_metadata(path: &Path) -> anyhow::Result<()> {
    let file = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let mapped = hotpatch::pe::map_file_image(&file)?;
    let headers = PeHeaders::parse(&mapped)?;
    let image = MappedImage::new(headers.image_base, &mapped);
    let metadata = HotPatchingMetadata::from_image_with_headers(&image, &headers)?;

    println!("{} ({} blocks):", path.display(), metadata.len());
    println!("{:<12} {:>12} {:>12}", "RVA", "Block", "Code");
    let mut total = 0u64;
    for entry in metadata.entries() {
        total += entry.block_size as u64;
        println!(
            "0x{:08X} {:>12} {:>12}",
            entry.rva,
            ByteSize::b(entry.block_size as u64),
            ByteSize::b(entry.code_size as u64)
        );
    }
    println!("Total: {}", ByteSize::b(total));
    Ok(())
}

fn run_service(
    instance_id: String,
    trace_dir: PathBuf,
    minidump_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = ServiceConfig {
        endpoint: EndpointConfig::with_instance_id(instance_id),
        minidump_dir: minidump_dir.unwrap_or_else(|| trace_dir.clone()),
        trace_dir,
        log_file,
        ..ServiceConfig::default()
    };
    let endpoint = config.endpoint.endpoint_name();

    let service = Service::new("logger", LoggerService::new(config)?);
    let _registration = ServiceRegistration::publish(Arc::new(service.clone()))?;
    service.start().context("service failed to start")?;
    println!("Listening on {endpoint}");

    service.join()?;
    println!("Service stopped");
    Ok(())
}

fn upload(root: PathBuf, permanent_failure_dir: PathBuf, retry_interval: Duration, dry_run: bool) -> anyhow::Result<()> {
    let config = RepositoryConfig { root, retry_interval };
    let uploader = move |minidump: &Path, crash_keys: &CrashKeys| {
        tracing::info!(report = %minidump.display(), keys = crash_keys.len(), dry_run, "uploading");
        !dry_run
    };
    let mut repository = ReportRepository::new(
        config,
        Box::new(SystemClock),
        Box::new(uploader),
        Box::new(CopyToDirectory::new(permanent_failure_dir)),
    );

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));

    let (mut uploaded, mut failed) = (0usize, 0usize);
    loop {
        let before = repository.report_count();
        pb.set_message(format!("{before} pending, {uploaded} uploaded, {failed} failed"));
        if before == 0 {
            break;
        }
        let ok = repository.upload_pending_report();
        let after = repository.report_count();
        match (ok, after < before) {
            (true, true) => uploaded += 1,
            // Nothing left that is old enough to retry.
            (true, false) => break,
            (false, _) => failed += 1,
        }
    }

    pb.finish_with_message(format!(
        "{uploaded} uploaded, {failed} failed, {} waiting",
        repository.report_count()
    ));
    Ok(())
}
