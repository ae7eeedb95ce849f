use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use nxshot_core::title_ids::metadata_path;
use nxshot_core::{
    ArchiveControl, ArchiveError, ArchiveOptions, BuildOptions, CancellationToken, CaptureIdKey,
    DestinationPicker, Phase, Progress,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nxshot", version, about = "Organize Nintendo Switch captures into a game-sorted zip archive")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an archive grouped by game from a capture folder or zip
    Archive(ArchiveArgs),
    /// Check a produced archive's layout and timestamps
    Verify {
        /// Archive to check
        archive: PathBuf,
    },
    /// Maintain the capture ID -> game name table
    Ids {
        #[command(subcommand)]
        command: IdsCommand,
    },
}

#[derive(Subcommand)]
enum IdsCommand {
    /// Build captureIds.json from local title database dumps
    Build(BuildArgs),
    /// Show the metadata recorded next to a captureIds.json
    Info {
        /// captureIds.json or captureIds.meta.json
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct BuildArgs {
    /// AES-128 key (32 hex digits) that turns title IDs into capture IDs
    #[arg(long, env = "NXSHOT_CAPTURE_ID_KEY", hide_env_values = true)]
    key: String,

    /// nswdb.com release list (xml.php)
    #[arg(long)]
    nswdb: Option<PathBuf>,

    /// titledb US.en.json; merged last, its names win
    #[arg(long)]
    titledb: Option<PathBuf>,

    /// Table to write; metadata goes next to it
    #[arg(short, long, default_value = "captureIds.json")]
    output: PathBuf,

    /// Merge into the existing table instead of replacing it
    #[arg(long)]
    keep_existing: bool,

    /// Report counts without writing anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(clap::Args)]
struct ArchiveArgs {
    /// Capture folder (e.g. <SD card>/Nintendo/Album) or an exported .zip
    source: PathBuf,

    /// Write the archive to this path instead of the download directory
    #[arg(short, long, env = "NXSHOT_OUTPUT")]
    output: Option<PathBuf>,

    /// Overwrite --output without asking
    #[arg(long)]
    force: bool,

    /// Directory for streamed or buffered downloads
    #[arg(long, env = "NXSHOT_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Where to save the archive if the download directory is unusable
    #[arg(long, env = "NXSHOT_FALLBACK_DIR")]
    fallback_dir: Option<PathBuf>,

    /// File name used in the download directory
    #[arg(long, env = "NXSHOT_ARCHIVE_NAME", default_value = nxshot_core::SUGGESTED_ARCHIVE_NAME)]
    name: String,

    /// captureIds.json mapping capture IDs to game names
    #[arg(long, env = "NXSHOT_CAPTURE_IDS")]
    capture_ids: Option<PathBuf>,

    /// Build the whole archive in memory before saving it
    #[arg(long)]
    no_stream: bool,
}

/// Confirms before replacing an existing file; declining cancels the run.
struct ConfirmOverwrite {
    path: PathBuf,
    force: bool,
}

impl DestinationPicker for ConfirmOverwrite {
    fn pick(&self, _suggested: &str) -> io::Result<Option<PathBuf>> {
        if self.force || !self.path.exists() {
            return Ok(Some(self.path.clone()));
        }
        eprint!("{} exists. Overwrite? [y/N] ", self.path.display());
        io::stderr().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if matches!(answer.trim(), "y" | "Y" | "yes") {
            Ok(Some(self.path.clone()))
        } else {
            Ok(None)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("NXSHOT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn archive(args: ArchiveArgs, token: CancellationToken) -> anyhow::Result<()> {
    let t_total = std::time::Instant::now();

    let mut options = ArchiveOptions::new(args.source);
    if let Some(dir) = args.download_dir {
        options.download_dir = dir;
    }
    if let Some(dir) = args.fallback_dir {
        options.fallback_dir = dir;
    }
    options.archive_name = args.name;
    options.capture_ids = args.capture_ids;
    options.streaming = !args.no_stream;

    let mut control = ArchiveControl::new().with_cancel_token(token);
    if let Some(path) = args.output {
        control = control.with_picker(ConfirmOverwrite {
            path: path.clone(),
            force: args.force,
        });
        options.output = Some(path);
    }

    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40} {pos}/{len} {msg}",
    )?);
    let on_progress = |p: &Progress| {
        bar.set_length(p.total);
        bar.set_position(p.current);
        bar.set_message(match p.phase {
            Phase::Processing => "Processing",
            Phase::Finalizing => "Finalizing",
        });
    };

    let result = nxshot_core::run_archive(&options, control, &on_progress);
    bar.finish_and_clear();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            if matches!(e.downcast_ref::<ArchiveError>(), Some(ArchiveError::Cancelled)) {
                warn!("archive run cancelled, nothing was saved");
            }
            return Err(e);
        }
    };

    for rejected in &summary.rejected {
        eprintln!("Skipped {}: {}", rejected.filename, rejected.reason);
    }
    eprintln!(
        "Done! {} captures written to {} ({:.1} MiB, {:.2}s)",
        summary.entries,
        summary.archive_name,
        summary.bytes_written as f64 / (1024.0 * 1024.0),
        t_total.elapsed().as_secs_f64()
    );
    Ok(())
}

fn verify(path: PathBuf) -> anyhow::Result<()> {
    let report = nxshot_core::verify_archive(&path)?;
    for (folder, count) in &report.folders {
        eprintln!("{count:>6}  {folder}");
    }
    for problem in &report.problems {
        eprintln!("problem: {problem}");
    }
    if !report.is_ok() {
        anyhow::bail!("{} problem(s) in {} entries", report.problems.len(), report.entries);
    }
    eprintln!("{} entries OK", report.entries);
    Ok(())
}

fn build_ids(args: BuildArgs) -> anyhow::Result<()> {
    let key = CaptureIdKey::from_hex(&args.key)?;
    if args.nswdb.is_none() && args.titledb.is_none() {
        anyhow::bail!("pass at least one of --nswdb or --titledb");
    }
    let options = BuildOptions {
        output: args.output,
        nswdb: args.nswdb,
        titledb: args.titledb,
        keep_existing: args.keep_existing,
        dry_run: args.dry_run,
    };
    let meta = nxshot_core::build_table(&options, &key)?;
    for (name, source) in &meta.sources {
        eprintln!("{:>8}  {}", source.count, name);
    }
    eprintln!("{} capture IDs", meta.total_count);
    Ok(())
}

fn ids_info(path: PathBuf) -> anyhow::Result<()> {
    let is_meta = path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().ends_with(".meta.json"));
    let meta_path = if is_meta { path } else { metadata_path(&path) };
    let meta = nxshot_core::read_metadata(&meta_path)?;
    eprintln!("{} capture IDs, generated {}", meta.total_count, meta.generated_at);
    for (name, source) in &meta.sources {
        eprintln!(
            "{:>8}  {}  fetched {}, source updated {}",
            source.count,
            name,
            source.fetched_at,
            source.source_updated_at.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Archive(args) => {
            let token = CancellationToken::new();
            let handler_token = token.clone();
            ctrlc::set_handler(move || {
                info!("cancelling");
                handler_token.cancel();
            })?;
            archive(args, token)
        }
        Command::Verify { archive } => verify(archive),
        Command::Ids { command } => match command {
            IdsCommand::Build(args) => build_ids(args),
            IdsCommand::Info { path } => ids_info(path),
        },
    }
}
