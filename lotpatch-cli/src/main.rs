use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use lotpatch_core::{run, AbsentFlagRule, LotPatchError, PatchSettings};

#[derive(Debug, Parser)]
#[command(
    name = "lotpatch",
    version,
    about = "Rewrites item placements in RE5 level containers from an AP*.json batch"
)]
struct Args {
    /// Folder holding the original .arc containers
    /// (usually `...\nativePC_MT\Image\Archive`). Remembered between runs.
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Batch file; defaults to the first AP*.json in the work dir.
    #[arg(long)]
    input: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Output folder; defaults to `<work-dir>/<batch stem>_output`.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Folder containing the pc-re5 unpack/pack scripts; defaults to the work dir.
    #[arg(long)]
    tool_dir: Option<PathBuf>,

    /// Folder for process_log_*.log files; defaults to `<work-dir>/logs`.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    /// Match placements without an ItemType flag by distance too.
    #[arg(long, default_value_t = false)]
    absent_flag_positional: bool,

    #[arg(long, default_value_t = false)]
    no_report: bool,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct CliConfig {
    archive_dir: Option<PathBuf>,
}

fn config_path() -> Option<PathBuf> {
    let mut base = dirs::config_dir().or_else(dirs::data_dir)?;
    base.push("LotPatch");
    base.push("cli_config.json");
    Some(base)
}

fn load_config() -> CliConfig {
    if let Some(path) = config_path() {
        if let Ok(data) = fs::read_to_string(&path) {
            if let Ok(cfg) = serde_json::from_str::<CliConfig>(&data) {
                return cfg;
            }
        }
    }
    CliConfig::default()
}

fn save_config(cfg: &CliConfig) {
    if let Some(path) = config_path() {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(data) = serde_json::to_string_pretty(cfg) {
            if let Err(err) = fs::write(&path, data) {
                warn!(path = %path.display(), error = %err, "Could not save config");
            }
        }
    }
}

fn log_file_path(log_dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    log_dir.join(format!("process_log_{stamp}.log"))
}

/// Installs stderr logging plus a plain-text log file. Returns the file
/// path, or the reason the file could not be opened.
fn init_logging(debug: bool, log_dir: &Path) -> Result<PathBuf, (PathBuf, std::io::Error)> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let path = log_file_path(log_dir);
    let file = fs::create_dir_all(log_dir).and_then(|_| File::create(&path));

    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    match file {
        Ok(file) => {
            let file_layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(filter());
            tracing_subscriber::registry()
                .with(stderr)
                .with(file_layer)
                .init();
            Ok(path)
        }
        Err(err) => {
            tracing_subscriber::registry().with(stderr).init();
            Err((path, err))
        }
    }
}

fn resolve_archive_dir(flag: Option<PathBuf>, saved: &CliConfig) -> Result<PathBuf, LotPatchError> {
    flag.or_else(|| saved.archive_dir.clone()).ok_or_else(|| {
        LotPatchError::Config(
            "no archive folder given; pass --archive-dir pointing at \
             <game>\\nativePC_MT\\Image\\Archive"
                .to_string(),
        )
    })
}

fn main() {
    let args = Args::parse();
    let started = Instant::now();

    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| args.work_dir.join("logs"));
    match init_logging(args.debug, &log_dir) {
        Ok(path) => info!(path = %path.display(), "Logging to file"),
        Err((path, err)) => {
            warn!(path = %path.display(), error = %err, "Could not create log file; logging to stderr only")
        }
    }

    let mut config = load_config();
    let archive_dir = match resolve_archive_dir(args.archive_dir, &config) {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    let mut settings = PatchSettings::new(archive_dir.clone(), args.work_dir);
    settings.batch_path = args.input;
    settings.output_dir = args.output;
    settings.tool_dir = args.tool_dir;
    settings.workers = args.workers;
    settings.write_report = !args.no_report;
    if args.absent_flag_positional {
        settings.absent_flag = AbsentFlagRule::Positional;
    }

    match run(&settings) {
        Ok(report) => {
            config.archive_dir = Some(archive_dir);
            save_config(&config);

            println!("{}", report.summary);
            println!("Output: {}", report.output_dir.display());
            println!(
                "Program completed in {:.2} seconds",
                started.elapsed().as_secs_f64()
            );
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_parse_into_settings_inputs() {
        let args = Args::parse_from([
            "lotpatch",
            "--archive-dir",
            "Archive",
            "--workers",
            "3",
            "--absent-flag-positional",
            "--no-report",
        ]);
        assert_eq!(args.archive_dir, Some(PathBuf::from("Archive")));
        assert_eq!(args.workers, Some(3));
        assert!(args.absent_flag_positional);
        assert!(args.no_report);
        assert_eq!(args.work_dir, PathBuf::from("."));
    }

    #[test]
    fn archive_dir_falls_back_to_saved_config() {
        let saved = CliConfig {
            archive_dir: Some(PathBuf::from("saved")),
        };
        assert_eq!(
            resolve_archive_dir(None, &saved).unwrap(),
            PathBuf::from("saved")
        );
        assert_eq!(
            resolve_archive_dir(Some(PathBuf::from("flag")), &saved).unwrap(),
            PathBuf::from("flag")
        );
        assert!(resolve_archive_dir(None, &CliConfig::default()).is_err());
    }

    #[test]
    fn config_tolerates_missing_fields() {
        let cfg: CliConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.archive_dir.is_none());
    }

    #[test]
    fn log_file_is_timestamped() {
        let path = log_file_path(Path::new("logs"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("process_log_") && name.ends_with(".log"));
        assert_eq!(name.len(), "process_log_20240101_120000.log".len());
    }
}
