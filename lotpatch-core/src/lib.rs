use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::info;

pub mod archive;
pub mod batch;
pub mod document;
pub mod index;
pub mod mutator;
pub mod request;
pub mod resolver;

pub use archive::{ArchiveTool, ScriptArchiveTool, ToolError};
pub use batch::{run_batch, BatchOptions, BatchReport, Summary};
pub use index::DocumentIndex;
pub use request::{DocumentKey, PlacementRequest, Position, RequestSet};
pub use resolver::{AbsentFlagRule, ResolverConfig};

/// Suffix of the per-batch output folder: `AP_1234.json` -> `AP_1234_output/`.
pub const OUTPUT_SUFFIX: &str = "_output";

/// File name of the JSON outcome report written into the output folder.
pub const REPORT_FILE_NAME: &str = "placement_report.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSettings {
    /// Game folder holding the original `.arc` containers.
    pub archive_dir: PathBuf,
    /// Batch JSON; discovered in `work_dir` when absent.
    pub batch_path: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    /// Folder with the unpack/pack scripts; `work_dir` when absent.
    pub tool_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub absent_flag: AbsentFlagRule,
    pub write_report: bool,
}

impl PatchSettings {
    pub fn new(archive_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            batch_path: None,
            work_dir: work_dir.into(),
            output_dir: None,
            tool_dir: None,
            workers: None,
            absent_flag: AbsentFlagRule::default(),
            write_report: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LotPatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("batch file is not a JSON array of entries: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LotPatchError>;

/// First `AP*.json` in `dir`, by name.
pub fn find_batch_file(dir: &Path) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("AP") && n.ends_with(".json"))
        })
        .collect();
    candidates.sort();

    candidates.into_iter().next().ok_or_else(|| {
        LotPatchError::Config(format!("no AP*.json batch file found in {}", dir.display()))
    })
}

pub fn default_output_dir(work_dir: &Path, batch_path: &Path) -> PathBuf {
    let stem = batch_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "batch".to_string());
    work_dir.join(format!("{stem}{OUTPUT_SUFFIX}"))
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Load the batch, patch every container it names, and publish the results.
pub fn run(settings: &PatchSettings) -> Result<BatchReport> {
    let started = Instant::now();

    if !settings.archive_dir.is_dir() {
        return Err(LotPatchError::Config(format!(
            "Archive folder does not exist: {}",
            settings.archive_dir.display()
        )));
    }

    let batch_path = match &settings.batch_path {
        Some(path) => path.clone(),
        None => find_batch_file(&settings.work_dir)?,
    };
    let text = fs::read_to_string(&batch_path)?;
    let requests = RequestSet::from_json(&text)?;
    info!(
        batch = %batch_path.display(),
        requests = requests.request_count(),
        documents = requests.document_count(),
        invalid = requests.invalid().len(),
        "Loaded batch"
    );

    let output_dir = settings
        .output_dir
        .clone()
        .unwrap_or_else(|| default_output_dir(&settings.work_dir, &batch_path));
    let tool_dir = settings
        .tool_dir
        .clone()
        .unwrap_or_else(|| settings.work_dir.clone());

    let options = BatchOptions {
        archive_dir: settings.archive_dir.clone(),
        work_dir: settings.work_dir.clone(),
        output_dir,
        workers: settings.workers.unwrap_or_else(default_workers),
        resolver: ResolverConfig {
            absent_flag: settings.absent_flag,
        },
    };

    let tool = ScriptArchiveTool::new(tool_dir);
    let report = run_batch(requests, &tool, &options)?;

    if settings.write_report {
        let path = report.output_dir.join(REPORT_FILE_NAME);
        fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        info!(path = %path.display(), "Wrote placement report");
    }

    info!(
        seconds = started.elapsed().as_secs_f64(),
        "Program completed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_file_is_the_first_ap_json() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["notes.json", "AP_B.json", "AP_A.json", "AP_C.txt"] {
            fs::write(dir.path().join(name), "[]").unwrap();
        }
        fs::create_dir(dir.path().join("AP_0.json")).unwrap();

        assert_eq!(find_batch_file(dir.path()).unwrap(), dir.path().join("AP_A.json"));
    }

    #[test]
    fn missing_batch_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(find_batch_file(dir.path()), Err(LotPatchError::Config(_))));
    }

    #[test]
    fn output_dir_is_named_after_the_batch() {
        assert_eq!(
            default_output_dir(Path::new("work"), Path::new("elsewhere/AP_77.json")),
            Path::new("work").join("AP_77_output")
        );
    }

    #[test]
    fn run_rejects_a_missing_archive_folder() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PatchSettings::new(dir.path().join("missing"), dir.path());
        assert!(matches!(run(&settings), Err(LotPatchError::Config(_))));
    }

    #[test]
    fn run_rejects_a_batch_that_is_not_an_array() {
        let dir = tempfile::tempdir().unwrap();
        let batch = dir.path().join("AP_1.json");
        fs::write(&batch, r#"{"item_xml_id": 1}"#).unwrap();

        let settings = PatchSettings::new(dir.path(), dir.path());
        assert!(matches!(run(&settings), Err(LotPatchError::Json(_))));
    }
}
