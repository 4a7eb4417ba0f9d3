use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, info_span, warn};
use walkdir::WalkDir;

use crate::archive::{lot_document_path, ArchiveTool, ToolError};
use crate::document::ParseError;
use crate::index::{DocumentIndex, RecordId};
use crate::mutator::{self, FieldNotFound};
use crate::request::{DocumentGroup, InvalidEntry, PlacementRequest, Position, RequestSet};
use crate::resolver::{resolve, MatchKind, NoCandidate, ResolverConfig};
use crate::{LotPatchError, Result};

/// Name of the per-run staging area created under the work dir.
pub const STAGING_DIR_NAME: &str = ".lotpatch-staging";

/// A request that was skipped; its document was still written.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error(transparent)]
    NoCandidate(#[from] NoCandidate),
    #[error(transparent)]
    FieldNotFound(#[from] FieldNotFound),
}

/// A failure that abandons a whole document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("could not stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("lot document {0} not found in unpacked container")]
    MissingDocument(PathBuf),

    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Folder holding the original `.arc` containers. Never written to.
    pub archive_dir: PathBuf,
    /// Parent of the staging area.
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    Applied {
        position: Position,
        previous: Option<u16>,
        matched_by: MatchKind,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub ordinal: usize,
    pub document: String,
    pub class_name: String,
    pub target: Position,
    pub new_identifier: u16,
    #[serde(flatten)]
    pub status: RequestStatus,
}

impl RequestOutcome {
    fn new(request: &PlacementRequest, status: RequestStatus) -> Self {
        Self {
            ordinal: request.ordinal(),
            document: request.document().file_name().to_string(),
            class_name: request.class_name().to_string(),
            target: request.target(),
            new_identifier: request.new_identifier(),
            status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentStatus {
    Repacked { container: PathBuf, records: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub document: String,
    #[serde(flatten)]
    pub status: DocumentStatus,
    pub requests: Vec<RequestOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub invalid: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} skipped, {} failed, {} invalid",
            self.applied, self.skipped, self.failed, self.invalid
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub output_dir: PathBuf,
    pub summary: Summary,
    pub documents: Vec<DocumentReport>,
    pub invalid: Vec<InvalidEntry>,
}

impl BatchReport {
    fn new(output_dir: PathBuf, documents: Vec<DocumentReport>, invalid: Vec<InvalidEntry>) -> Self {
        let mut summary = Summary {
            invalid: invalid.len(),
            ..Summary::default()
        };
        for outcome in documents.iter().flat_map(|d| &d.requests) {
            match outcome.status {
                RequestStatus::Applied { .. } => summary.applied += 1,
                RequestStatus::Skipped { .. } => summary.skipped += 1,
                RequestStatus::Failed { .. } => summary.failed += 1,
            }
        }

        Self {
            output_dir,
            summary,
            documents,
            invalid,
        }
    }

    /// Every request outcome, in batch order.
    pub fn outcomes(&self) -> Vec<&RequestOutcome> {
        let mut all: Vec<_> = self.documents.iter().flat_map(|d| &d.requests).collect();
        all.sort_by_key(|o| o.ordinal);
        all
    }
}

/// Process every document of the batch on a bounded worker pool.
///
/// Documents are independent: a failure in one never stops the others, and
/// a request that cannot be resolved or written only skips itself.
pub fn run_batch(
    requests: RequestSet,
    tool: &dyn ArchiveTool,
    options: &BatchOptions,
) -> Result<BatchReport> {
    fs::create_dir_all(&options.output_dir)?;
    let staging_root = options.work_dir.join(STAGING_DIR_NAME);
    fs::create_dir_all(&staging_root)?;

    let (groups, invalid) = requests.into_parts();
    info!(
        documents = groups.len(),
        requests = groups.iter().map(|g| g.requests.len()).sum::<usize>(),
        invalid = invalid.len(),
        workers = options.workers,
        "Starting batch"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers.max(1))
        .thread_name(|i| format!("lotpatch-worker-{i}"))
        .build()
        .map_err(|e| LotPatchError::Config(format!("could not start worker pool: {e}")));

    let documents = pool.map(|pool| {
        pool.install(|| {
            groups
                .par_iter()
                .map(|group| process_document(group, tool, options, &staging_root))
                .collect::<Vec<_>>()
        })
    });

    clean_staging_root(&staging_root);

    let report = BatchReport::new(options.output_dir.clone(), documents?, invalid);
    info!(summary = %report.summary, "Batch finished");
    Ok(report)
}

fn process_document(
    group: &DocumentGroup,
    tool: &dyn ArchiveTool,
    options: &BatchOptions,
    staging_root: &Path,
) -> DocumentReport {
    let span = info_span!("document", arc = %group.key);
    let _guard = span.enter();

    let result = StagingDir::create(staging_root.join(group.key.normalised()))
        .and_then(|staging| patch_document(group, tool, options, &staging));

    match result {
        Ok((container, records, requests)) => DocumentReport {
            document: group.key.file_name().to_string(),
            status: DocumentStatus::Repacked { container, records },
            requests,
        },
        Err(err) => {
            error!(error = %err, requests = group.requests.len(), "Document abandoned");
            let reason = err.to_string();
            DocumentReport {
                document: group.key.file_name().to_string(),
                status: DocumentStatus::Failed {
                    reason: reason.clone(),
                },
                requests: group
                    .requests
                    .iter()
                    .map(|r| {
                        RequestOutcome::new(
                            r,
                            RequestStatus::Failed {
                                reason: reason.clone(),
                            },
                        )
                    })
                    .collect(),
            }
        }
    }
}

/// Stage, unpack, patch, repack and publish one container.
fn patch_document(
    group: &DocumentGroup,
    tool: &dyn ArchiveTool,
    options: &BatchOptions,
    staging: &StagingDir,
) -> std::result::Result<(PathBuf, usize, Vec<RequestOutcome>), DocumentError> {
    let file_name = group.key.file_name();
    let original = options.archive_dir.join(file_name);
    let staged = staging.path().join(file_name);
    fs::copy(&original, &staged).map_err(|source| DocumentError::Stage {
        path: original.clone(),
        source,
    })?;
    info!(from = %original.display(), "Staged container");

    let unpacked = tool.unpack(&staged)?;

    let lot_path = lot_document_path(&unpacked, group.key.stem());
    if !lot_path.is_file() {
        return Err(DocumentError::MissingDocument(lot_path));
    }
    let content = fs::read(&lot_path).map_err(|source| DocumentError::Read {
        path: lot_path.clone(),
        source,
    })?;
    let mut index = DocumentIndex::build_at(&lot_path, &content).map_err(|source| DocumentError::Parse {
        path: lot_path.clone(),
        source,
    })?;
    info!(
        records = index.len(),
        classes = index.class_count(),
        skipped = index.skipped().len(),
        "Indexed lot document"
    );

    let mut written: HashMap<RecordId, (usize, u16)> = HashMap::new();
    let outcomes: Vec<RequestOutcome> = group
        .requests
        .iter()
        .map(|request| {
            let status = match apply_request(&mut index, request, &options.resolver, &mut written) {
                Ok(status) => status,
                Err(err) => {
                    warn!(
                        entry = request.ordinal(),
                        class = request.class_name(),
                        target = %request.target(),
                        error = %err,
                        "Request skipped"
                    );
                    RequestStatus::Skipped {
                        reason: err.to_string(),
                    }
                }
            };
            RequestOutcome::new(request, status)
        })
        .collect();

    fs::write(&lot_path, mutator::serialize(&index)).map_err(|source| DocumentError::Write {
        path: lot_path.clone(),
        source,
    })?;
    info!(path = %lot_path.display(), "Saved lot document");

    let container = tool.repack(&unpacked)?;
    let published = publish(&container, &options.output_dir, file_name)?;
    info!(output = %published.display(), "Published container");

    Ok((published, index.len(), outcomes))
}

/// Copy `container` into `output_dir` under `file_name`. The copy goes to a
/// hidden partial file first so the final name only ever holds a complete
/// container.
fn publish(
    container: &Path,
    output_dir: &Path,
    file_name: &str,
) -> std::result::Result<PathBuf, DocumentError> {
    let published = output_dir.join(file_name);
    let partial = output_dir.join(format!(".{file_name}.partial"));

    let moved = fs::copy(container, &partial).and_then(|_| fs::rename(&partial, &published));
    if let Err(source) = moved {
        if partial.exists() {
            if let Err(err) = fs::remove_file(&partial) {
                warn!(path = %partial.display(), error = %err, "Could not remove partial output");
            }
        }
        return Err(DocumentError::Write {
            path: published,
            source,
        });
    }

    Ok(published)
}

fn apply_request(
    index: &mut DocumentIndex,
    request: &PlacementRequest,
    config: &ResolverConfig,
    written: &mut HashMap<RecordId, (usize, u16)>,
) -> std::result::Result<RequestStatus, RequestError> {
    let (record, position, matched_by) = {
        let found = resolve(index, request.class_name(), request.target(), config)?;
        (found.record.id, found.record.position, found.kind)
    };

    let previous = mutator::apply(index, record, request.new_identifier())?;

    if let Some((earlier, earlier_id)) = written.insert(record, (request.ordinal(), request.new_identifier())) {
        warn!(
            entry = request.ordinal(),
            earlier_entry = earlier,
            class = request.class_name(),
            overwritten = earlier_id,
            new = request.new_identifier(),
            "Placement written twice in one batch; keeping the later value"
        );
    }

    info!(
        entry = request.ordinal(),
        class = request.class_name(),
        position = %position,
        matched_by = ?matched_by,
        previous = ?previous,
        new = request.new_identifier(),
        "Updated ItemId"
    );

    Ok(RequestStatus::Applied {
        position,
        previous,
        matched_by,
    })
}

/// Per-document working directory, removed on drop.
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(path: PathBuf) -> std::result::Result<Self, DocumentError> {
        let stage_err = |source| DocumentError::Stage {
            path: path.clone(),
            source,
        };
        if path.exists() {
            fs::remove_dir_all(&path).map_err(stage_err)?;
        }
        fs::create_dir_all(&path).map_err(stage_err)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %err, "Could not remove staging dir");
        }
    }
}

/// Remove anything a crashed or killed worker left behind, then the root.
fn clean_staging_root(root: &Path) {
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "Could not inspect staging area");
                continue;
            }
        };

        info!(path = %entry.path().display(), "Removing leftover staging entry");
        let removed = if entry.file_type().is_dir() {
            fs::remove_dir_all(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        if let Err(err) = removed {
            warn!(path = %entry.path().display(), error = %err, "Could not remove leftover");
        }
    }

    if let Err(err) = fs::remove_dir(root) {
        warn!(path = %root.display(), error = %err, "Could not remove staging area");
    }
}
