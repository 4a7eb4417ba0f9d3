use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status} for {argument}{}", stderr_suffix(.stderr))]
    Failed {
        program: PathBuf,
        argument: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("{program} reported success but {expected} does not exist")]
    MissingOutput { program: PathBuf, expected: PathBuf },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// Unpacks and repacks `.arc` containers.
///
/// `unpack` turns a container into a directory tree whose location is
/// derived from the container's base name; `repack` turns that tree back
/// into a container. Implementations are shared by all workers.
pub trait ArchiveTool: Send + Sync {
    fn unpack(&self, container: &Path) -> Result<PathBuf, ToolError>;
    fn repack(&self, working_dir: &Path) -> Result<PathBuf, ToolError>;
}

/// Directory an unpacked container lands in: `s101.arc` -> `s101/`.
pub fn unpacked_dir(container: &Path) -> PathBuf {
    container.with_extension("")
}

/// Container produced from an unpacked tree: `s101/` -> `s101.arc`.
pub fn packed_container(working_dir: &Path) -> PathBuf {
    let mut name: OsString = working_dir.as_os_str().to_owned();
    name.push(".arc");
    PathBuf::from(name)
}

/// Location of the item lot document inside an unpacked level container.
pub fn lot_document_path(unpacked: &Path, stem: &str) -> PathBuf {
    unpacked
        .join("stage")
        .join(stem)
        .join("soft")
        .join(format!("{stem}_item.lot.xml"))
}

/// Runs the community `pc-re5` unpack/pack scripts as subprocesses.
#[derive(Debug, Clone)]
pub struct ScriptArchiveTool {
    tool_dir: PathBuf,
    unpack_script: String,
    pack_script: String,
}

impl ScriptArchiveTool {
    pub fn new(tool_dir: impl Into<PathBuf>) -> Self {
        let (unpack_script, pack_script) = if cfg!(windows) {
            ("pc-re5.bat", "pc-re5-pack.bat")
        } else {
            ("pc-re5.sh", "pc-re5-pack.sh")
        };
        Self::with_scripts(tool_dir, unpack_script, pack_script)
    }

    pub fn with_scripts(
        tool_dir: impl Into<PathBuf>,
        unpack_script: impl Into<String>,
        pack_script: impl Into<String>,
    ) -> Self {
        Self {
            tool_dir: tool_dir.into(),
            unpack_script: unpack_script.into(),
            pack_script: pack_script.into(),
        }
    }

    pub fn unpack_program(&self) -> PathBuf {
        self.tool_dir.join(&self.unpack_script)
    }

    pub fn pack_program(&self) -> PathBuf {
        self.tool_dir.join(&self.pack_script)
    }

    fn run(&self, program: PathBuf, argument: &Path) -> Result<PathBuf, ToolError> {
        debug!(program = %program.display(), argument = %argument.display(), "Running archive tool");

        let output = Command::new(&program)
            .arg(argument)
            .output()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(output = %stdout.trim(), "Archive tool stdout");
        }

        if !output.status.success() {
            return Err(ToolError::Failed {
                program,
                argument: argument.to_path_buf(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(program)
    }
}

impl ArchiveTool for ScriptArchiveTool {
    fn unpack(&self, container: &Path) -> Result<PathBuf, ToolError> {
        let program = self.run(self.unpack_program(), container)?;
        let expected = unpacked_dir(container);
        if !expected.is_dir() {
            return Err(ToolError::MissingOutput { program, expected });
        }
        info!(container = %container.display(), "Unpacked container");
        Ok(expected)
    }

    fn repack(&self, working_dir: &Path) -> Result<PathBuf, ToolError> {
        let program = self.run(self.pack_program(), working_dir)?;
        let expected = packed_container(working_dir);
        if !expected.is_file() {
            return Err(ToolError::MissingOutput { program, expected });
        }
        info!(container = %expected.display(), "Repacked container");
        Ok(expected)
    }
}
