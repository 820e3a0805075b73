//! Session filesystem and sandbox
//!
//! Every session owns a sandbox directory plus a configurable list of
//! absolute roots. File operations and subprocess working directories
//! resolve against this pair; nothing outside it is reachable.

pub mod exec;
pub mod netfs;
pub mod os_sandbox;
pub mod paths;

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{AngelError, AngelResult};

pub use exec::{CommandHandle, ExitState, RunOptions};
pub use netfs::is_network_filesystem;

/// One directory entry, as reported to tools
#[derive(Debug, Clone, serde::Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Per-session filesystem handle
pub struct SessionFs {
    sandbox_dir: PathBuf,
    roots: RwLock<Vec<PathBuf>>,
    os_sandbox: std::sync::atomic::AtomicBool,
}

impl SessionFs {
    /// Create the handle, making the sandbox directory on first use
    pub fn new(sandbox_base: &Path, session_id: &str) -> AngelResult<Self> {
        let sandbox_dir = sandbox_base.join(session_id);
        std::fs::create_dir_all(&sandbox_dir)?;
        Ok(Self {
            sandbox_dir,
            roots: RwLock::new(Vec::new()),
            os_sandbox: std::sync::atomic::AtomicBool::new(true),
        })
    }

    /// Turn off OS-level subprocess isolation (hosts without namespace
    /// support); path containment stays enforced
    pub fn disable_os_sandbox(&self) {
        self.os_sandbox
            .store(false, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.read().clone()
    }

    /// Replace the root list atomically. Validation happens before any
    /// change; the sandbox directory is always implicitly accessible.
    pub fn set_roots(&self, new_roots: Vec<PathBuf>) -> AngelResult<()> {
        let normalized: Vec<PathBuf> = new_roots
            .iter()
            .map(|r| {
                paths::normalize(r)
                    .ok_or_else(|| AngelError::validation(format!("bad root {}", r.display())))
            })
            .collect::<AngelResult<_>>()?;
        paths::validate_roots(&normalized)?;
        *self.roots.write() = normalized;
        Ok(())
    }

    /// Resolve a user-supplied path (see [`paths::resolve`])
    pub fn resolve(&self, raw: &str) -> AngelResult<PathBuf> {
        paths::resolve(raw, &self.sandbox_dir, &self.roots.read())
    }

    pub fn read_file(&self, raw: &str) -> AngelResult<Vec<u8>> {
        let path = self.resolve(raw)?;
        std::fs::read(&path)
            .map_err(|e| map_io(e, &path))
    }

    pub fn write_file(&self, raw: &str, data: &[u8]) -> AngelResult<()> {
        let path = self.resolve(raw)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data).map_err(|e| map_io(e, &path))
    }

    pub fn read_dir(&self, raw: &str) -> AngelResult<Vec<DirEntry>> {
        let path = self.resolve(raw)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&path).map_err(|e| map_io(e, &path))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Spawn a shell subprocess whose working directory resolves like the
    /// file operations. The roots are passed through as writable mounts.
    pub fn run(&self, command_line: &str, working_dir: Option<&str>) -> AngelResult<CommandHandle> {
        self.run_with(command_line, working_dir, RunOptions::default())
    }

    pub fn run_with(
        &self,
        command_line: &str,
        working_dir: Option<&str>,
        mut opts: RunOptions,
    ) -> AngelResult<CommandHandle> {
        if let Some(dir) = working_dir {
            opts.working_dir = Some(self.resolve(dir)?);
        }
        if !self.os_sandbox.load(std::sync::atomic::Ordering::Relaxed) {
            opts.unsandboxed = true;
        }
        exec::spawn_shell(command_line, &self.sandbox_dir, &self.roots.read(), &opts)
    }

    /// Remove the sandbox directory (session deletion)
    pub fn destroy(self) -> AngelResult<()> {
        if self.sandbox_dir.exists() {
            std::fs::remove_dir_all(&self.sandbox_dir)?;
        }
        Ok(())
    }
}

fn map_io(err: std::io::Error, path: &Path) -> AngelError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            AngelError::not_found(format!("{} does not exist", path.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            AngelError::permission(format!("{} is not accessible", path.display()))
        }
        _ => err.into(),
    }
}
