//! OS-level subprocess isolation
//!
//! Platform contract: the subprocess sees the filesystem read-only except
//! for the session sandbox and explicitly added writable roots.
//!
//! - Linux: a new user + mount namespace; root is remounted read-only and
//!   the writable paths are bind-mounted over themselves afterwards, which
//!   creates fresh read-write mounts.
//! - Windows: the sandbox directory is mapped under a freshly substituted
//!   drive letter; teardown removes the mapping.
//! - macOS: not implemented; callers must run unsandboxed or refuse.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::{AngelError, AngelResult};

/// What the sandboxed process may write to
pub struct SandboxSpec<'a> {
    pub sandbox_dir: &'a Path,
    pub writable: &'a [PathBuf],
}

/// Cleanup to run when the command handle is closed
pub type Teardown = Option<Box<dyn FnOnce() + Send>>;

/// Apply platform isolation to `cmd` before it is spawned
pub fn apply(cmd: &mut Command, spec: &SandboxSpec<'_>) -> AngelResult<Teardown> {
    #[cfg(target_os = "linux")]
    {
        linux_apply(cmd, spec)?;
        Ok(None)
    }
    #[cfg(target_os = "windows")]
    {
        windows_apply(cmd, spec)
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        let _ = (cmd, spec);
        Err(AngelError::permission(
            "command sandboxing is not implemented on this platform",
        ))
    }
}

/// Whether [`apply`] can succeed on this platform
pub fn is_available() -> bool {
    cfg!(any(target_os = "linux", target_os = "windows"))
}

#[cfg(target_os = "linux")]
fn linux_apply(cmd: &mut Command, spec: &SandboxSpec<'_>) -> AngelResult<()> {
    use std::ffi::CString;

    let mut rw_paths: Vec<CString> = Vec::with_capacity(spec.writable.len() + 1);
    for path in std::iter::once(&spec.sandbox_dir.to_path_buf()).chain(spec.writable.iter()) {
        let raw = path.to_str().ok_or_else(|| {
            AngelError::validation(format!("non-UTF-8 sandbox path {}", path.display()))
        })?;
        rw_paths.push(
            CString::new(raw)
                .map_err(|_| AngelError::validation("sandbox path contains NUL"))?,
        );
    }

    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();

    // Runs between fork and exec in the child. Only syscalls and small
    // writes; every failure aborts the spawn with the underlying errno.
    unsafe {
        cmd.pre_exec(move || {
            use nix::mount::{mount, MsFlags};
            use nix::sched::{unshare, CloneFlags};

            unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

            std::fs::write("/proc/self/setgroups", "deny")?;
            std::fs::write("/proc/self/uid_map", format!("{uid} {uid} 1"))?;
            std::fs::write("/proc/self/gid_map", format!("{gid} {gid} 1"))?;

            // Stop mount events from leaking back, then lock the root down.
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

            // Self-binds mounted after the read-only remount are fresh
            // mounts and stay writable.
            for path in &rw_paths {
                mount(
                    Some(path.as_c_str()),
                    path.as_c_str(),
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            }

            Ok(())
        });
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn windows_apply(cmd: &mut Command, spec: &SandboxSpec<'_>) -> AngelResult<Teardown> {
    // Map the sandbox under a fresh drive letter and run from there.
    let sandbox = spec.sandbox_dir.to_path_buf();
    let letter = ('D'..='Z')
        .rev()
        .map(|c| format!("{c}:"))
        .find(|drive| !Path::new(&format!("{drive}\\")).exists())
        .ok_or_else(|| AngelError::permission("no free drive letter for sandbox"))?;

    let status = std::process::Command::new("subst")
        .arg(&letter)
        .arg(&sandbox)
        .status()?;
    if !status.success() {
        return Err(AngelError::permission(format!(
            "subst {letter} {} failed",
            sandbox.display()
        )));
    }
    cmd.current_dir(format!("{letter}\\"));

    let teardown_letter = letter.clone();
    Ok(Some(Box::new(move || {
        let _ = std::process::Command::new("subst")
            .arg("/D")
            .arg(&teardown_letter)
            .status();
    })))
}
