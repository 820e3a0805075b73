//! Network-filesystem detection
//!
//! SQLite on NFS/SMB is a corruption risk, so startup refuses to place the
//! catalog database on a network mount. Detection is a best-effort statfs
//! probe; unknown platforms report `false`.

use std::path::Path;

/// Whether `path` lives on a network filesystem (NFS, SMB/CIFS, 9p, ...)
pub fn is_network_filesystem(path: &Path) -> bool {
    #[cfg(target_os = "linux")]
    {
        linux_probe(path)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
        tracing::debug!("network filesystem probing not supported on this platform");
        false
    }
}

#[cfg(target_os = "linux")]
fn linux_probe(path: &Path) -> bool {
    // statfs magic numbers from linux/magic.h
    const NFS_SUPER_MAGIC: i64 = 0x6969;
    const SMB_SUPER_MAGIC: i64 = 0x517b;
    const SMB2_MAGIC_NUMBER: i64 = 0xfe534d42;
    const CIFS_MAGIC_NUMBER: i64 = 0xff534d42;
    const V9FS_MAGIC: i64 = 0x01021997;
    const AFS_SUPER_MAGIC: i64 = 0x5346414f;
    const CODA_SUPER_MAGIC: i64 = 0x73757245;
    const OCFS2_SUPER_MAGIC: i64 = 0x7461636f;

    // Probe the deepest existing ancestor so the check works before the
    // data directory has been created.
    let mut probe = path;
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent,
            None => return false,
        }
    }

    match nix::sys::statfs::statfs(probe) {
        Ok(stat) => {
            let magic = stat.filesystem_type().0 as i64;
            matches!(
                magic,
                NFS_SUPER_MAGIC
                    | SMB_SUPER_MAGIC
                    | SMB2_MAGIC_NUMBER
                    | CIFS_MAGIC_NUMBER
                    | V9FS_MAGIC
                    | AFS_SUPER_MAGIC
                    | CODA_SUPER_MAGIC
                    | OCFS2_SUPER_MAGIC
            )
        }
        Err(err) => {
            tracing::warn!(path = %probe.display(), %err, "statfs probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_tempdir_is_not_network() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_network_filesystem(dir.path()));
    }

    #[test]
    fn test_missing_path_probes_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not/created/yet");
        assert!(!is_network_filesystem(&missing));
    }
}
