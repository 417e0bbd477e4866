use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug)]
pub struct WorkspaceLockedError;

impl std::fmt::Display for WorkspaceLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "workspace locked by another process")
    }
}

impl std::error::Error for WorkspaceLockedError {}

#[derive(Debug)]
pub struct WorkspaceLock {
    #[allow(dead_code)]
    file: fs::File,
    path: PathBuf,
}

/// Pre-sync check: the workspace directory must be writable.
pub fn ensure_writable(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir).with_context(|| format!("create {}", data_dir.display()))?;
    let probe = data_dir.join(".data").join(".write-probe");
    if let Some(parent) = probe.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&probe, b"ok").with_context(|| format!("write probe to {}", data_dir.display()))?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

/// Pre-sync check: at least `min_bytes` free on the volume backing `data_dir` (§4.1).
pub fn ensure_free_space(data_dir: &Path, min_bytes: u64) -> Result<()> {
    let available = available_bytes(data_dir)?;
    if available < min_bytes {
        anyhow::bail!(
            "only {available} bytes free at {} (need at least {min_bytes})",
            data_dir.display()
        );
    }
    Ok(())
}

#[cfg(unix)]
fn available_bytes(data_dir: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    #[repr(C)]
    struct Statvfs {
        f_bsize: u64,
        f_frsize: u64,
        f_blocks: u64,
        f_bfree: u64,
        f_bavail: u64,
        _rest: [u64; 6],
    }
    extern "C" {
        fn statvfs(path: *const libc_char, buf: *mut Statvfs) -> i32;
    }
    type libc_char = std::os::raw::c_char;

    let cpath = CString::new(data_dir.as_os_str().as_bytes()).context("path to cstring")?;
    let mut stat: Statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("statvfs");
    }
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

#[cfg(windows)]
fn available_bytes(data_dir: &Path) -> Result<u64> {
    use std::os::windows::ffi::OsStrExt;

    extern "system" {
        fn GetDiskFreeSpaceExW(
            dir: *const u16,
            free_bytes_available: *mut u64,
            total_bytes: *mut u64,
            total_free_bytes: *mut u64,
        ) -> i32;
    }

    let wide: Vec<u16> = data_dir
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    let mut free_available: u64 = 0;
    let rc = unsafe {
        GetDiskFreeSpaceExW(wide.as_ptr(), &mut free_available, std::ptr::null_mut(), std::ptr::null_mut())
    };
    if rc == 0 {
        return Err(std::io::Error::last_os_error()).context("GetDiskFreeSpaceExW");
    }
    Ok(free_available)
}

pub fn ensure_workspace_layout(data_dir: &Path, email: &str) -> Result<()> {
    let apps_dir = data_dir.join("apps");
    let meta_dir = data_dir.join(".data");
    let datasites_dir = data_dir.join("datasites");
    let root_dir = datasites_dir.join(email);
    let public_dir = root_dir.join("public");

    fs::create_dir_all(&apps_dir).with_context(|| format!("create {}", apps_dir.display()))?;
    fs::create_dir_all(&meta_dir).with_context(|| format!("create {}", meta_dir.display()))?;
    fs::create_dir_all(&public_dir).with_context(|| format!("create {}", public_dir.display()))?;

    let root_acl = root_dir.join("syft.pub.yaml");
    if !root_acl.exists() {
        let content = "terminal: false\nrules:\n  - pattern: '**'\n    access:\n      admin: []\n      write: []\n      read: []\n";
        fs::write(&root_acl, content).with_context(|| format!("write {}", root_acl.display()))?;
    }

    let public_acl = public_dir.join("syft.pub.yaml");
    if !public_acl.exists() {
        let content =
            "terminal: false\nrules:\n  - pattern: '**'\n    access:\n      admin: []\n      write: []\n      read: ['*']\n";
        fs::write(&public_acl, content)
            .with_context(|| format!("write {}", public_acl.display()))?;
    }

    Ok(())
}

impl WorkspaceLock {
    pub fn try_lock(data_dir: &Path) -> Result<Self> {
        let meta_dir = data_dir.join(".data");
        fs::create_dir_all(&meta_dir).with_context(|| format!("create {}", meta_dir.display()))?;
        let lock_path = meta_dir.join("syftbox.lock");
        let file = open_lock_file(&lock_path)?;
        lock_file(&file).context("lock")?;

        Ok(Self {
            file,
            path: lock_path,
        })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        // Best-effort unlock + remove, mirroring Go's Unlock() removing the lock file.
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn lock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;

    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let raw = err.raw_os_error();
    // macOS uses EWOULDBLOCK=35; Linux typically uses EWOULDBLOCK/EAGAIN=11.
    if err.kind() == std::io::ErrorKind::WouldBlock || raw == Some(11) || raw == Some(35) {
        return Err(WorkspaceLockedError.into());
    }
    Err(err).context("flock")
}

#[cfg(unix)]
fn unlock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_UN: i32 = 8;
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("flock unlock")
    }
}

#[cfg(windows)]
fn lock_file(_file: &fs::File) -> Result<()> {
    // open_lock_file() uses create_new so locking is implicit.
    Ok(())
}

#[cfg(windows)]
fn unlock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open {}", lock_path.display()))
}

#[cfg(windows)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    // Emulate an exclusive lock by atomically creating the file.
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(lock_path);
    match file {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(WorkspaceLockedError.into()),
        Err(e) => Err(e).with_context(|| format!("open {}", lock_path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_workspace_layout_creates_dirs_and_acls() {
        let tmp = std::env::temp_dir().join("syftbox-rs-workspace-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        ensure_workspace_layout(&tmp, "alice@example.com").unwrap();
        assert!(tmp.join("apps").is_dir());
        assert!(tmp.join(".data").is_dir());
        assert!(tmp
            .join("datasites")
            .join("alice@example.com")
            .join("public")
            .is_dir());
        assert!(tmp
            .join("datasites")
            .join("alice@example.com")
            .join("syft.pub.yaml")
            .is_file());
        assert!(tmp
            .join("datasites")
            .join("alice@example.com")
            .join("public")
            .join("syft.pub.yaml")
            .is_file());
    }

    #[test]
    fn workspace_lock_is_exclusive_and_released_on_drop() {
        let tmp = std::env::temp_dir().join("syftbox-rs-workspace-lock-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let lock1 = WorkspaceLock::try_lock(&tmp).unwrap();
        let err = WorkspaceLock::try_lock(&tmp).unwrap_err();
        let mut found = false;
        for cause in err.chain() {
            if cause.is::<WorkspaceLockedError>() {
                found = true;
                break;
            }
        }
        assert!(found, "expected WorkspaceLockedError, got: {err:#}");

        drop(lock1);
        let _lock2 = WorkspaceLock::try_lock(&tmp).unwrap();
    }
}
