use std::ffi::CStr;
use std::path::Path;

use anyhow::Context;

/// Best-effort node hostname: `$HOSTNAME` when set, then `gethostname(2)`,
/// then `"unknown"`.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }

    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: buf is valid for the passed length for the duration of the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) };
    if rc == 0 {
        // SAFETY: gethostname NUL-terminates on success for any non-truncated name.
        let raw = unsafe { CStr::from_ptr(buf.as_ptr()) };
        if let Ok(name) = raw.to_str() {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "unknown".to_string()
}

/// Write `pid` as decimal text to `path`, creating parent directories.
pub fn write_pid_file(path: &Path, pid: u32) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create pid file directory {}", parent.display()))?;
        }
    }
    std::fs::write(path, pid.to_string())
        .with_context(|| format!("write pid file {}", path.display()))
}

/// Remove a pid file, ignoring a file that is already gone.
pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}
