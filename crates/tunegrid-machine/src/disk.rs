//! Root filesystem usage.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Used percentage of the filesystem holding `path`, from `statvfs`.
pub fn local_used_percent(path: &Path) -> io::Result<f64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `statvfs` only writes into `stat`; the path is NUL-terminated.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let blocks = stat.f_blocks as f64;
    if blocks == 0.0 {
        return Err(io::Error::other("filesystem reports zero blocks"));
    }
    let used = (stat.f_blocks - stat.f_bfree) as f64;
    Ok(used / blocks * 100.0)
}

/// Parse `df -h / | grep dev` output: the fifth column, `%` stripped.
pub fn parse_df_usage(text: &str) -> Option<f64> {
    let field = text.split_whitespace().nth(4)?;
    field.strip_suffix('%').unwrap_or(field).parse().ok()
}
