pub mod apply_patch;
pub mod exec_command;
pub mod grep_files;
pub mod list_dir;
pub mod read_file;
pub mod shell;
pub mod write_file;

use std::path::Path;
use std::path::PathBuf;

use crate::tools::context::ToolInvocation;

/// Resolve the effective working directory: an explicit `workdir`
/// argument wins, relative paths are joined onto the invocation cwd.
pub(crate) fn resolve_workdir(inv: &ToolInvocation) -> PathBuf {
    match inv
        .arguments
        .get("workdir")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
    {
        Some(dir) => {
            let path = PathBuf::from(dir);
            if path.is_absolute() {
                path
            } else {
                inv.cwd.join(path)
            }
        }
        None => inv.cwd.clone(),
    }
}

/// Resolve a path argument against the invocation cwd.
pub(crate) fn resolve_path(cwd: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        cwd.join(p)
    }
}
