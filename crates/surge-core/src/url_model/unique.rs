//! Collision-free destination naming.
//!
//! When `<dest>` or `<dest>.surge` already exists (on disk or claimed by an
//! in-flight download), a counter is woven into the name: `file(1).txt`,
//! `file(2).txt`, ... Hidden names are treated as all-extension, so
//! `.gitignore` becomes `(1).gitignore`.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::storage::WORKING_SUFFIX;

/// Upper bound on rename attempts before giving up.
pub const MAX_NAME_ATTEMPTS: u32 = 100;

/// `name` with counter `n` inserted before the extension.
///
/// `file.tar.gz` → `file.tar(1).gz` style insertion before the *last* dot;
/// extensionless names get the counter appended; a leading-dot name takes
/// the counter in front.
pub fn numbered_name(name: &str, n: u32) -> String {
    if name.starts_with('.') {
        return format!("({}){}", n, name);
    }
    match name.rfind('.') {
        Some(pos) => format!("{}({}){}", &name[..pos], n, &name[pos..]),
        None => format!("{}({})", name, n),
    }
}

fn occupied(path: &Path, claimed: &HashSet<PathBuf>) -> bool {
    if claimed.contains(path) {
        return true;
    }
    if path.exists() {
        return true;
    }
    let mut working = path.as_os_str().to_owned();
    working.push(WORKING_SUFFIX);
    PathBuf::from(working).exists()
}

/// Picks the first free destination for `filename` under `dir`, checking the
/// final name, its working file, and the caller's claim set. Returns the
/// resolved path and final filename.
pub fn unique_destination(
    dir: &Path,
    filename: &str,
    claimed: &HashSet<PathBuf>,
) -> Result<(PathBuf, String)> {
    let first = dir.join(filename);
    if !occupied(&first, claimed) {
        return Ok((first, filename.to_string()));
    }
    for n in 1..=MAX_NAME_ATTEMPTS {
        let name = numbered_name(filename, n);
        let candidate = dir.join(&name);
        if !occupied(&candidate, claimed) {
            return Ok((candidate, name));
        }
    }
    bail!(
        "no free filename for {} after {} attempts",
        filename,
        MAX_NAME_ATTEMPTS
    );
}
