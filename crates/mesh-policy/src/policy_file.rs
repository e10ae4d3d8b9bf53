//! Reading and writing `.policy` files.
//!
//! One pretty-printed JSON policy document per file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::error::PolicyError;
use crate::policy::Policy;

/// Suffix of policy files; other files are ignored
pub const POLICY_FILE_SUFFIX: &str = ".policy";

/// Errors for policy file operations
#[derive(Error, Debug)]
pub enum PolicyFileError {
    #[error("I/O error on {}: {1}", .0.display())]
    Io(PathBuf, #[source] io::Error),

    #[error("Unable to demarshal policy file {}: {1}", .0.display())]
    Parse(PathBuf, #[source] serde_json::Error),

    #[error("Unable to marshal policy {0}: {1}")]
    Serialize(String, #[source] serde_json::Error),

    #[error("Policy file {} is not valid: {1}", .0.display())]
    Invalid(PathBuf, #[source] PolicyError),

    #[error("Policy file {} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Policy has no name")]
    MissingName,

    #[error("Policy {name} in {} is already defined in {}", file.display(), existing.display())]
    DuplicateName {
        name: String,
        file: PathBuf,
        existing: PathBuf,
    },
}

/// Whether `path` names a policy file, judging by its suffix only
pub fn is_policy_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.len() > POLICY_FILE_SUFFIX.len() && name.ends_with(POLICY_FILE_SUFFIX))
}

/// File name used for a policy with the given name
pub fn policy_file_name(policy_name: &str) -> String {
    let stem: String = policy_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    format!("{}{}", stem, POLICY_FILE_SUFFIX)
}

pub fn read_policy_file(path: &Path) -> Result<Policy, PolicyFileError> {
    let content = fs::read(path).map_err(|e| PolicyFileError::Io(path.to_path_buf(), e))?;
    serde_json::from_slice(&content).map_err(|e| PolicyFileError::Parse(path.to_path_buf(), e))
}

/// Write `policy` to `path`, replacing any existing file atomically
pub fn write_policy_file(path: &Path, policy: &Policy) -> Result<(), PolicyFileError> {
    let content =
        serde_json::to_string_pretty(policy).map_err(|e| PolicyFileError::Serialize(policy.header.name.clone(), e))?;

    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let io_err = |e| PolicyFileError::Io(path.to_path_buf(), e);

    let mut temp_file = NamedTempFile::new_in(parent).map_err(io_err)?;
    temp_file.write_all(content.as_bytes()).map_err(io_err)?;
    temp_file.persist(path).map_err(|e| io_err(e.error))?;

    debug!("Wrote policy {} to {}", policy.header.name, path.display());
    Ok(())
}

/// Write a new policy file into `dir`, named after the policy
pub fn create_policy_file(dir: &Path, policy: &Policy) -> Result<PathBuf, PolicyFileError> {
    if policy.header.name.is_empty() {
        return Err(PolicyFileError::MissingName);
    }
    let path = dir.join(policy_file_name(&policy.header.name));
    if path.exists() {
        return Err(PolicyFileError::AlreadyExists(path));
    }

    fs::create_dir_all(dir).map_err(|e| PolicyFileError::Io(dir.to_path_buf(), e))?;
    write_policy_file(&path, policy)?;
    info!("Created policy file {}", path.display());
    Ok(path)
}

pub fn delete_policy_file(path: &Path) -> Result<(), PolicyFileError> {
    fs::remove_file(path).map_err(|e| PolicyFileError::Io(path.to_path_buf(), e))?;
    info!("Deleted policy file {}", path.display());
    Ok(())
}

/// Policy files directly inside `dir`, sorted by path
pub fn list_policy_files(dir: &Path) -> Result<Vec<PathBuf>, PolicyFileError> {
    let entries = fs::read_dir(dir).map_err(|e| PolicyFileError::Io(dir.to_path_buf(), e))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_policy_file(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Delete every policy file in `dir`, returning how many were removed
pub fn delete_all_policy_files(dir: &Path) -> Result<usize, PolicyFileError> {
    let files = list_policy_files(dir)?;
    for file in &files {
        delete_policy_file(file)?;
    }
    Ok(files.len())
}

/// Read every policy file in `dir`
pub fn read_policy_directory(dir: &Path) -> Result<Vec<(PathBuf, Policy)>, PolicyFileError> {
    list_policy_files(dir)?
        .into_iter()
        .map(|path| read_policy_file(&path).map(|policy| (path, policy)))
        .collect()
}
