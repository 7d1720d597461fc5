use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum EnvFileError {
    #[error("cannot read env file {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("malformed line in env file {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

/// Parse a project-scoped env file into a map without touching the current
/// process environment. A missing file is an empty map.
pub fn load_project_env(path: &Path) -> Result<HashMap<String, String>, EnvFileError> {
    if !path.is_file() {
        return Ok(HashMap::new());
    }

    let iter = dotenv::from_path_iter(path).map_err(|e| EnvFileError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut vars = HashMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| EnvFileError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        vars.insert(key, value);
    }
    tracing::debug!(path = %path.display(), count = vars.len(), "loaded project env");
    Ok(vars)
}
