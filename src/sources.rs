//! File inputs: the URL list and the POST body.

use std::path::Path;

use bytes::Bytes;
use tracing::debug;

use crate::config::ConfigError;

/// Read a line-separated URL list. Surrounding whitespace is trimmed and
/// blank lines are skipped.
pub fn read_url_list(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let urls: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    debug!(path = %path.display(), count = urls.len(), "read URL list");
    Ok(urls)
}

/// Read the request body verbatim.
pub fn read_body(path: &Path) -> Result<Bytes, ConfigError> {
    let data = std::fs::read(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), bytes = data.len(), "read request body");
    Ok(Bytes::from(data))
}
