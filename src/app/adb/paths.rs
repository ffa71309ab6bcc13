use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub fn validate_device_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("device_path is required".to_string());
    }
    if !trimmed.starts_with('/') {
        return Err("device_path must be an absolute device path starting with '/'".to_string());
    }
    if trimmed.contains('\0') {
        return Err("device_path contains invalid characters".to_string());
    }
    if trimmed == "/" {
        return Err("device_path must not be root".to_string());
    }
    for segment in trimmed.split('/') {
        if segment == ".." {
            return Err("device_path must not contain '..' segments".to_string());
        }
    }
    Ok(())
}

pub fn device_parent_dir(device_path: &str) -> String {
    let trimmed = device_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return "/".to_string();
    }
    let mut path = trimmed.trim_end_matches('/').to_string();
    if path == "/" {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => {
            path.truncate(index);
            if path.is_empty() {
                "/".to_string()
            } else {
                path
            }
        }
    }
}

/// Reduces `value` to characters safe in a file name on every host and on the device shell.
pub fn sanitize_filename_component(value: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9 ._-]").expect("valid regex"));
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").expect("valid regex"));

    let stripped = unsafe_chars.replace_all(value.trim(), "");
    let joined = spaces.replace_all(stripped.trim(), "_");
    let cleaned = joined.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "script".to_string()
    } else {
        cleaned
    }
}

/// Deterministic remote location for a local script body inside `remote_dir`.
pub fn remote_script_path(remote_dir: &str, local_path: &Path) -> String {
    let file_name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let dir = remote_dir.trim().trim_end_matches('/');
    format!("{}/{}", dir, sanitize_filename_component(&file_name))
}
