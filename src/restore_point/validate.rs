//! Validation functions for labels, restore-point names and configured paths.

use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

/// Upper bound for the user supplied part of a restore-point name.
pub static MAX_LABEL_LEN: usize = 100;

pub fn validate_label<S: AsRef<str>>(label: S) -> Result<(), ValidationError> {
    let label = label.as_ref();
    if label.is_empty() {
        return Err(ValidationError::new("InvalidLabel").with_message("label must not be empty".into()));
    }

    if label.chars().any(|c| c == '/' || c == '\\' || c == '\0') {
        return Err(ValidationError::new("InvalidLabel")
            .with_message(format!("label {label:?} must not contain path separators").into()));
    }

    if label.starts_with('.') {
        return Err(ValidationError::new("InvalidLabel")
            .with_message(format!("label {label:?} must not start with '.'").into()));
    }

    if label.len() > MAX_LABEL_LEN {
        return Err(ValidationError::new("InvalidLabel")
            .with_message(format!("label maximum length is {MAX_LABEL_LEN}").into()));
    }

    if !is_sanitized(label) {
        return Err(ValidationError::new("InvalidLabel").with_message(
            format!("Invalid label, try sanitizing like {:?}", sanitize(label)).into(),
        ));
    }

    Ok(())
}

/// Names are copied verbatim from `list` output, so only the shape that could
/// escape the backup root is rejected here.
pub fn validate_restore_point_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() {
        return Err(ValidationError::new("InvalidName").with_message("name must not be empty".into()));
    }

    if name.chars().any(|c| c == '/' || c == '\\' || c == '\0') || name.starts_with('.') {
        return Err(ValidationError::new("InvalidName")
            .with_message(format!("{name:?} is not a restore point name").into()));
    }

    Ok(())
}

pub fn validate_absolute_path<P: AsRef<Path>>(path: P) -> Result<(), ValidationError> {
    let path = path.as_ref();
    if !path.is_absolute() {
        return Err(ValidationError::new("RelativePath")
            .with_message(format!("{:?} must be an absolute path", path).into()));
    }

    Ok(())
}

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

/// Checks by creating an unnamed file, mode bits alone are wrong for root and
/// read-only mounts.
pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist(dir)?;
    tempfile::tempfile_in(dir).map(|_| ()).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}: {}", dir, e).into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_validate_label() {
        assert!(validate_label("pre_update").is_ok());
        assert!(validate_label("before kernel 6.8").is_ok());

        assert!(validate_label("").is_err());
        assert!(validate_label("../etc").is_err());
        assert!(validate_label("a/b").is_err());
        assert!(validate_label("a\\b").is_err());
        assert!(validate_label(".hidden").is_err());
        assert!(validate_label("x".repeat(MAX_LABEL_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_restore_point_name() {
        assert!(validate_restore_point_name("pre_update_20240102_030405").is_ok());
        assert!(validate_restore_point_name("").is_err());
        assert!(validate_restore_point_name("..").is_err());
        assert!(validate_restore_point_name("a/../../b").is_err());
    }

    #[test]
    fn test_validate_absolute_path() {
        assert!(validate_absolute_path("/etc").is_ok());
        assert!(validate_absolute_path("etc").is_err());
    }

    #[test]
    fn test_validate_dirs() {
        let temp_dir = TempDir::new().unwrap();
        assert!(validate_dir_exist(temp_dir.path()).is_ok());
        assert!(validate_writable_dir(temp_dir.path()).is_ok());

        let file = temp_dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(validate_dir_exist(&file).is_err());
        assert!(validate_dir_exist(temp_dir.path().join("missing")).is_err());
        assert!(validate_writable_dir(temp_dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_validate_writable_dir_creates_a_file() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("ro");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o555)).unwrap();

        let writable_anyway = std::fs::File::create(dir.join("x")).is_ok();
        let res = validate_writable_dir(&dir);
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(res.is_ok(), writable_anyway);
        let leftovers = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(leftovers, usize::from(writable_anyway));
    }
}
