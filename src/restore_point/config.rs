use crate::restore_point::archive::source_tree::{CustomDeserializedGlob, ExcludeSet};
use crate::restore_point::compress::CompressorConfig;
use crate::restore_point::result_error::error::Error;
use crate::restore_point::result_error::result::Result;
use crate::restore_point::result_error::WithMsg;
use crate::restore_point::validate::validate_absolute_path;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use validator::Validate;

pub static DEFAULT_CONFIG_PATH: &str = "/etc/linux-restore-point/config.yml";
static DEFAULT_BACKUP_ROOT: &str = "/var/backups/linux_restore_points";
static DEFAULT_EXCLUDES: [&str; 6] = [
    "/dev/**",
    "/proc/**",
    "/sys/**",
    "/tmp/**",
    "/run/**",
    "**/lost+found",
];

/// Where restore points live, what goes into them and how they are compressed.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct RestorePointConfig {
    #[serde(default = "default_backup_root")]
    #[builder(default = default_backup_root())]
    #[validate(custom(function = validate_absolute_path))]
    backup_root: PathBuf,
    /// Defaults to `<backup_root>/logs`
    #[validate(custom(function = validate_absolute_path))]
    log_dir: Option<PathBuf>,
    #[serde(default = "default_system_path")]
    #[builder(default = default_system_path())]
    #[validate(custom(function = validate_absolute_path))]
    system_path: PathBuf,
    #[serde(default = "default_user_data_path")]
    #[builder(default = default_user_data_path())]
    #[validate(custom(function = validate_absolute_path))]
    user_data_path: PathBuf,
    /// Root that archived paths are restored below
    #[serde(default = "default_restore_root")]
    #[builder(default = default_restore_root())]
    #[validate(custom(function = validate_absolute_path))]
    restore_root: PathBuf,
    #[serde(default = "default_exclude")]
    #[builder(default = default_exclude())]
    exclude: Vec<CustomDeserializedGlob>,
    #[serde(default)]
    #[builder(default)]
    compressor: CompressorConfig,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    preserve_ownership: bool,
}

fn default_backup_root() -> PathBuf {
    DEFAULT_BACKUP_ROOT.into()
}

fn default_system_path() -> PathBuf {
    "/etc".into()
}

fn default_user_data_path() -> PathBuf {
    "/home".into()
}

fn default_restore_root() -> PathBuf {
    "/".into()
}

fn default_exclude() -> Vec<CustomDeserializedGlob> {
    DEFAULT_EXCLUDES
        .iter()
        .filter_map(|pattern| CustomDeserializedGlob::new(pattern).ok())
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for RestorePointConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RestorePointConfig {
    /// Reads `path`, or the system-wide config file when there is one, or falls back
    /// to the defaults. The result is validated either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path),
            None => Some(Path::new(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
        };

        let config = match path {
            Some(path) => {
                let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
                serde_yml::from_reader::<_, Self>(file)
                    .map_err(Error::from)
                    .with_msg(format!("Parse YAML config failed: {:?}", path))?
            }
            None => {
                tracing::debug!("No config file, using defaults");
                Self::default()
            }
        };

        config
            .validate_all()
            .with_msg(format!("Config validation failed: {:?}", path.unwrap_or(Path::new("<defaults>"))))?;
        Ok(config)
    }

    pub fn validate_all(&self) -> Result<()> {
        self.validate()?;
        self.compressor.validate()?;
        Ok(())
    }

    pub fn log_dir_or_default(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.backup_root.join("logs"))
    }

    /// Configured globs plus the backup root, which is never archived.
    pub fn exclude_set(&self) -> Result<ExcludeSet> {
        ExcludeSet::new(
            &self.exclude,
            vec![self.backup_root.clone(), self.log_dir_or_default()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore_point::result_error::error::ErrorCategory;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RestorePointConfig::default();
        assert_eq!(config.backup_root(), Path::new("/var/backups/linux_restore_points"));
        assert_eq!(config.log_dir_or_default(), Path::new("/var/backups/linux_restore_points/logs"));
        assert_eq!(config.system_path(), Path::new("/etc"));
        assert_eq!(config.user_data_path(), Path::new("/home"));
        assert_eq!(config.restore_root(), Path::new("/"));
        assert_eq!(config.exclude().len(), 6);
        assert!(matches!(config.compressor(), CompressorConfig::Xz(_)));
        assert!(*config.preserve_ownership());
        assert!(config.validate_all().is_ok());

        let excludes = config.exclude_set().unwrap();
        assert!(excludes.is_excluded("/proc/1/status"));
        assert!(excludes.is_excluded("/home/alice/lost+found"));
        assert!(excludes.is_excluded("/var/backups/linux_restore_points/x.tar.xz"));
        assert!(!excludes.is_excluded("/etc/fstab"));
    }

    #[test]
    fn test_load_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yml");
        std::fs::write(
            &path,
            r#"
backup_root: /srv/restore_points
system_path: /etc
exclude:
  - "**/*.swp"
compressor:
  compressor_type: none
preserve_ownership: false
"#,
        )
        .unwrap();

        let config = RestorePointConfig::load(Some(&path)).unwrap();
        assert_eq!(config.backup_root(), Path::new("/srv/restore_points"));
        assert_eq!(config.log_dir_or_default(), Path::new("/srv/restore_points/logs"));
        assert_eq!(config.user_data_path(), Path::new("/home"));
        assert_eq!(config.exclude().len(), 1);
        assert_eq!(config.compressor(), &CompressorConfig::None);
        assert!(!*config.preserve_ownership());
    }

    #[test]
    fn test_load_rejects_bad_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yml");

        std::fs::write(&path, "backup_root: relative/dir\n").unwrap();
        let err = RestorePointConfig::load(Some(&path)).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);

        std::fs::write(&path, "compressor:\n  compressor_type: xz\n  level: 42\n").unwrap();
        assert!(RestorePointConfig::load(Some(&path)).is_err());

        std::fs::write(&path, "unknown_key: 1\n").unwrap();
        assert!(RestorePointConfig::load(Some(&path)).is_err());

        assert!(RestorePointConfig::load(Some(&temp_dir.path().join("missing.yml"))).is_err());
    }

    #[test]
    fn test_builder() {
        let config = RestorePointConfig::builder()
            .backup_root("/data/rp".into())
            .log_dir("/var/log/rp".into())
            .exclude(vec![])
            .build();
        assert_eq!(config.log_dir_or_default(), Path::new("/var/log/rp"));
        assert!(config.exclude_set().unwrap().is_excluded("/var/log/rp/a.log"));
        assert!(!config.exclude_set().unwrap().is_excluded("/tmp/x"));
    }
}
