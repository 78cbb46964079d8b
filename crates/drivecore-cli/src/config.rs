//! Operator configuration – reads/writes `~/.drivecore/config.toml`.

use drivecore_types::{PipelineConfig, VehicleId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted operator configuration stored in `~/.drivecore/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Vehicle id used when a scenario does not name one.
    #[serde(default = "default_vehicle_id")]
    pub vehicle_id: VehicleId,

    /// Pipeline tuning; every field falls back to its default.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_vehicle_id() -> VehicleId {
    VehicleId::new("av-1")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vehicle_id: default_vehicle_id(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Return the path to `~/.drivecore/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".drivecore").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let Some(mut cfg) = load_from(&config_path())? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    cfg.pipeline.validate().map_err(|e| e.to_string())?;
    Ok(Some(cfg))
}

/// The stored config, or the defaults when none exists; env overrides apply
/// either way.
pub fn load_or_default() -> Result<Config, String> {
    match load()? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    cfg.pipeline.validate().map_err(|e| e.to_string())?;
    Ok(Some(cfg))
}

/// Apply `DRIVECORE_*` environment variable overrides to `cfg`.
///
/// Values that do not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `DRIVECORE_STALENESS_BOUND_MS` | `pipeline.staleness_bound_ms` |
/// | `DRIVECORE_MIN_MODALITIES` | `pipeline.min_modalities_for_confidence` |
/// | `DRIVECORE_RECOVERY_WINDOW_MS` | `pipeline.recovery_window_ms` |
/// | `DRIVECORE_MAX_RECALCULATIONS_PER_MINUTE` | `pipeline.max_recalculations_per_minute` |
/// | `DRIVECORE_LATERAL_CLEARANCE_MIN_M` | `pipeline.lateral_clearance_min_m` |
pub fn apply_env_overrides(cfg: &mut Config) {
    let p = &mut cfg.pipeline;
    if let Some(v) = env_parse("DRIVECORE_STALENESS_BOUND_MS") {
        p.staleness_bound_ms = v;
    }
    if let Some(v) = env_parse("DRIVECORE_MIN_MODALITIES") {
        p.min_modalities_for_confidence = v;
    }
    if let Some(v) = env_parse("DRIVECORE_RECOVERY_WINDOW_MS") {
        p.recovery_window_ms = v;
    }
    if let Some(v) = env_parse("DRIVECORE_MAX_RECALCULATIONS_PER_MINUTE") {
        p.max_recalculations_per_minute = v;
    }
    if let Some(v) = env_parse::<f64>("DRIVECORE_LATERAL_CLEARANCE_MIN_M")
        && v.is_finite()
    {
        p.lateral_clearance_min_m = v;
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok()?.trim().parse().ok()
}

/// Save the config to disk, creating `~/.drivecore/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner-only directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.vehicle_id, VehicleId::new("av-1"));
        assert_eq!(loaded.pipeline.recovery_window_ms, 1_500);
        assert_eq!(loaded.pipeline.modality_weights, PipelineConfig::default().modality_weights);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "vehicle_id = \"av-7\"\n[pipeline]\ncycle_budget_ms = 80\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.vehicle_id, VehicleId::new("av-7"));
        assert_eq!(loaded.pipeline.cycle_budget_ms, 80);
        assert_eq!(loaded.pipeline.staleness_bound_ms, 200);
    }

    #[test]
    fn invalid_pipeline_config_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pipeline]\nstaleness_bound_ms = 0\n").unwrap();

        let err = load_from(&path).unwrap_err();
        assert!(err.contains("staleness_bound_ms"));
    }

    #[test]
    fn config_path_points_to_drivecore_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".drivecore"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_staleness_bound() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("DRIVECORE_STALENESS_BOUND_MS", "150") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pipeline.staleness_bound_ms, 150);
        unsafe { std::env::remove_var("DRIVECORE_STALENESS_BOUND_MS") };
    }

    #[test]
    fn apply_env_overrides_changes_min_modalities() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("DRIVECORE_MIN_MODALITIES", "3") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pipeline.min_modalities_for_confidence, 3);
        unsafe { std::env::remove_var("DRIVECORE_MIN_MODALITIES") };
    }

    #[test]
    fn apply_env_overrides_changes_recovery_window() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("DRIVECORE_RECOVERY_WINDOW_MS", " 2000 ") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pipeline.recovery_window_ms, 2_000);
        unsafe { std::env::remove_var("DRIVECORE_RECOVERY_WINDOW_MS") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_recalculation_limit() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("DRIVECORE_MAX_RECALCULATIONS_PER_MINUTE", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pipeline.max_recalculations_per_minute, 6);
        unsafe { std::env::remove_var("DRIVECORE_MAX_RECALCULATIONS_PER_MINUTE") };
    }

    #[test]
    fn apply_env_overrides_changes_lateral_clearance() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("DRIVECORE_LATERAL_CLEARANCE_MIN_M", "1.25") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pipeline.lateral_clearance_min_m, 1.25);
        unsafe { std::env::remove_var("DRIVECORE_LATERAL_CLEARANCE_MIN_M") };
    }
}
