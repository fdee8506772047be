//! # Config Loader
//!
//! Loads the controller configuration file.
//!
//! Responsibilities:
//! - Parse TOML/JSON configuration files
//! - Validate ranges and cross-references
//! - Produce a `ControllerBlueprint`
//!
//! # Example
//!
//! ```no_run
//! use config_loader::ConfigLoader;
//! use std::path::Path;
//!
//! let blueprint = ConfigLoader::load_from_path(Path::new("syncline.toml")).unwrap();
//! println!("devices: {}", blueprint.devices.len());
//! ```

mod parser;
mod validator;

pub use contracts::ControllerBlueprint;
pub use parser::ConfigFormat;

use contracts::SyncError;
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file path
    ///
    /// Format is taken from the file extension (.toml / .json).
    ///
    /// # Errors
    /// - File read failure
    /// - Unsupported format
    /// - Parse failure
    /// - Validation failure
    pub fn load_from_path(path: &Path) -> Result<ControllerBlueprint, SyncError> {
        let format = Self::detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content, format)
    }

    /// Load configuration from string
    pub fn load_from_str(
        content: &str,
        format: ConfigFormat,
    ) -> Result<ControllerBlueprint, SyncError> {
        let blueprint = parser::parse(content, format)?;
        validator::validate(&blueprint)?;
        Ok(blueprint)
    }

    /// Serialize to TOML string
    pub fn to_toml(blueprint: &ControllerBlueprint) -> Result<String, SyncError> {
        toml::to_string_pretty(blueprint)
            .map_err(|e| SyncError::config_parse(format!("TOML serialize error: {e}")))
    }

    /// Serialize to JSON string
    pub fn to_json(blueprint: &ControllerBlueprint) -> Result<String, SyncError> {
        serde_json::to_string_pretty(blueprint)
            .map_err(|e| SyncError::config_parse(format!("JSON serialize error: {e}")))
    }

    fn detect_format(path: &Path) -> Result<ConfigFormat, SyncError> {
        let ext = path.extension().and_then(|e| e.to_str()).ok_or_else(|| {
            SyncError::config_parse("cannot determine file format from extension")
        })?;

        ConfigFormat::from_extension(ext)
            .ok_or_else(|| SyncError::config_parse(format!("unsupported config format: .{ext}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLEET_TOML: &str = r#"
[engine]
sync_interval_seconds = 15.0
probes_per_sync = 7

[[devices]]
id = "phone-a"
[devices.simulation]
clock_offset_ms = 120.0

[[devices]]
id = "phone-b"

[[groups]]
name = "stage"
devices = ["phone-a", "phone-b"]
"#;

    #[test]
    fn test_load_from_str_toml() {
        let bp = ConfigLoader::load_from_str(FLEET_TOML, ConfigFormat::Toml).unwrap();
        assert_eq!(bp.devices.len(), 2);
        assert_eq!(bp.engine.probes_per_sync, 7);
        // Unlisted fields keep their defaults
        assert_eq!(bp.engine.min_measurements, 3);
        assert!((bp.devices[0].simulation.clock_offset_ms - 120.0).abs() < f64::EPSILON);
        assert!((bp.devices[1].simulation.latency_ms - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_round_trip_toml() {
        let bp = ConfigLoader::load_from_str(FLEET_TOML, ConfigFormat::Toml).unwrap();
        let serialized = ConfigLoader::to_toml(&bp).unwrap();
        let bp2 = ConfigLoader::load_from_str(&serialized, ConfigFormat::Toml).unwrap();
        assert_eq!(bp.engine, bp2.engine);
        assert_eq!(bp2.groups[0].devices, vec!["phone-a", "phone-b"]);
    }

    #[test]
    fn test_round_trip_json() {
        let bp = ConfigLoader::load_from_str(FLEET_TOML, ConfigFormat::Toml).unwrap();
        let json = ConfigLoader::to_json(&bp).unwrap();
        let bp2 = ConfigLoader::load_from_str(&json, ConfigFormat::Json).unwrap();
        assert_eq!(bp.devices[0].id, bp2.devices[0].id);
    }

    #[test]
    fn test_load_from_path_detects_format() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(FLEET_TOML.as_bytes()).unwrap();

        let bp = ConfigLoader::load_from_path(file.path()).unwrap();
        assert_eq!(bp.groups.len(), 1);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let err = ConfigLoader::load_from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn test_engine_only_file_loads_without_devices() {
        let content = "[engine]\nprobes_per_sync = 4\n";
        let bp = ConfigLoader::load_from_str(content, ConfigFormat::Toml).unwrap();
        assert!(bp.devices.is_empty());
        assert!(bp.groups.is_empty());
        assert_eq!(bp.engine.probes_per_sync, 4);
    }

    #[test]
    fn test_validation_runs_after_parse() {
        let content = r#"
[[devices]]
id = "cam"

[[devices]]
id = "cam"
"#;
        let err = ConfigLoader::load_from_str(content, ConfigFormat::Toml).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
