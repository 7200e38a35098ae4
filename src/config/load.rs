//! Loading the effective configuration

use super::cli::{apply_dotted_override, apply_overrides, Cli};
use super::schema::TrainSpec;
use super::validate::validate_config;
use crate::error::{Error, Result};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn read_yaml(path: &Path) -> Result<Value> {
    let yaml_content = fs::read_to_string(path).map_err(|e| {
        Error::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_yaml::from_str(&yaml_content)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {}", e)))?;
    Ok(if value.is_null() {
        Value::Mapping(Mapping::new())
    } else {
        value
    })
}

fn from_tree(tree: Value) -> Result<TrainSpec> {
    serde_yaml::from_value(tree)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {}", e)))
}

/// Effective configuration: YAML file, then `--opts`, then named flags, then validation
pub fn load_spec(cli: &Cli, known_archs: &[String]) -> Result<TrainSpec> {
    let mut tree = match &cli.cfg {
        Some(path) => read_yaml(path)?,
        None => Value::Mapping(Mapping::new()),
    };
    for assignment in &cli.opts {
        apply_dotted_override(&mut tree, assignment)?;
    }
    let mut spec = from_tree(tree)?;
    apply_overrides(&mut spec, cli);
    validate_config(&spec, known_archs)
        .map_err(|e| Error::ConfigError(format!("Invalid config: {}", e)))?;
    Ok(spec)
}

/// Load and validate a training spec from a YAML file
pub fn load_config<P: AsRef<Path>>(config_path: P, known_archs: &[String]) -> Result<TrainSpec> {
    let spec = from_tree(read_yaml(config_path.as_ref())?)?;
    validate_config(&spec, known_archs)
        .map_err(|e| Error::ConfigError(format!("Invalid config: {}", e)))?;
    Ok(spec)
}

fn flatten(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten(&key, v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// `key: value` lines sorted by dotted key
pub fn config_lines(spec: &TrainSpec) -> Result<Vec<String>> {
    let mut flat = BTreeMap::new();
    flatten("", &serde_json::to_value(spec)?, &mut flat);
    Ok(flat.into_iter().map(|(k, v)| format!("{k}: {v}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn known() -> Vec<String> {
        vec!["vit_small".to_string(), "vit_tiny".to_string()]
    }

    fn write(yaml: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();
        temp_file
    }

    #[test]
    fn test_load_partial_config_fills_defaults() {
        let file = write(
            r#"
model:
  arch: vit_tiny
masking:
  ratio: 0.75
training:
  epochs: 20
"#,
        );
        let spec = load_config(file.path(), &known()).unwrap();
        assert_eq!(spec.model.arch, "vit_tiny");
        assert_eq!(spec.masking.ratio, 0.75);
        assert_eq!(spec.masking.threshold, 0.6);
        assert_eq!(spec.optimizer.name, "adamw");
    }

    #[test]
    fn test_empty_file_is_default() {
        let file = write("");
        assert_eq!(load_config(file.path(), &known()).unwrap(), TrainSpec::default());
    }

    #[test]
    fn test_precedence_file_opts_flags() {
        let file = write("optimizer:\n  lr: 0.1\n  min_lr: 0.01\n");
        let cli = Cli {
            cfg: Some(file.path().to_path_buf()),
            opts: vec!["optimizer.lr=0.2".to_string(), "optimizer.min_lr=0.02".to_string()],
            lr: Some(0.3),
            ..Cli::default()
        };
        let spec = load_spec(&cli, &known()).unwrap();
        assert_eq!(spec.optimizer.lr, 0.3);
        assert_eq!(spec.optimizer.min_lr, 0.02);
    }

    #[test]
    fn test_invalid_value_rejected_at_load() {
        let file = write("masking:\n  ratio: 1.5\n");
        let err = load_config(file.path(), &known()).unwrap_err();
        assert!(err.to_string().contains("masking ratio"));
    }

    #[test]
    fn test_malformed_yaml() {
        let file = write("this is not valid yaml: [}");
        assert!(load_config(file.path(), &known()).is_err());
    }

    #[test]
    fn test_config_lines_sorted() {
        let lines = config_lines(&TrainSpec::default()).unwrap();
        let mut sorted = lines.clone();
        sorted.sort();
        assert_eq!(lines, sorted);
        assert!(lines.iter().any(|l| l == "masking.ratio: 0.9"));
    }
}
