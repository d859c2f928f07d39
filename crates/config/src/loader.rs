use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::BusConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchyard.toml",
    "switchyard.yaml",
    "switchyard.yml",
    "switchyard.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<BusConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./switchyard.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/switchyard/switchyard.{toml,yaml,yml,json}` (user-global)
///
/// Returns `BusConfig::default()` if no config file is found or it fails to
/// load.
pub fn discover_and_load() -> BusConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    BusConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    find_in(Path::new(".")).or_else(|| config_dir().and_then(|dir| find_in(&dir)))
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Returns the user-global config directory (`~/.config/switchyard/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "switchyard").map(|d| d.config_dir().to_path_buf())
}

/// Parse `raw` in the format implied by `path`'s extension.
pub fn parse_config(raw: &str, path: &Path) -> anyhow::Result<BusConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::schema::AdapterDirection};

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();
        let files = [
            ("switchyard.toml", "channels = [\"a\"]\n"),
            ("switchyard.yaml", "channels: [a]\n"),
            ("switchyard.json", r#"{"channels": ["a"]}"#),
        ];
        for (name, body) in files {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            assert_eq!(load_config(&path).unwrap().channels, vec!["a".to_string()], "{name}");
        }
    }

    #[test]
    fn substitutes_env_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        // PATH is set in any test environment
        std::fs::write(
            &path,
            "[[adapters]]\nname = \"${PATH}\"\nuri = \"memory://q\"\ndirection = \"out\"\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.adapters[0].name, std::env::var("PATH").unwrap());
        assert_eq!(config.adapters[0].direction, AdapterDirection::Out);
    }

    #[test]
    fn finds_first_name_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("switchyard.json"), "{}").unwrap();
        std::fs::write(dir.path().join("switchyard.yaml"), "").unwrap();
        assert_eq!(find_in(dir.path()).unwrap(), dir.path().join("switchyard.yaml"));
        assert!(find_in(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn rejects_unknown_extension_and_bad_syntax() {
        assert!(parse_config("", Path::new("switchyard.ini")).is_err());
        assert!(parse_config("channels = [", Path::new("switchyard.toml")).is_err());
    }
}
