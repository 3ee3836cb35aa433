//! `restfuzz.toml` config loading.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Base directory for per-API workspaces (corpus, crashers, yaml files).
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Feed improving plans back into the corpus.
    #[serde(default = "default_guided")]
    pub guided: bool,

    /// Dependency-aware mode: flow ordering, dependency substitution, token refresh, tier 7.
    #[serde(default)]
    pub strict: bool,

    /// Minimum covered/goal ratio for request parameters.
    #[serde(default = "default_threshold")]
    pub parameter_threshold: f64,

    /// Minimum covered/goal ratio for response properties.
    #[serde(default = "default_threshold")]
    pub property_threshold: f64,

    /// Distinct leaves selected for mutation per call node.
    #[serde(default = "default_mutation_picks")]
    pub mutation_picks: usize,

    /// Upper bound on a byte-mutated leaf.
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Overrides the server picked from the API description.
    #[serde(default)]
    pub server: Option<String>,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".restfuzz")
}

fn default_guided() -> bool {
    true
}

fn default_threshold() -> f64 {
    0.5
}

fn default_mutation_picks() -> usize {
    2
}

fn default_max_value_bytes() -> usize {
    4096
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            guided: default_guided(),
            strict: false,
            parameter_threshold: default_threshold(),
            property_threshold: default_threshold(),
            mutation_picks: default_mutation_picks(),
            max_value_bytes: default_max_value_bytes(),
            request_timeout_ms: default_request_timeout_ms(),
            server: None,
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// Workspace directory for one API description, keyed by its title.
    pub fn workspace_dir(&self, title: &str) -> PathBuf {
        self.base_dir.join(sanitize_title(title))
    }
}

fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str("strict = true\nmutation_picks = 3\n").expect("parse");
        assert!(cfg.strict);
        assert!(cfg.guided);
        assert_eq!(cfg.mutation_picks, 3);
        assert_eq!(cfg.parameter_threshold, 0.5);
        assert_eq!(cfg.base_dir, PathBuf::from(".restfuzz"));
    }

    #[test]
    fn missing_config_is_default() {
        let cfg = Config::load_optional(Path::new("/definitely/not/here/restfuzz.toml"));
        assert_eq!(cfg.max_value_bytes, 4096);
    }

    #[test]
    fn workspace_dir_sanitizes_title() {
        let cfg = Config::default();
        assert_eq!(cfg.workspace_dir("Pet Store/v2"), PathBuf::from(".restfuzz/Pet_Store_v2"));
        assert_eq!(cfg.workspace_dir(".."), PathBuf::from(".restfuzz/untitled"));
    }
}
