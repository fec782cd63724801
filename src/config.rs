use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub ai: AiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Watched inbox directory.
    pub inbox: PathBuf,
    /// Root of the processed-output tree.
    pub output: PathBuf,
    #[serde(default = "default_quarantine_dir")]
    pub quarantine_dir_name: String,
    #[serde(default = "default_duplicate_dir")]
    pub duplicate_dir_name: String,
    /// Forensic JSONL file; one record per terminal outcome.
    pub forensic_log: PathBuf,
}

fn default_quarantine_dir() -> String {
    "quarantine".to_string()
}
fn default_duplicate_dir() -> String {
    "duplicates".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_include_globs() -> Vec<String> {
    vec![
        "*.pdf".to_string(),
        "*.png".to_string(),
        "*.jpg".to_string(),
        "*.jpeg".to_string(),
        "*.tif".to_string(),
        "*.tiff".to_string(),
        "*.bmp".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Pages whose embedded-text quality falls below this score are OCRed.
    #[serde(default = "default_quality_threshold")]
    pub page_quality_threshold: f64,
    /// Minimum extraction confidence before a document needs review.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Absolute tolerance when reconciling item sums against the header total.
    #[serde(default = "default_tolerance_abs")]
    pub sum_tolerance_abs: f64,
    /// Relative tolerance for the same reconciliation.
    #[serde(default = "default_tolerance_rel")]
    pub sum_tolerance_rel: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            page_quality_threshold: default_quality_threshold(),
            min_confidence: default_min_confidence(),
            sum_tolerance_abs: default_tolerance_abs(),
            sum_tolerance_rel: default_tolerance_rel(),
        }
    }
}

fn default_quality_threshold() -> f64 {
    0.35
}
fn default_min_confidence() -> f64 {
    0.65
}
fn default_tolerance_abs() -> f64 {
    2.0
}
fn default_tolerance_rel() -> f64 {
    0.03
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
    /// Entries older than this are re-fetched. Zero disables caching.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_max")]
    pub cache_max_entries: usize,
}

fn default_registry_timeout() -> u64 {
    15
}
fn default_cache_ttl() -> u64 {
    86_400
}
fn default_cache_max() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_ai_retries")]
    pub max_retries: u32,
    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            model: None,
            max_retries: default_ai_retries(),
            timeout_secs: default_ai_timeout(),
        }
    }
}

fn default_ai_retries() -> u32 {
    4
}
fn default_ai_timeout() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate registry: invalid values must fail here, never surface
    // as a confusing transport error mid-pipeline.
    if config.registry.timeout_secs == 0 {
        anyhow::bail!("registry.timeout_secs must be > 0");
    }
    if config.registry.cache_max_entries == 0 {
        anyhow::bail!("registry.cache_max_entries must be > 0");
    }
    if config.registry.base_url.trim().is_empty() {
        anyhow::bail!("registry.base_url must not be empty");
    }

    // Validate extraction
    if !(0.0..=1.0).contains(&config.extraction.page_quality_threshold) {
        anyhow::bail!("extraction.page_quality_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.extraction.min_confidence) {
        anyhow::bail!("extraction.min_confidence must be in [0.0, 1.0]");
    }
    if config.extraction.sum_tolerance_abs < 0.0 {
        anyhow::bail!("extraction.sum_tolerance_abs must be >= 0");
    }

    // Validate watcher
    if config.watcher.poll_interval_secs == 0 {
        anyhow::bail!("watcher.poll_interval_secs must be > 0");
    }

    // Validate AI fallback
    if config.ai.enabled {
        if config.ai.endpoint.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("ai.endpoint must be set when ai.enabled = true");
        }
        if config.ai.model.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("ai.model must be set when ai.enabled = true");
        }
        if config.ai.timeout_secs == 0 {
            anyhow::bail!("ai.timeout_secs must be > 0");
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const BASE: &str = r#"
[db]
path = "/tmp/docpipe.sqlite"

[paths]
inbox = "/tmp/inbox"
output = "/tmp/out"
forensic_log = "/tmp/forensic.jsonl"

[registry]
base_url = "https://registry.example/subjects"
"#;

    #[test]
    fn loads_with_defaults() {
        let f = write_config(BASE);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.registry.timeout_secs, 15);
        assert_eq!(cfg.registry.cache_max_entries, 1024);
        assert_eq!(cfg.paths.quarantine_dir_name, "quarantine");
        assert!(!cfg.ai.enabled);
    }

    #[test]
    fn rejects_zero_registry_timeout() {
        let body = format!("{}\ntimeout_secs = 0\n", BASE);
        let f = write_config(&body);
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn rejects_enabled_ai_without_endpoint() {
        let body = format!("{}\n[ai]\nenabled = true\nmodel = \"ledger-1\"\n", BASE);
        let f = write_config(&body);
        assert!(load_config(f.path()).is_err());
    }
}
