use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "MSGVAULT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub ui: UIConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub player: PlayerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_user_agent() -> String {
    format!("msgvault-tui/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_gallery_page_size")]
    pub gallery_page_size: u32,
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: usize,
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
    #[serde(default = "default_scroll_settle", with = "humantime_serde")]
    pub scroll_settle: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            gallery_page_size: default_gallery_page_size(),
            edge_threshold: default_edge_threshold(),
            debounce: default_debounce(),
            scroll_settle: default_scroll_settle(),
        }
    }
}

fn default_page_size() -> u32 {
    50
}

fn default_gallery_page_size() -> u32 {
    30
}

fn default_edge_threshold() -> usize {
    3
}

fn default_debounce() -> Duration {
    Duration::from_millis(500)
}

fn default_scroll_settle() -> Duration {
    Duration::from_millis(500)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UIConfig {
    #[serde(default = "default_theme")]
    pub theme: String,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            theme: default_theme(),
        }
    }
}

fn default_theme() -> String {
    "default".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: i64,
    #[serde(default = "default_media_ttl_duration", with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_size_bytes: default_max_size_bytes(),
            default_ttl: default_media_ttl_duration(),
            workers: default_workers(),
        }
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("msgvault"))
}

fn default_max_size_bytes() -> i64 {
    500 * 1024 * 1024
}

fn default_media_ttl_duration() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_workers() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default = "default_image_command")]
    pub image_command: Vec<String>,
    #[serde(default = "default_video_command")]
    pub video_command: Vec<String>,
    #[serde(default = "default_detach")]
    pub detach: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            image_command: default_image_command(),
            video_command: default_video_command(),
            detach: default_detach(),
        }
    }
}

fn default_image_command() -> Vec<String> {
    vec!["xdg-open".into(), "%FILE%".into()]
}

fn default_video_command() -> Vec<String> {
    vec!["mpv".into(), "%FILE%".into()]
}

fn default_detach() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = load_env(cfg, prefix)?;

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.server.base_url.is_empty() {
        base.server.base_url = other.server.base_url;
    }
    if !other.server.user_agent.is_empty() {
        base.server.user_agent = other.server.user_agent;
    }

    if other.feed.page_size != 0 {
        base.feed.page_size = other.feed.page_size;
    }
    if other.feed.gallery_page_size != 0 {
        base.feed.gallery_page_size = other.feed.gallery_page_size;
    }
    if other.feed.edge_threshold != 0 {
        base.feed.edge_threshold = other.feed.edge_threshold;
    }
    base.feed.debounce = other.feed.debounce;
    base.feed.scroll_settle = other.feed.scroll_settle;

    if !other.ui.theme.is_empty() {
        base.ui.theme = other.ui.theme;
    }

    if other.media.cache_dir.is_some() {
        base.media.cache_dir = other.media.cache_dir;
    }
    if other.media.max_size_bytes != 0 {
        base.media.max_size_bytes = other.media.max_size_bytes;
    }
    base.media.default_ttl = other.media.default_ttl;
    if other.media.workers != 0 {
        base.media.workers = other.media.workers;
    }

    if !other.player.image_command.is_empty() {
        base.player.image_command = other.player.image_command;
    }
    if !other.player.video_command.is_empty() {
        base.player.video_command = other.player.video_command;
    }
    base.player.detach = other.player.detach;

    base
}

fn load_env(mut cfg: Config, prefix: &str) -> Result<Config> {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }

    Ok(cfg)
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "server.base_url" => cfg.server.base_url = value,
        "server.user_agent" => cfg.server.user_agent = value,
        "feed.page_size" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.feed.page_size = parsed;
            }
        }
        "feed.gallery_page_size" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.feed.gallery_page_size = parsed;
            }
        }
        "feed.edge_threshold" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.edge_threshold = parsed;
            }
        }
        "feed.debounce" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.feed.debounce = duration;
            }
        }
        "feed.scroll_settle" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.feed.scroll_settle = duration;
            }
        }
        "ui.theme" => cfg.ui.theme = value,
        "media.cache_dir" => cfg.media.cache_dir = Some(PathBuf::from(value)),
        "media.max_size_bytes" => {
            if let Ok(parsed) = value.parse::<i64>() {
                cfg.media.max_size_bytes = parsed;
            }
        }
        "media.default_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.media.default_ttl = duration;
            }
        }
        "media.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.media.workers = parsed;
            }
        }
        "player.image_command" => {
            cfg.player.image_command = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "player.video_command" => {
            cfg.player.video_command = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "player.detach" => {
            cfg.player.detach = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("msgvault").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_without_files() {
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/msgvault.yaml")),
            env_prefix: Some("MSGVAULT_TEST_NONE".into()),
        })
        .unwrap();
        assert_eq!(cfg.server.base_url, default_base_url());
        assert_eq!(cfg.feed.page_size, 50);
        assert_eq!(cfg.feed.gallery_page_size, 30);
        assert_eq!(cfg.feed.debounce, Duration::from_millis(500));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "server:\n  base_url: http://archive.local:9000\nfeed:\n  page_size: 25\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("MSGVAULT_TEST_NONE".into()),
        })
        .unwrap();
        assert_eq!(cfg.server.base_url, "http://archive.local:9000");
        assert_eq!(cfg.feed.page_size, 25);
        assert_eq!(cfg.feed.gallery_page_size, 30);
    }

    #[test]
    fn env_overrides() {
        env::set_var("MSGVAULT_UI__THEME", "mocha");
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/msgvault.yaml")),
            env_prefix: None,
        })
        .unwrap();
        assert_eq!(cfg.ui.theme, "mocha");
        env::remove_var("MSGVAULT_UI__THEME");
    }

    #[test]
    fn env_parses_durations() {
        env::set_var("MSGVAULT_FEED__DEBOUNCE", "250ms");
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/msgvault.yaml")),
            env_prefix: None,
        })
        .unwrap();
        assert_eq!(cfg.feed.debounce, Duration::from_millis(250));
        env::remove_var("MSGVAULT_FEED__DEBOUNCE");
    }
}
