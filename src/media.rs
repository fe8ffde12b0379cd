use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use sha1::{Digest, Sha1};

use crate::config::PlayerConfig;
use crate::storage::{self, MediaEntry};

const FILE_PLACEHOLDER: &str = "%FILE%";

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: Option<PathBuf>,
    pub max_size_bytes: i64,
    pub default_ttl: Duration,
    pub workers: usize,
    pub http_client: Option<Client>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_size_bytes: 500 * 1024 * 1024,
            default_ttl: Duration::from_secs(6 * 60 * 60),
            workers: 2,
            http_client: None,
        }
    }
}

/// A request to materialize one media URL in the disk cache.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub url: String,
    pub media_type: Option<String>,
    pub ttl: Option<Duration>,
    pub force: bool,
}

#[derive(Debug)]
pub struct ResultEntry {
    pub entry: Option<MediaEntry>,
    pub error: Option<anyhow::Error>,
}

struct Job {
    request: Request,
    tx: Sender<ResultEntry>,
}

struct Inner {
    store: Arc<storage::Store>,
    cfg: Config,
    client: Client,
    stop: Sender<()>,
    pruning: Mutex<()>,
}

pub struct Manager {
    inner: Arc<Inner>,
    jobs: Sender<Job>,
    handles: Vec<thread::JoinHandle<()>>,
}

/// Cheap clonable front for enqueueing downloads from UI threads.
#[derive(Clone)]
pub struct Handle {
    jobs: Sender<Job>,
}

impl Handle {
    pub fn fetch(&self, request: Request) -> Receiver<ResultEntry> {
        let (tx, rx) = unbounded();
        let _ = self.jobs.send(Job { request, tx });
        rx
    }
}

impl Manager {
    pub fn new(store: Arc<storage::Store>, cfg: Config) -> Result<Self> {
        let mut cfg = cfg;
        if cfg.workers == 0 {
            cfg.workers = 2;
        }
        let cache_dir = cfg
            .cache_dir
            .clone()
            .or_else(default_cache_dir)
            .context("media: cache dir not configured")?;
        fs::create_dir_all(&cache_dir)?;
        cfg.cache_dir = Some(cache_dir);

        let client = if let Some(client) = cfg.http_client.clone() {
            client
        } else {
            Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .context("media: build http client")?
        };

        let (job_tx, job_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();

        let inner = Arc::new(Inner {
            store,
            cfg,
            client,
            stop: stop_tx,
            pruning: Mutex::new(()),
        });

        let mut handles = Vec::new();
        for _ in 0..inner.cfg.workers {
            let rx_jobs: Receiver<Job> = job_rx.clone();
            let rx_stop: Receiver<()> = stop_rx.clone();
            let worker_inner = inner.clone();
            handles.push(thread::spawn(move || worker_inner.worker(rx_jobs, rx_stop)));
        }

        Ok(Self {
            inner,
            jobs: job_tx,
            handles,
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            jobs: self.jobs.clone(),
        }
    }

    /// Evict expired entries, then the oldest downloads until the cache
    /// fits the size budget.
    pub fn prune(&self) -> Result<()> {
        self.inner.prune()
    }

    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.inner.stop.send(());
        }
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn worker(&self, jobs: Receiver<Job>, stop: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => return,
                recv(jobs) -> job => {
                    let Ok(job) = job else { return };
                    let result = self.process(&job.request);
                    let entry = match result {
                        Ok(entry) => ResultEntry {
                            entry: Some(entry),
                            error: None,
                        },
                        Err(err) => ResultEntry {
                            entry: None,
                            error: Some(err),
                        },
                    };
                    let _ = job.tx.send(entry);
                }
            }
        }
    }

    fn process(&self, request: &Request) -> Result<MediaEntry> {
        if request.url.trim().is_empty() {
            return Err(anyhow!("media: request url required"));
        }

        if !request.force {
            if let Some(entry) = self.store.get_media_by_url(&request.url)? {
                let fresh = entry
                    .expires_at
                    .map(|expiry| expiry > Utc::now())
                    .unwrap_or(true);
                if fresh && Path::new(&entry.file_path).exists() {
                    return Ok(entry);
                }
            }
        }

        let resp = self
            .client
            .get(&request.url)
            .send()
            .with_context(|| format!("media: fetch {}", request.url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("media: fetch {} returned {}", request.url, status));
        }
        let header_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().context("media: read response body")?;

        let media_type = request
            .media_type
            .clone()
            .or(header_type)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let cache_dir = self
            .cfg
            .cache_dir
            .as_ref()
            .context("media: cache dir not configured")?;
        let file_name = cache_file_name(&request.url, &media_type);
        let file_path = cache_dir.join(file_name);
        fs::write(&file_path, &bytes)
            .with_context(|| format!("media: write {}", file_path.display()))?;

        let ttl = request.ttl.unwrap_or(self.cfg.default_ttl);
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl));

        let mut entry = MediaEntry {
            id: 0,
            url: request.url.clone(),
            media_type,
            file_path: file_path.display().to_string(),
            size_bytes: bytes.len() as i64,
            fetched_at: now,
            expires_at,
            checksum: hex::encode(Sha1::digest(&bytes)),
        };
        entry.id = self.store.upsert_media(entry.clone())?;

        if let Err(err) = self.prune() {
            // Pruning is best-effort; the fetched entry is already usable.
            let _ = err;
        }

        Ok(entry)
    }

    fn prune(&self) -> Result<()> {
        let _guard = self.pruning.lock();

        for entry in self.store.list_expired_media(Utc::now())? {
            let _ = fs::remove_file(&entry.file_path);
            self.store.delete_media(entry.id)?;
        }

        if self.cfg.max_size_bytes <= 0 {
            return Ok(());
        }
        let mut total = self.store.total_media_size()?;
        if total <= self.cfg.max_size_bytes {
            return Ok(());
        }
        for entry in self.store.list_media_by_fetched()? {
            if total <= self.cfg.max_size_bytes {
                break;
            }
            let _ = fs::remove_file(&entry.file_path);
            self.store.delete_media(entry.id)?;
            total -= entry.size_bytes;
        }
        Ok(())
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("msgvault"))
}

/// Deterministic cache file name: SHA-1 of the URL plus an extension
/// derived from the media type.
fn cache_file_name(url: &str, media_type: &str) -> String {
    let digest = hex::encode(Sha1::digest(url.as_bytes()));
    format!("{}.{}", digest, extension_for(media_type))
}

fn extension_for(media_type: &str) -> String {
    let subtype = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .split('/')
        .nth(1)
        .unwrap_or_default()
        .trim();
    if subtype.is_empty() {
        return "bin".to_string();
    }
    let cleaned: String = subtype
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if cleaned.is_empty() {
        "bin".to_string()
    } else {
        cleaned.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

/// Substring match on the content type, the way the archive front ends
/// classify media.
pub fn media_kind(content_type: &str) -> MediaKind {
    let lowered = content_type.to_ascii_lowercase();
    if lowered.contains("image") {
        MediaKind::Image
    } else if lowered.contains("video") {
        MediaKind::Video
    } else {
        MediaKind::Other
    }
}

/// Open a cached media file with the viewer configured for its kind.
/// Returns false when no viewer command is configured for the kind; the
/// caller falls back to the browser.
pub fn open_with_player(player: &PlayerConfig, kind: MediaKind, file: &Path) -> Result<bool> {
    let template = match kind {
        MediaKind::Image => &player.image_command,
        MediaKind::Video => &player.video_command,
        MediaKind::Other => return Ok(false),
    };
    let Some((program, args)) = build_command(template, &file.display().to_string()) else {
        return Ok(false);
    };

    let mut command = Command::new(&program);
    command.args(&args);
    if player.detach {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
            .spawn()
            .with_context(|| format!("media: launch {}", program))?;
    } else {
        command
            .status()
            .with_context(|| format!("media: run {}", program))?;
    }
    Ok(true)
}

/// Open the remote media URL in the default browser.
pub fn open_in_browser(url: &str) -> Result<()> {
    webbrowser::open(url).with_context(|| format!("media: open {} in browser", url))
}

/// Substitute the `%FILE%` placeholder into a viewer argv template.
fn build_command(template: &[String], file: &str) -> Option<(String, Vec<String>)> {
    let mut parts = template.iter();
    let program = parts.next()?.clone();
    if program.trim().is_empty() {
        return None;
    }
    let mut args: Vec<String> = parts.map(|arg| arg.replace(FILE_PLACEHOLDER, file)).collect();
    if !template.iter().any(|arg| arg.contains(FILE_PLACEHOLDER)) {
        args.push(file.to_string());
    }
    Some((program, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn media_kind_uses_substring_match() {
        assert_eq!(media_kind("image/jpeg"), MediaKind::Image);
        assert_eq!(media_kind("video/mp4"), MediaKind::Video);
        assert_eq!(media_kind("application/pdf"), MediaKind::Other);
        assert_eq!(media_kind("IMAGE/PNG"), MediaKind::Image);
    }

    #[test]
    fn cache_file_names_are_stable_and_typed() {
        let first = cache_file_name("http://a.test/api/media/1/cache", "image/jpeg");
        let second = cache_file_name("http://a.test/api/media/1/cache", "image/jpeg");
        assert_eq!(first, second);
        assert!(first.ends_with(".jpeg"));

        let other = cache_file_name("http://a.test/api/media/2/cache", "image/jpeg");
        assert_ne!(first, other);

        assert!(cache_file_name("http://a.test/x", "video/mp4; codecs=avc1").ends_with(".mp4"));
        assert!(cache_file_name("http://a.test/y", "weird").ends_with(".bin"));
    }

    #[test]
    fn build_command_substitutes_placeholder() {
        let template = vec!["mpv".to_string(), "--fs".to_string(), "%FILE%".to_string()];
        let (program, args) = build_command(&template, "/tmp/clip.mp4").unwrap();
        assert_eq!(program, "mpv");
        assert_eq!(args, vec!["--fs".to_string(), "/tmp/clip.mp4".to_string()]);
    }

    #[test]
    fn build_command_appends_file_without_placeholder() {
        let template = vec!["xdg-open".to_string()];
        let (program, args) = build_command(&template, "/tmp/cat.jpg").unwrap();
        assert_eq!(program, "xdg-open");
        assert_eq!(args, vec!["/tmp/cat.jpg".to_string()]);
    }

    #[test]
    fn build_command_rejects_empty_template() {
        assert!(build_command(&[], "/tmp/x").is_none());
        assert!(build_command(&[String::new()], "/tmp/x").is_none());
    }

    #[test]
    fn prune_evicts_expired_and_oversized_entries() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            storage::Store::open(storage::Options {
                path: Some(dir.path().join("state.db")),
            })
            .unwrap(),
        );
        let manager = Manager::new(
            store.clone(),
            Config {
                cache_dir: Some(dir.path().join("cache")),
                max_size_bytes: 25,
                ..Config::default()
            },
        )
        .unwrap();

        let old = Utc::now() - chrono::Duration::hours(2);
        for (n, expires) in [(1, Some(old)), (2, None), (3, None)] {
            let file = dir.path().join(format!("cache-{n}"));
            fs::write(&file, vec![0u8; 20]).unwrap();
            store
                .upsert_media(MediaEntry {
                    id: 0,
                    url: format!("http://a.test/{n}"),
                    media_type: "image/jpeg".into(),
                    file_path: file.display().to_string(),
                    size_bytes: 20,
                    fetched_at: Utc::now() + chrono::Duration::seconds(n),
                    expires_at: expires,
                    checksum: String::new(),
                })
                .unwrap();
        }

        manager.prune().unwrap();

        // The expired entry is gone; of the two live 20-byte entries the
        // older one was evicted to meet the 25-byte budget.
        assert!(store.get_media_by_url("http://a.test/1").unwrap().is_none());
        assert!(store.get_media_by_url("http://a.test/2").unwrap().is_none());
        assert!(store.get_media_by_url("http://a.test/3").unwrap().is_some());
        assert!(store.total_media_size().unwrap() <= 25);
    }
}
