//! Persistence, raw page archive and HTTP client construction for ClassCatch.

mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use classcatch_core::{Channel, ProxyAddr};
use rand::seq::SliceRandom;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub use store::{
    CourseStore, HistoryEntry, MemoryStore, PgStore, ProxyStore, StoreError,
};

pub const CRATE_NAME: &str = "classcatch-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of fetched timetable pages.
///
/// Keeps the exact markup each successful run parsed so a structural change
/// on the source site can be diagnosed after the fact.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        term: &str,
        channel: Channel,
        content_hash: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        PathBuf::from(term)
            .join(day)
            .join(channel.as_str())
            .join(format!("{content_hash}.html"))
    }

    /// Writes through a temp file and a rename so readers never see a partial page.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        term: &str,
        channel: Channel,
        markup: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let bytes = markup.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, term, channel, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let archived = |deduplicated| ArchivedPage {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp page {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp page {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp page {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                if fs::try_exists(&absolute_path).await.unwrap_or(false) {
                    return Ok(archived(true));
                }
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Desktop browser strings rotated across requests.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:131.0) Gecko/20100101 Firefox/131.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.6; rv:130.0) Gecko/20100101 Firefox/130.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36 Edg/129.0.0.0",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Connect,
    Status,
    Body,
    Other,
}

pub fn classify_status(status: StatusCode) -> Option<FailureKind> {
    if status == StatusCode::OK {
        None
    } else {
        Some(FailureKind::Status)
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_connect() {
        FailureKind::Connect
    } else if err.is_body() || err.is_decode() {
        FailureKind::Body
    } else {
        FailureKind::Other
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub proxy: Option<ProxyAddr>,
    pub user_agent: Option<String>,
    /// Free proxies routinely re-sign TLS; certificate checks would reject nearly all of them.
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            proxy: None,
            user_agent: None,
            accept_invalid_certs: true,
        }
    }
}

impl HttpClientConfig {
    pub fn through(proxy: Option<ProxyAddr>, timeout: Duration) -> Self {
        Self {
            timeout,
            proxy,
            ..Default::default()
        }
    }
}

/// Builds a client bound to at most one outbound proxy.
pub fn build_client(config: &HttpClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
        .danger_accept_invalid_certs(config.accept_invalid_certs);

    builder = match config.proxy {
        Some(addr) => builder.proxy(reqwest::Proxy::all(addr.proxy_url())?),
        None => builder.no_proxy(),
    };

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build()
}
