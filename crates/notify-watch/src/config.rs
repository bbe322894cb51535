use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_subscriber::{ConnectOptions, Scope};
use serde::Deserialize;

use crate::cmd::WatchArgs;
use crate::error::{WatchError, WatchResult};

pub(crate) const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Optional YAML config. Every key may be overridden by a flag.
#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub stream_url: Option<String>,
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub scope: Option<Scope>,
    pub with_credentials: Option<bool>,
    pub pause_when_hidden: Option<bool>,
    pub backoff: Option<bool>,
    pub min_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub jitter_ratio: Option<f64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub history_capacity: Option<usize>,
    pub debounce_ms: Option<u64>,
}

/// Load a config file. A relative `token_file` is resolved against the
/// config file's directory.
pub async fn load(path: &Path) -> WatchResult<FileConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| WatchError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: FileConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| WatchError::Config(format!("parse {}: {e}", path.display())))?;
    if let (Some(dir), Some(token_file)) = (path.parent(), config.token_file.as_mut())
        && token_file.is_relative()
    {
        *token_file = dir.join(&*token_file);
    }
    Ok(config)
}

/// Flags and file merged into what the watcher runs with.
#[derive(Debug)]
pub struct Settings {
    pub options: ConnectOptions,
    pub api_url: Option<String>,
    pub token_file: Option<PathBuf>,
    pub debounce: Duration,
    pub json: bool,
}

impl Settings {
    pub fn resolve(args: &WatchArgs, file: FileConfig) -> WatchResult<Self> {
        let url = args.url.clone().or(file.stream_url).ok_or_else(|| {
            WatchError::Config("stream URL required (--url or NOTIFY_STREAM_URL)".into())
        })?;

        let mut options = ConnectOptions::new(url);
        options.token = args.token.clone().or(file.token);
        options.scope = args.scope.or(file.scope).unwrap_or_default();
        options.with_credentials = args.with_credentials || file.with_credentials.unwrap_or(false);
        options.pause_when_hidden =
            args.pause_when_hidden || file.pause_when_hidden.unwrap_or(false);
        options.backoff = !args.no_backoff && file.backoff.unwrap_or(true);
        if let Some(ms) = args.min_delay_ms.or(file.min_delay_ms) {
            options.min_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = args.max_delay_ms.or(file.max_delay_ms) {
            options.max_delay = Duration::from_millis(ms);
        }
        if let Some(ratio) = args.jitter_ratio.or(file.jitter_ratio) {
            options.jitter_ratio = ratio;
        }
        if let Some(ms) = args.heartbeat_timeout_ms.or(file.heartbeat_timeout_ms) {
            options.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = file.history_capacity {
            options.history_capacity = capacity;
        }

        if options.min_delay > options.max_delay {
            return Err(WatchError::Config(format!(
                "min delay {}ms exceeds max delay {}ms",
                options.min_delay.as_millis(),
                options.max_delay.as_millis()
            )));
        }
        if !(0.0..=1.0).contains(&options.jitter_ratio) {
            return Err(WatchError::Config(format!(
                "jitter ratio {} outside 0.0..=1.0",
                options.jitter_ratio
            )));
        }

        let debounce_ms = args
            .debounce_ms
            .or(file.debounce_ms)
            .unwrap_or(DEFAULT_DEBOUNCE_MS);

        Ok(Self {
            options,
            api_url: args.api_url.clone().or(file.api_url),
            token_file: args.token_file.clone().or(file.token_file),
            debounce: Duration::from_millis(debounce_ms),
            json: args.json,
        })
    }
}
