use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use notify_subscriber::{
    ConnectConfig, ConnectionHandle, CredentialProvider, Event, HttpTransport, Lifecycle,
    NotificationApi, NotificationSession, RestNotificationApi, Scope, Subscribers, Transport,
    Visibility, connect,
};
use tracing::{info, warn};

use crate::config::{self, FileConfig, Settings};
use crate::credentials::{FileCredentials, TOKEN_REFRESH_INTERVAL};
use crate::error::WatchResult;

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Stream URL before query augmentation
    #[arg(long, env = "NOTIFY_STREAM_URL")]
    pub url: Option<String>,

    /// Bearer token passed as the `token` query parameter
    #[arg(long, env = "NOTIFY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File holding the bearer token, reloaded in the background
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// Routing scope: user or admin
    #[arg(long, value_parser = parse_scope)]
    pub scope: Option<Scope>,

    /// Send cookies (ambient authentication)
    #[arg(long)]
    pub with_credentials: bool,

    /// Close the stream on SIGUSR1 and reopen it on SIGUSR2
    #[arg(long)]
    pub pause_when_hidden: bool,

    /// Stay closed after a failure instead of reconnecting
    #[arg(long)]
    pub no_backoff: bool,

    #[arg(long)]
    pub min_delay_ms: Option<u64>,

    #[arg(long)]
    pub max_delay_ms: Option<u64>,

    #[arg(long)]
    pub jitter_ratio: Option<f64>,

    /// Reconnect after this much silence (0 disables the watchdog)
    #[arg(long)]
    pub heartbeat_timeout_ms: Option<u64>,

    /// REST API root; enables session mode with list refresh
    #[arg(long, env = "NOTIFY_API_URL")]
    pub api_url: Option<String>,

    /// Debounce window for list refreshes in session mode
    #[arg(long)]
    pub debounce_ms: Option<u64>,

    /// Print one JSON object per event
    #[arg(long)]
    pub json: bool,

    /// YAML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn parse_scope(s: &str) -> Result<Scope, String> {
    match s.to_ascii_lowercase().as_str() {
        "user" => Ok(Scope::User),
        "admin" => Ok(Scope::Admin),
        other => Err(format!("unknown scope {other:?} (expected user or admin)")),
    }
}

/// Render one event as a line of output.
pub(crate) fn format_event(event: &Event, json: bool) -> String {
    if json {
        return serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
    }
    let payload = match &event.payload {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let time = event.received_at.format("%H:%M:%S%.3f");
    match &event.meta.last_event_id {
        Some(id) => format!("{time} {} #{id} {payload}", event.event_type),
        None => format!("{time} {} {payload}", event.event_type),
    }
}

fn subscribers(json: bool) -> Subscribers {
    Subscribers::new()
        .on_message(move |event| println!("{}", format_event(event, json)))
        .on_open(|| info!("Stream open"))
        .on_error(|err, attempt| warn!(attempt, error = %err, "Stream error"))
        .on_state(|snapshot| {
            info!(
                state = %snapshot.state,
                attempt = snapshot.attempt,
                retry_ms = snapshot.retry_in.map(|d| d.as_millis() as u64),
                "State changed"
            );
        })
}

enum Running {
    Stream(ConnectionHandle),
    Session(NotificationSession),
}

impl Running {
    fn cancel(&self) {
        match self {
            Running::Stream(handle) => handle.cancel(),
            Running::Session(session) => session.cancel(),
        }
    }
}

/// Tail the stream until interrupted.
pub async fn run_watch(args: WatchArgs) -> WatchResult<()> {
    let file = match &args.config {
        Some(path) => config::load(path).await?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(&args, file)?;

    let credentials: Option<Arc<dyn CredentialProvider>> = match settings.token_file.clone() {
        Some(path) => Some(Arc::new(
            FileCredentials::watch(path, TOKEN_REFRESH_INTERVAL).await,
        )),
        None => None,
    };
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    let lifecycle = Arc::new(Lifecycle::default());

    let mut connect_config = ConnectConfig::new(settings.options.clone(), transport)
        .lifecycle(lifecycle.clone())
        .subscribers(subscribers(settings.json));
    if let Some(provider) = credentials.clone() {
        connect_config = connect_config.credentials(provider);
    }

    let running = match &settings.api_url {
        Some(api_url) => {
            let api: Arc<dyn NotificationApi> =
                Arc::new(RestNotificationApi::new(api_url.clone(), credentials)?);
            let session = NotificationSession::start(connect_config, api, settings.debounce)?;
            let mut items = session.subscribe_items();
            tokio::spawn(async move {
                while items.changed().await.is_ok() {
                    let (total, unread) = {
                        let list = items.borrow_and_update();
                        (list.len(), list.iter().filter(|n| !n.read).count())
                    };
                    info!(total, unread, "Notification list refreshed");
                }
            });
            Running::Session(session)
        }
        None => Running::Stream(connect(connect_config)?),
    };

    info!(
        url = %settings.options.url_base,
        scope = %settings.options.scope,
        session = settings.api_url.is_some(),
        "Watching"
    );
    wait_for_shutdown(&lifecycle, settings.options.pause_when_hidden).await?;
    running.cancel();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(lifecycle: &Lifecycle, visibility_signals: bool) -> WatchResult<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hide = signal(SignalKind::user_defined1())?;
    let mut show = signal(SignalKind::user_defined2())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Interrupted, shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Terminated, shutting down");
                return Ok(());
            }
            Some(()) = hide.recv(), if visibility_signals => {
                info!("SIGUSR1: backgrounding");
                lifecycle.set_visibility(Visibility::Hidden);
            }
            Some(()) = show.recv(), if visibility_signals => {
                info!("SIGUSR2: foregrounding");
                lifecycle.set_visibility(Visibility::Visible);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_lifecycle: &Lifecycle, _visibility_signals: bool) -> WatchResult<()> {
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_subscriber::{RawEvent, normalize};

    fn event(name: Option<&str>, data: &str, id: Option<&str>) -> Event {
        normalize(&RawEvent {
            event: name.map(String::from),
            data: data.to_string(),
            id: id.map(String::from),
            retry: None,
        })
        .unwrap()
    }

    #[test]
    fn text_output_shows_type_and_payload() {
        let line = format_event(&event(Some("notification"), r#"{"id":1}"#, None), false);
        assert!(line.ends_with(r#" notification {"id":1}"#), "{line}");

        let line = format_event(&event(None, "seats released", Some("42")), false);
        assert!(line.ends_with(" message #42 seats released"), "{line}");
    }

    #[test]
    fn json_output_is_one_object() {
        let line = format_event(&event(Some("info"), r#"{"msg":"hi"}"#, None), true);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "info");
        assert_eq!(value["payload"]["msg"], "hi");
        assert_eq!(value["meta"]["source_event_name"], "info");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(parse_scope("admin"), Ok(Scope::Admin));
        assert_eq!(parse_scope("USER"), Ok(Scope::User));
        assert!(parse_scope("root").is_err());
    }
}
