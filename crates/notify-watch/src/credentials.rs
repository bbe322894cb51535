use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use notify_subscriber::CredentialProvider;

/// How often the token file is re-read.
pub const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Bearer credential kept in memory and reloaded from a file in the
/// background, so a token rewritten by another process is picked up on a
/// later reconnect without blocking the connection task.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    token: RwLock<Option<String>>,
}

impl Inner {
    async fn reload(&self) {
        let token = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let token = content.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Cannot read token file");
                None
            }
        };
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }
}

impl FileCredentials {
    /// Read the file now, then every `interval` until the last clone is
    /// dropped.
    pub async fn watch(path: PathBuf, interval: Duration) -> Self {
        let credentials = Self {
            inner: Arc::new(Inner {
                path,
                token: RwLock::new(None),
            }),
        };
        credentials.reload().await;

        let weak = Arc::downgrade(&credentials.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.reload().await;
            }
        });
        credentials
    }

    pub async fn reload(&self) {
        self.inner.reload().await;
    }
}

impl CredentialProvider for FileCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.inner
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
