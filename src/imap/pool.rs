//! Bounded per-account IMAP connection pool.
//!
//! Connections are stateful (selected mailbox), so each pooled object
//! remembers what it last SELECTed and re-selects only on change. A
//! connection that hits a transport error is taken out of the pool
//! rather than recycled.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_imap::types::{Capabilities, Mailbox};
use deadpool::managed::{Manager, Metrics, Object, Pool, RecycleError, RecycleResult};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ImapEndpoint;
use crate::errors::{Severity, SyncError, SyncResult};
use crate::imap::{connect, ImapSession};
use crate::sched::AbortFlag;

pub struct ImapConnection {
    pub session: ImapSession,
    capabilities: Capabilities,
    selected: Option<String>,
}

impl ImapConnection {
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.has_str(cap)
    }

    /// SELECT `wire` and remember it as this connection's mailbox.
    /// Callers that only need the right folder selected go through
    /// [`ImapConnection::ensure_selected`] instead.
    pub async fn select(&mut self, wire: &str) -> SyncResult<Mailbox> {
        let mailbox = self
            .session
            .select(wire)
            .await
            .map_err(SyncError::from_imap)?;
        self.selected = Some(wire.to_string());
        Ok(mailbox)
    }

    pub async fn ensure_selected(&mut self, wire: &str) -> SyncResult<()> {
        if self.selected.as_deref() != Some(wire) {
            self.select(wire).await?;
        }
        Ok(())
    }

    /// Any path that may have left the connection in an unknown state
    /// clears the cached selection.
    pub fn forget_selection(&mut self) {
        self.selected = None;
    }
}

pub struct ConnManager {
    endpoint: ImapEndpoint,
}

impl Manager for ConnManager {
    type Type = ImapConnection;
    type Error = SyncError;

    async fn create(&self) -> Result<ImapConnection, SyncError> {
        let credential = self
            .endpoint
            .credential()
            .map_err(|e| SyncError::Repo(format!("{e:#}")))?;
        let mut session = connect(&self.endpoint, &credential).await?;
        let capabilities = session
            .capabilities()
            .await
            .map_err(SyncError::from_imap)?;
        debug!(host = %self.endpoint.host, "new pooled connection");
        Ok(ImapConnection {
            session,
            capabilities,
            selected: None,
        })
    }

    async fn recycle(
        &self,
        conn: &mut ImapConnection,
        _metrics: &Metrics,
    ) -> RecycleResult<SyncError> {
        conn.session
            .noop()
            .await
            .map_err(|e| RecycleError::Backend(SyncError::from_imap(e)))
    }
}

pub type ImapPool = Pool<ConnManager>;
pub type PooledConn = Object<ConnManager>;

pub fn build_pool(endpoint: &ImapEndpoint) -> SyncResult<ImapPool> {
    let max = endpoint.maxconnections.max(1);
    Pool::builder(ConnManager {
        endpoint: endpoint.clone(),
    })
    .max_size(max)
    .build()
    .map_err(|e| SyncError::Repo(format!("building connection pool: {e}")))
}

/// Run `op` on a pooled connection, retrying transport failures on a
/// fresh connection up to `retrycount` times. Non-transport errors are
/// returned as-is; exhausted retries are promoted to Folder severity.
pub async fn with_conn<T, F>(pool: &ImapPool, retrycount: u32, mut op: F) -> SyncResult<T>
where
    F: for<'a> FnMut(
        &'a mut ImapConnection,
    ) -> Pin<Box<dyn Future<Output = SyncResult<T>> + Send + 'a>>,
{
    let mut attempt = 0u32;
    loop {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| SyncError::Repo(format!("acquiring connection: {e}")))?;
        match op(&mut conn).await {
            Ok(value) => return Ok(value),
            Err(e) if e.severity() == Severity::FolderRetry => {
                // The connection is suspect; drop it from the pool.
                let _ = Object::take(conn);
                if attempt >= retrycount {
                    return Err(SyncError::Folder(format!(
                        "giving up after {attempt} retries: {e}"
                    )));
                }
                attempt += 1;
                warn!(error = %e, attempt, "transport error, retrying on a fresh connection");
            }
            Err(e) => return Err(e),
        }
    }
}

/// NOOP an idle pooled connection every `secs` seconds until aborted.
pub fn spawn_keepalive(pool: ImapPool, secs: u64, abort: AbortFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(secs);
        loop {
            tokio::time::sleep(period).await;
            if abort.is_set() {
                break;
            }
            match pool.get().await {
                Ok(mut conn) => {
                    if let Err(e) = conn.session.noop().await {
                        warn!(error = %e, "keepalive NOOP failed");
                        let _ = Object::take(conn);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "keepalive could not acquire a connection");
                }
            }
        }
    })
}
