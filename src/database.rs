//! Tenant database connections
//!
//! A small checkout pool per tenant. Connections are opened lazily up to the
//! pool size; checkout is bounded by a timeout so a saturated pool surfaces
//! as an error instead of a hung session. TLS is selected per tenant: an
//! `ssl_enforced` extension always connects with TLS, everything else goes
//! plain.

use std::sync::Mutex;
use std::time::Duration;

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::tenant::DbExtension;

/// Shared handle to a tenant pool
pub type PoolHandle = std::sync::Arc<TenantPool>;

/// Connect a standalone client (used by the replication ingester, which must
/// not compete with sessions for pool slots).
pub async fn connect_client(settings: &DbExtension) -> Result<Client, PoolError> {
    let config = pg_config(settings);

    if settings.ssl_enforced {
        let connector = TlsConnector::builder().build()?;
        let tls = MakeTlsConnector::new(connector);
        let (client, connection) = config.connect(tls).await.map_err(classify_connect_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "tenant db connection error");
            }
        });
        Ok(client)
    } else {
        let (client, connection) = config.connect(NoTls).await.map_err(classify_connect_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "tenant db connection error");
            }
        });
        Ok(client)
    }
}

fn pg_config(settings: &DbExtension) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&settings.host)
        .port(settings.port)
        .user(&settings.user)
        .password(&settings.password)
        .dbname(&settings.db_name)
        .application_name("tenantcast")
        .connect_timeout(Duration::from_secs(5));
    config
}

fn classify_connect_error(e: tokio_postgres::Error) -> PoolError {
    if let Some(db) = e.as_db_error() {
        if db.code() == &tokio_postgres::error::SqlState::TOO_MANY_CONNECTIONS {
            return PoolError::TooManyConnections;
        }
    }
    PoolError::Unavailable(e)
}

/// Bounded checkout pool against one tenant database.
pub struct TenantPool {
    settings: DbExtension,
    idle: Mutex<Vec<Client>>,
    permits: std::sync::Arc<Semaphore>,
    checkout_timeout: Duration,
    down_tx: watch::Sender<bool>,
    down_rx: watch::Receiver<bool>,
}

impl TenantPool {
    /// Open a pool and validate connectivity with a single `SELECT 1`.
    pub async fn connect(
        settings: DbExtension,
        size: usize,
        checkout_timeout: Duration,
    ) -> Result<PoolHandle, PoolError> {
        let (down_tx, down_rx) = watch::channel(false);
        let pool = std::sync::Arc::new(Self {
            settings,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: std::sync::Arc::new(Semaphore::new(size)),
            checkout_timeout,
            down_tx,
            down_rx,
        });

        // Connectivity test; the client goes straight back to the idle set
        let guard = pool.checkout().await?;
        guard.simple_query("SELECT 1").await.map_err(PoolError::Unavailable)?;
        drop(guard);

        Ok(pool)
    }

    /// Check a connection out. Waits up to the checkout timeout for a free
    /// slot; callers translate the timeout into their own saturation error.
    pub async fn checkout(self: &std::sync::Arc<Self>) -> Result<PoolGuard, PoolError> {
        let permit = match timeout(self.checkout_timeout, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            // Acquisition fails only while the pool is being torn down
            Ok(Err(_)) | Err(_) => return Err(PoolError::CheckoutTimeout),
        };

        // Reuse an idle connection that is still alive
        loop {
            let candidate = self.idle.lock().unwrap().pop();
            match candidate {
                Some(client) if !client.is_closed() => {
                    return Ok(PoolGuard {
                        client: Some(client),
                        pool: self.clone(),
                        _permit: permit,
                    });
                }
                Some(_) => {
                    debug!("discarding closed tenant db connection");
                    continue;
                }
                None => break,
            }
        }

        match connect_client(&self.settings).await {
            Ok(client) => Ok(PoolGuard {
                client: Some(client),
                pool: self.clone(),
                _permit: permit,
            }),
            Err(e) => {
                if matches!(e, PoolError::Unavailable(_)) {
                    // The database itself is unreachable, not merely busy
                    let _ = self.down_tx.send(true);
                }
                Err(e)
            }
        }
    }

    /// Resolves when the pool has observed the database as unreachable.
    pub async fn closed(&self) {
        let mut rx = self.down_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// True once the pool has observed the database as unreachable.
    pub fn is_down(&self) -> bool {
        *self.down_rx.borrow()
    }

    /// Drop all idle connections and mark the pool down.
    pub fn shutdown(&self) {
        self.idle.lock().unwrap().clear();
        let _ = self.down_tx.send(true);
    }

    pub fn settings(&self) -> &DbExtension {
        &self.settings
    }

    /// Pool that never connected, for exercising registry and supervisor
    /// plumbing without a database.
    #[cfg(test)]
    pub(crate) fn stub(settings: DbExtension) -> PoolHandle {
        let (down_tx, down_rx) = watch::channel(false);
        std::sync::Arc::new(Self {
            settings,
            idle: Mutex::new(Vec::new()),
            permits: std::sync::Arc::new(Semaphore::new(1)),
            checkout_timeout: Duration::from_millis(100),
            down_tx,
            down_rx,
        })
    }
}

impl std::fmt::Debug for TenantPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPool")
            .field("host", &self.settings.host)
            .field("db_name", &self.settings.db_name)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

/// A checked-out connection. Returns to the pool on drop.
pub struct PoolGuard {
    client: Option<Client>,
    pool: PoolHandle,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl std::ops::Deref for PoolGuard {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("client taken")
    }
}

impl std::ops::DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("client taken")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !client.is_closed() {
                self.pool.idle.lock().unwrap().push(client);
            }
        }
    }
}

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("tenant database has too many connections")]
    TooManyConnections,
    #[error("timed out waiting for a pool connection")]
    CheckoutTimeout,
    #[error("tenant database unavailable: {0}")]
    Unavailable(tokio_postgres::Error),
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),
}
