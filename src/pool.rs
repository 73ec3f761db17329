//! Bounded pool of hypervisor daemon connections.
//!
//! Repositories borrow a connection for the duration of one operation and
//! hand it back afterwards; nothing holds a connection across calls.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use virt::connect::Connect;

use crate::errors::{ComputeError, Result};

/// Opens, validates and closes connections of one kind.
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> Result<Self::Connection>;

    fn is_healthy(&self, connection: &Self::Connection) -> bool;

    fn close(&self, connection: Self::Connection);
}

/// Connector for a libvirt daemon URI such as `qemu:///system`.
#[derive(Debug, Clone)]
pub struct LibvirtConnector {
    uri: String,
}

impl LibvirtConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Connector for LibvirtConnector {
    type Connection = Connect;

    fn connect(&self) -> Result<Connect> {
        debug!("Opening libvirt connection to {}", self.uri);
        Connect::open(Some(&self.uri)).map_err(|e| {
            ComputeError::Connection(format!("failed to connect to {}: {}", self.uri, e))
        })
    }

    fn is_healthy(&self, connection: &Connect) -> bool {
        connection.is_alive().unwrap_or(false)
    }

    fn close(&self, mut connection: Connect) {
        if let Err(e) = connection.close() {
            warn!("Failed to close libvirt connection to {}: {}", self.uri, e);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub open: usize,
    pub idle: usize,
    pub max: usize,
}

struct PoolState<T> {
    idle: Vec<T>,
    open: usize,
}

pub struct ConnectionPool<C: Connector> {
    connector: Arc<C>,
    settings: PoolSettings,
    state: Mutex<PoolState<C::Connection>>,
    permits: Semaphore,
}

pub type LibvirtPool = ConnectionPool<LibvirtConnector>;

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, settings: PoolSettings) -> Self {
        info!(
            max_connections = settings.max_connections,
            acquire_timeout_ms = settings.acquire_timeout.as_millis() as u64,
            "Creating hypervisor connection pool"
        );
        Self {
            connector: Arc::new(connector),
            settings,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
            }),
            permits: Semaphore::new(settings.max_connections),
        }
    }

    pub fn connector(&self) -> &C {
        self.connector.as_ref()
    }

    /// Borrows a connection, waiting at most `acquire_timeout` when every
    /// connection is checked out.
    pub async fn acquire(&self) -> Result<PooledConnection<'_, C>> {
        let permit = match tokio::time::timeout(self.settings.acquire_timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ComputeError::Connection("connection pool is closed".to_string()));
            }
            Err(_) => {
                warn!(
                    max_connections = self.settings.max_connections,
                    "Timed out waiting for a pooled connection"
                );
                return Err(ComputeError::Connection(format!(
                    "no connection available within {:?}",
                    self.settings.acquire_timeout
                )));
            }
        };

        loop {
            let candidate = self.lock_state().idle.pop();
            let Some(connection) = candidate else { break };
            if self.connector.is_healthy(&connection) {
                return Ok(PooledConnection::new(self, connection, permit));
            }
            warn!("Discarding unhealthy idle connection");
            self.discard(connection);
        }

        let connector = self.connector.clone();
        let connection = tokio::task::spawn_blocking(move || connector.connect())
            .await
            .unwrap_or_else(|e| Err(ComputeError::Connection(format!("connect task failed: {}", e))))?;
        self.lock_state().open += 1;
        debug!("Opened new pooled connection");
        Ok(PooledConnection::new(self, connection, permit))
    }

    /// Runs one synchronous operation on a borrowed connection, on the
    /// blocking thread pool. A connection error invalidates the connection so
    /// it is not handed out again.
    pub async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&C::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = self.acquire().await?;
        let connection = guard
            .connection
            .take()
            .ok_or_else(|| ComputeError::Connection("pooled connection already taken".to_string()))?;

        let (connection, result) = tokio::task::spawn_blocking(move || {
            let result = op(&connection);
            (connection, result)
        })
        .await
        .map_err(|e| ComputeError::Resource(format!("hypervisor call did not complete: {}", e)))?;

        guard.connection = Some(connection);
        if matches!(result, Err(ComputeError::Connection(_))) {
            guard.invalidate();
        }
        result
    }

    /// Returns a borrowed connection; equivalent to dropping the guard.
    pub fn release(&self, connection: PooledConnection<'_, C>) {
        drop(connection);
    }

    /// Opens a connection that is not counted against the pool, for
    /// long-lived consumers such as console streams.
    pub fn open_dedicated(&self) -> Result<C::Connection> {
        self.connector.connect()
    }

    pub fn close_dedicated(&self, connection: C::Connection) {
        self.connector.close(connection);
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock_state();
        PoolStatus {
            open: state.open,
            idle: state.idle.len(),
            max: self.settings.max_connections,
        }
    }

    fn give_back(&self, connection: C::Connection) {
        self.lock_state().idle.push(connection);
    }

    fn discard(&self, connection: C::Connection) {
        self.connector.close(connection);
        let mut state = self.lock_state();
        state.open = state.open.saturating_sub(1);
    }

    fn forget(&self) {
        warn!("Pooled connection was lost while checked out");
        let mut state = self.lock_state();
        state.open = state.open.saturating_sub(1);
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        let idle: Vec<_> = self.lock_state().idle.drain(..).collect();
        for connection in idle {
            self.connector.close(connection);
        }
    }
}

/// A checked-out connection. Dropping it returns the connection to the idle
/// set, unless it was invalidated.
pub struct PooledConnection<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    connection: Option<C::Connection>,
    broken: bool,
    _permit: SemaphorePermit<'a>,
}

impl<'a, C: Connector> PooledConnection<'a, C> {
    fn new(pool: &'a ConnectionPool<C>, connection: C::Connection, permit: SemaphorePermit<'a>) -> Self {
        Self {
            pool,
            connection: Some(connection),
            broken: false,
            _permit: permit,
        }
    }

    /// Marks the connection as broken so it is closed instead of reused.
    pub fn invalidate(&mut self) {
        self.broken = true;
    }
}

impl<C: Connector> Deref for PooledConnection<'_, C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("connection present until drop")
    }
}

impl<C: Connector> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("connection present until drop")
    }
}

impl<C: Connector> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        match self.connection.take() {
            Some(connection) if self.broken => self.pool.discard(connection),
            Some(connection) => self.pool.give_back(connection),
            None => self.pool.forget(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct FakeConnection {
        pub serial: usize,
        pub healthy: Arc<AtomicBool>,
    }

    #[derive(Default, Clone)]
    pub struct FakeConnector {
        pub opened: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
        pub refuse: Arc<AtomicBool>,
    }

    impl Connector for FakeConnector {
        type Connection = FakeConnection;

        fn connect(&self) -> Result<FakeConnection> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ComputeError::Connection("refused".into()));
            }
            let serial = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection {
                serial,
                healthy: Arc::new(AtomicBool::new(true)),
            })
        }

        fn is_healthy(&self, connection: &FakeConnection) -> bool {
            connection.healthy.load(Ordering::SeqCst)
        }

        fn close(&self, _connection: FakeConnection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
