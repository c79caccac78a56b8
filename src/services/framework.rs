//! Service framework
//!
//! A [`Service`] runs until the shared broadcast shutdown signal fires.
//! [`ServiceManager`] spawns registered services and stops them together.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::PersistenceError;

// ============================================================================
// Status and Errors
// ============================================================================

/// Lifecycle state of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Not running
    Stopped,
    /// Spawned, not yet in its loop
    Starting,
    /// Running its loop
    Running,
    /// Finishing its final cycle
    Stopping,
    /// Exited with an error
    Failed(String),
}

impl ServiceStatus {
    /// Whether the service is doing work
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Running)
    }
}

/// Errors raised by background services
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Persisting state failed
    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    /// The service is already running
    #[error("Service '{0}' is already running")]
    AlreadyRunning(&'static str),

    /// The service task panicked or was cancelled
    #[error("Service '{name}' task failed: {reason}")]
    TaskFailed {
        /// Service name
        name: &'static str,
        /// Join error
        reason: String,
    },

    /// The service did not stop in time
    #[error("Service '{0}' did not stop before the deadline")]
    StopTimeout(&'static str),
}

// ============================================================================
// Service Trait
// ============================================================================

/// Background service
#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    /// Run until `shutdown` fires or its sender is dropped
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Stable service name
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;
}

// ============================================================================
// Service Manager
// ============================================================================

struct RunningService {
    name: &'static str,
    handle: JoinHandle<Result<(), ServiceError>>,
}

/// Owns the background services and their shutdown channel
pub struct ServiceManager {
    shutdown_tx: broadcast::Sender<()>,
    services: RwLock<Vec<Arc<dyn Service>>>,
    running: Mutex<Vec<RunningService>>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    /// Create an empty manager
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            services: RwLock::new(Vec::new()),
            running: Mutex::new(Vec::new()),
        }
    }

    /// Register a service; it starts with the next `start_all`
    pub fn register(&self, service: Arc<dyn Service>) {
        tracing::debug!(service = service.name(), "Service registered");
        self.services.write().push(service);
    }

    /// Spawn every registered service that is not running yet
    pub fn start_all(&self) -> Result<(), ServiceError> {
        let services = self.services.read().clone();
        let mut running = self.running.lock();

        for service in services {
            let name = service.name();
            if running.iter().any(|r| r.name == name && !r.handle.is_finished()) {
                return Err(ServiceError::AlreadyRunning(name));
            }
            let rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                let result = service.start(rx).await;
                if let Err(e) = &result {
                    tracing::error!(service = service.name(), error = %e, "Service exited with error");
                }
                result
            });
            running.push(RunningService { name, handle });
            tracing::info!(service = name, "Service started");
        }
        Ok(())
    }

    /// Names and statuses of registered services
    pub fn statuses(&self) -> Vec<(&'static str, ServiceStatus)> {
        self.services
            .read()
            .iter()
            .map(|s| (s.name(), s.status()))
            .collect()
    }

    /// Signal shutdown and wait up to `timeout` for every service
    ///
    /// Services still running at the deadline are aborted. Returns the
    /// errors of services that failed or had to be aborted.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<ServiceError> {
        // No receivers simply means nothing is running
        let _ = self.shutdown_tx.send(());

        let running: Vec<RunningService> = std::mem::take(&mut *self.running.lock());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut errors = Vec::new();

        for RunningService { name, mut handle } in running {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => tracing::debug!(service = name, "Service stopped"),
                Ok(Ok(Err(e))) => errors.push(e),
                Ok(Err(join)) => errors.push(ServiceError::TaskFailed {
                    name,
                    reason: join.to_string(),
                }),
                Err(_) => {
                    handle.abort();
                    tracing::warn!(service = name, "Service aborted after shutdown deadline");
                    errors.push(ServiceError::StopTimeout(name));
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Ticker {
        ticks: AtomicU32,
        status: RwLock<ServiceStatus>,
    }

    #[async_trait::async_trait]
    impl Service for Ticker {
        async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
            *self.status.write() = ServiceStatus::Running;
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {
                        self.ticks.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            *self.status.write() = ServiceStatus::Stopped;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "ticker"
        }

        fn status(&self) -> ServiceStatus {
            self.status.read().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let ticker = Arc::new(Ticker {
            ticks: AtomicU32::new(0),
            status: RwLock::new(ServiceStatus::Stopped),
        });
        let manager = ServiceManager::new();
        manager.register(ticker.clone());
        manager.start_all().unwrap();

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert_eq!(manager.statuses(), vec![("ticker", ServiceStatus::Running)]);
        assert!(manager.start_all().is_err());

        let errors = manager.shutdown(Duration::from_secs(1)).await;
        assert!(errors.is_empty());
        assert_eq!(ticker.status(), ServiceStatus::Stopped);
        assert!(ticker.ticks.load(Ordering::Relaxed) >= 5);
    }

    #[tokio::test]
    async fn test_shutdown_without_services() {
        let manager = ServiceManager::new();
        assert!(manager.shutdown(Duration::from_millis(10)).await.is_empty());
    }

    #[test]
    fn test_status_is_running() {
        assert!(ServiceStatus::Running.is_running());
        assert!(ServiceStatus::Starting.is_running());
        assert!(!ServiceStatus::Failed("boom".into()).is_running());
        assert!(!ServiceStatus::Stopped.is_running());
    }
}
