//! Service Framework
//!
//! Every fleet process runs a handful of background loops next to its HTTP
//! server: heartbeats, assignment polling, hint flushing, the failure
//! detector, the standing-query ticker. This module provides:
//! - `Service` trait for long-running background tasks
//! - `PeriodicTask` and `Periodic` for the common "do X every T" loop
//! - `ServiceManager` for starting them together and stopping them on
//!   shutdown within a bounded time

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

// ============================================================================
// Service Trait
// ============================================================================

/// Trait for implementing background services
///
/// `start` runs the main loop and must return once `shutdown` fires.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Service name for logging and identification
    fn name(&self) -> &'static str;

    fn status(&self) -> ServiceStatus;
}

// ============================================================================
// Service Status
// ============================================================================

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopped,
}

// ============================================================================
// Service Error
// ============================================================================

/// Errors that can occur in services
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service already registered: {0}")]
    AlreadyRegistered(&'static str),

    #[error("Service shutdown error: {0}")]
    ShutdownError(String),
}

// ============================================================================
// Periodic Tasks
// ============================================================================

/// One iteration of a loop that runs every `period`
///
/// Failures are logged and the loop carries on; the next tick is the
/// retry.
#[async_trait::async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn period(&self) -> Duration;

    async fn run_once(&self) -> crate::Result<()>;
}

/// Adapts a [`PeriodicTask`] into a [`Service`]
pub struct Periodic<T: PeriodicTask> {
    task: Arc<T>,
    status: RwLock<ServiceStatus>,
}

impl<T: PeriodicTask> Periodic<T> {
    pub fn new(task: Arc<T>) -> Self {
        Self {
            task,
            status: RwLock::new(ServiceStatus::Starting),
        }
    }

    /// Shorthand for registering with a manager
    pub fn service(task: Arc<T>) -> Arc<dyn Service> {
        Arc::new(Self::new(task))
    }
}

#[async_trait::async_trait]
impl<T: PeriodicTask> Service for Periodic<T> {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        let mut interval = tokio::time::interval(self.task.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        *self.status.write() = ServiceStatus::Running;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.task.run_once().await {
                        tracing::warn!(task = self.task.name(), error = %e, "Periodic task failed");
                    }
                },
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!(task = self.task.name(), "Periodic task stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.task.name()
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

// ============================================================================
// Service Manager
// ============================================================================

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
}

/// Manager for coordinating background services
pub struct ServiceManager {
    shutdown_timeout: Duration,
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServiceManager {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_timeout,
            services: RwLock::new(HashMap::new()),
            shutdown_tx,
        }
    }

    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRegistered(name));
        }
        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
            },
        );
        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Spawn every registered service that is not already running
    pub fn start_all(&self) {
        let mut services = self.services.write();
        for (name, handle) in services.iter_mut() {
            if handle.task.is_some() {
                continue;
            }
            let service = handle.service.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            handle.task = Some(tokio::spawn(async move { service.start(shutdown_rx).await }));
            tracing::debug!(service = *name, "Service started");
        }
    }

    /// Status of every registered service, for health endpoints
    pub fn statuses(&self) -> Vec<(&'static str, ServiceStatus)> {
        let services = self.services.read();
        let mut out: Vec<_> = services
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect();
        out.sort_by_key(|(name, _)| *name);
        out
    }

    /// Signal shutdown and wait for services, bounded by the timeout
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        tracing::info!("Stopping background services");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<(&'static str, JoinHandle<Result<(), ServiceError>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut failures = Vec::new();
        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!(service = name, "Service stopped gracefully");
                },
                Ok(Ok(Err(e))) => {
                    tracing::warn!(service = name, error = %e, "Service stopped with error");
                    failures.push(name);
                },
                Ok(Err(e)) => {
                    tracing::error!(service = name, error = %e, "Service task panicked");
                    failures.push(name);
                },
                Err(_) => {
                    tracing::warn!(service = name, "Service did not stop in time");
                    failures.push(name);
                },
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::ShutdownError(failures.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        runs: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PeriodicTask for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn period(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run_once(&self) -> crate::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Err(crate::Error::Internal("keeps going".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_survives_errors_and_stops() {
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
        });
        let manager = ServiceManager::new(Duration::from_secs(1));
        manager.register(Periodic::service(counter.clone())).unwrap();
        manager.start_all();

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(counter.runs.load(Ordering::SeqCst) >= 3);

        manager.shutdown().await.unwrap();
        let after = counter.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.runs.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let manager = ServiceManager::new(Duration::from_secs(1));
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
        });
        manager.register(Periodic::service(counter.clone())).unwrap();
        assert!(matches!(
            manager.register(Periodic::service(counter)),
            Err(ServiceError::AlreadyRegistered("counter"))
        ));
    }
}
