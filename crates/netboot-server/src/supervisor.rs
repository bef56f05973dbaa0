//! Listener supervision
//!
//! Every listener runs in its own task and reports exactly one outcome into
//! a shared channel with room for all of them plus one shutdown request, so
//! no report can ever block. [`Supervisor::serve`] returns on the first
//! outcome and signals every listener to stop, but does not wait for them:
//! sockets may still be open when it returns and are released when the
//! tasks finish or the process exits.

use crate::error::{BoxError, Result, ServerError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// A listener loop over an already bound socket
#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    /// Serve until `shutdown` turns true or the sender goes away
    async fn serve(self: Box<Self>, shutdown: watch::Receiver<bool>) -> std::result::Result<(), BoxError>;
}

enum Outcome {
    Listener {
        service: &'static str,
        result: std::result::Result<(), BoxError>,
    },
    Shutdown,
}

#[derive(Debug, Default)]
struct Flags {
    delivered: AtomicBool,
    shutdown_pending: AtomicBool,
}

/// Runs listeners and surfaces the first outcome
pub struct Supervisor {
    services: Vec<Box<dyn Service>>,
    outcomes_tx: mpsc::Sender<Outcome>,
    outcomes_rx: mpsc::Receiver<Outcome>,
    flags: Arc<Flags>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.services.iter().map(|s| s.name()).collect();
        f.debug_struct("Supervisor")
            .field("services", &names)
            .finish_non_exhaustive()
    }
}

/// Requests a clean stop of a [`Supervisor`]
#[derive(Clone)]
pub struct ShutdownHandle {
    outcomes_tx: mpsc::Sender<Outcome>,
    flags: Arc<Flags>,
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("delivered", &self.flags.delivered.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ShutdownHandle {
    /// Enqueue a clean outcome
    ///
    /// Returns false without effect when an outcome was already delivered or
    /// a shutdown is already pending.
    pub fn shutdown(&self) -> bool {
        if self.flags.delivered.load(Ordering::SeqCst) {
            return false;
        }
        if self.flags.shutdown_pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.outcomes_tx.try_send(Outcome::Shutdown).is_ok()
    }
}

impl Supervisor {
    pub fn new(services: Vec<Box<dyn Service>>) -> (Self, ShutdownHandle) {
        let (outcomes_tx, outcomes_rx) = mpsc::channel(services.len() + 1);
        let flags = Arc::new(Flags::default());
        let handle = ShutdownHandle {
            outcomes_tx: outcomes_tx.clone(),
            flags: flags.clone(),
        };
        (
            Self {
                services,
                outcomes_tx,
                outcomes_rx,
                flags,
            },
            handle,
        )
    }

    /// Start every listener and return the first outcome
    pub async fn serve(self) -> Result<()> {
        let Supervisor {
            services,
            outcomes_tx,
            mut outcomes_rx,
            flags,
        } = self;

        let names: Vec<_> = services.iter().map(|s| s.name()).collect();
        info!(listeners = ?names, "Starting servers");

        let mut cancels = Vec::with_capacity(services.len());
        for service in services {
            let (cancel_tx, cancel_rx) = watch::channel(false);
            cancels.push(cancel_tx);

            let outcomes_tx = outcomes_tx.clone();
            tokio::spawn(async move {
                let service_name = service.name();
                let result = service.serve(cancel_rx).await;
                // Capacity covers every listener, so this never waits
                let _ = outcomes_tx
                    .send(Outcome::Listener {
                        service: service_name,
                        result,
                    })
                    .await;
            });
        }
        drop(outcomes_tx);

        let outcome = outcomes_rx.recv().await;
        flags.delivered.store(true, Ordering::SeqCst);

        for cancel in &cancels {
            let _ = cancel.send(true);
        }

        match outcome {
            Some(Outcome::Listener {
                service,
                result: Err(source),
            }) => {
                error!(service = service, error = %source, "Listener failed, stopping");
                Err(ServerError::Listener { service, source })
            }
            Some(Outcome::Listener {
                service,
                result: Ok(()),
            }) => {
                warn!(service = service, "Listener stopped, stopping");
                Ok(())
            }
            Some(Outcome::Shutdown) => {
                info!("Shutdown requested");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    enum Behaviour {
        /// Fail right away
        Fail(&'static str),
        /// Run until cancelled, then report on `stopped`
        Pending(mpsc::UnboundedSender<&'static str>),
        /// Wait for `go`, then fail
        FailOn(watch::Receiver<bool>),
    }

    struct Simulated {
        name: &'static str,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl Service for Simulated {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn serve(self: Box<Self>, mut shutdown: watch::Receiver<bool>) -> std::result::Result<(), BoxError> {
            let Simulated { name, behaviour } = *self;
            match behaviour {
                Behaviour::Fail(message) => Err(message.into()),
                Behaviour::Pending(stopped) => {
                    loop {
                        if shutdown.changed().await.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    let _ = stopped.send(name);
                    Ok(())
                }
                Behaviour::FailOn(mut go) => {
                    let _ = go.wait_for(|go| *go).await;
                    Err(format!("{name} failed").into())
                }
            }
        }
    }

    const NAMES: [&str; 5] = ["pxe", "tftp", "http", "dhcp", "dns"];

    fn pending_set(stopped: &mpsc::UnboundedSender<&'static str>) -> Vec<Box<dyn Service>> {
        NAMES
            .into_iter()
            .map(|name| {
                Box::new(Simulated {
                    name,
                    behaviour: Behaviour::Pending(stopped.clone()),
                }) as Box<dyn Service>
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_error_is_returned_and_others_cancelled() {
        let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
        let mut services = pending_set(&stopped_tx);
        services[2] = Box::new(Simulated {
            name: "http",
            behaviour: Behaviour::Fail("listener closed"),
        });

        let (supervisor, _handle) = Supervisor::new(services);
        let err = supervisor.serve().await.unwrap_err();
        match err {
            ServerError::Listener { service, source } => {
                assert_eq!(service, "http");
                assert_eq!(source.to_string(), "listener closed");
            }
            other => panic!("unexpected error {other}"),
        }

        let mut cancelled = Vec::new();
        for _ in 0..4 {
            let name = timeout(Duration::from_secs(1), stopped_rx.recv())
                .await
                .unwrap()
                .unwrap();
            cancelled.push(name);
        }
        cancelled.sort_unstable();
        assert_eq!(cancelled, vec!["dhcp", "dns", "pxe", "tftp"]);
    }

    #[tokio::test]
    async fn test_simultaneous_failures_return_one_error() {
        let (go_tx, go_rx) = watch::channel(false);
        let services: Vec<Box<dyn Service>> = NAMES
            .into_iter()
            .map(|name| {
                Box::new(Simulated {
                    name,
                    behaviour: Behaviour::FailOn(go_rx.clone()),
                }) as Box<dyn Service>
            })
            .collect();

        let (supervisor, handle) = Supervisor::new(services);
        let serving = tokio::spawn(supervisor.serve());
        tokio::task::yield_now().await;
        go_tx.send(true).unwrap();

        let err = timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        let ServerError::Listener { service, source } = err else {
            panic!("expected a listener error");
        };
        assert!(NAMES.contains(&service));
        assert_eq!(source.to_string(), format!("{service} failed"));

        // Already delivered
        assert!(!handle.shutdown());
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving_cleanly() {
        let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
        let (supervisor, handle) = Supervisor::new(pending_set(&stopped_tx));
        let serving = tokio::spawn(supervisor.serve());

        assert!(handle.shutdown());
        assert!(!handle.shutdown());

        timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        for _ in 0..NAMES.len() {
            timeout(Duration::from_secs(1), stopped_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(!handle.shutdown());
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let (stopped_tx, _stopped_rx) = mpsc::unbounded_channel();
        let (supervisor, handle) = Supervisor::new(pending_set(&stopped_tx));
        assert!(handle.shutdown());
        supervisor.serve().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_listeners_and_no_handle() {
        let (supervisor, handle) = Supervisor::new(Vec::new());
        drop(handle);
        supervisor.serve().await.unwrap();
    }
}
