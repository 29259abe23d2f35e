//! Target routing and prober lifecycle.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::ProberSettings;
use crate::event::Event;
use crate::probe::{AcceptError, ProbeError, Prober};
use crate::target::{parse_target, TargetError};

/// Capacity of the shared event channel.
pub const EVENT_BUFFER: usize = 1000;

/// The channel every prober writes its events to.
pub fn event_channel() -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
    mpsc::channel(EVENT_BUFFER)
}

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("cannot parse target {target:?}: {source}")]
    Parse { target: String, source: TargetError },
    #[error("no prober accepts target {0:?}")]
    Unroutable(String),
    #[error("target rejected by {prober}: {source}")]
    Rejected { prober: String, source: AcceptError },
    #[error("cannot create prober {prober:?}: {source}")]
    Construct { prober: String, source: ProbeError },
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("prober {prober} failed: {source}")]
    Prober { prober: String, source: ProbeError },
    #[error("prober task failed: {0}")]
    Task(String),
}

/// Where a target string ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub input: String,
    pub prober: String,
    /// Key the target's events carry
    pub display: String,
}

/// Stops a running [`ProbeManager`] from anywhere.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// Routes targets to probers and runs them.
pub struct ProbeManager {
    settings: ProberSettings,
    probers: Vec<Prober>,
    routes: Vec<Route>,
    events: mpsc::Sender<Event>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ProbeManager {
    pub fn new(settings: ProberSettings, events: mpsc::Sender<Event>) -> Self {
        Self {
            settings,
            probers: Vec::new(),
            routes: Vec::new(),
            events,
            shutdown: Arc::new(watch::channel(false).0),
        }
    }

    /// Route every input to the first prober that accepts it.
    ///
    /// Probers are tried in settings order and created the first time one
    /// of their targets shows up. Nothing from a failed call stays routed.
    pub fn route_targets(&mut self, inputs: &[String]) -> Result<Vec<Route>, RouteError> {
        let prober_count = self.probers.len();
        let route_count = self.routes.len();
        let target_counts: Vec<usize> = self.probers.iter().map(Prober::target_count).collect();

        let mut routed = Vec::with_capacity(inputs.len());
        for input in inputs {
            match self.route_one(input) {
                Ok(route) => {
                    tracing::debug!("routed {} to {}", route.input, route.prober);
                    routed.push(route);
                }
                Err(e) => {
                    self.probers.truncate(prober_count);
                    for (prober, count) in self.probers.iter_mut().zip(&target_counts) {
                        prober.truncate_targets(*count);
                    }
                    self.routes.truncate(route_count);
                    return Err(e);
                }
            }
        }

        self.routes.extend(routed.iter().cloned());
        Ok(routed)
    }

    fn route_one(&mut self, input: &str) -> Result<Route, RouteError> {
        let target = parse_target(input).map_err(|source| RouteError::Parse {
            target: input.to_string(),
            source,
        })?;

        for entry in &self.settings.probers {
            if !Prober::claims(&entry.name, &entry.config, target.scheme()) {
                continue;
            }

            let index = match self.probers.iter().position(|p| p.name() == entry.name) {
                Some(index) => index,
                None => {
                    let prober = Prober::from_config(&entry.name, &entry.config).map_err(
                        |source| RouteError::Construct {
                            prober: entry.name.clone(),
                            source,
                        },
                    )?;
                    tracing::debug!("created {} prober {}", entry.config.protocol(), entry.name);
                    self.probers.push(prober);
                    self.probers.len() - 1
                }
            };

            match self.probers[index].accept(input) {
                Ok(display) => {
                    return Ok(Route {
                        input: input.to_string(),
                        prober: entry.name.clone(),
                        display,
                    })
                }
                Err(AcceptError::NotAccepted) => continue,
                Err(source) => {
                    return Err(RouteError::Rejected {
                        prober: entry.name.clone(),
                        source,
                    })
                }
            }
        }

        Err(RouteError::Unroutable(input.to_string()))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Names of the probers holding at least one target.
    pub fn active_probers(&self) -> Vec<&str> {
        self.probers
            .iter()
            .filter(|p| p.has_targets())
            .map(Prober::name)
            .collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Run every active prober until shutdown or the first fatal error.
    ///
    /// All probers are stopped before this returns, and the manager's event
    /// sender is dropped with it.
    pub async fn run(self, interval: Duration, timeout: Duration) -> Result<(), ManagerError> {
        let probers: Vec<Arc<Prober>> = self
            .probers
            .into_iter()
            .filter(Prober::has_targets)
            .map(Arc::new)
            .collect();

        tracing::info!(
            "starting {} probers for {} targets",
            probers.len(),
            self.routes.len()
        );

        let mut tasks = JoinSet::new();
        for prober in &probers {
            let prober = prober.clone();
            let events = self.events.clone();
            tasks.spawn(async move {
                let result = prober.start(events, interval, timeout).await;
                (prober.name().to_string(), result)
            });
        }
        drop(self.events);

        let mut shutdown = self.shutdown.subscribe();
        let mut result = Ok(());
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|s| *s) => {
                    tracing::info!("shutdown requested");
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(())))) => {
                        tracing::warn!("prober {} exited", name);
                    }
                    Some(Ok((prober, Err(source)))) => {
                        tracing::error!("prober {} failed: {}", prober, source);
                        result = Err(ManagerError::Prober { prober, source });
                        break;
                    }
                    Some(Err(e)) => {
                        result = Err(ManagerError::Task(e.to_string()));
                        break;
                    }
                },
            }
        }

        for prober in &probers {
            prober.stop().await;
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((prober, Err(source))) if result.is_ok() => {
                    result = Err(ManagerError::Prober { prober, source });
                }
                Err(e) if result.is_ok() => result = Err(ManagerError::Task(e.to_string())),
                _ => {}
            }
        }

        tracing::info!("all probers stopped");
        result
    }
}
