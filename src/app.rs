//! Composition root.
//!
//! [`App`] builds every component once, wires them together and owns the
//! root [`CancellationToken`] and [`TaskTracker`]. Shutdown cancels the token
//! (which kills in-flight agents) and waits for every tracked task.

use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::agents::{
    AgentRunner, AgentSettingsRegistry, CliAgentRunner, Investigator, ProcessRegistry, RateLimitTracker,
};
use crate::api::{self, ApiState};
use crate::config::ServerConfig;
use crate::events::EventHub;
use crate::lifecycle::Lifecycle;
use crate::processor::{Processor, ProcessorControl};
use crate::storage::IssueStore;
use crate::Result;

/// The running control plane.
pub struct App {
    config: ServerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    lifecycle: Lifecycle,
    settings: Arc<AgentSettingsRegistry>,
    control: ProcessorControl,
    investigator: Investigator,
    rate_limits: RateLimitTracker,
}

impl App {
    /// Build the app with the real agent CLI, run from the scenario root.
    pub fn build(config: ServerConfig) -> Result<Self> {
        let runner = Arc::new(CliAgentRunner::new(&config.paths.scenario_root));
        Self::with_runner(config, runner)
    }

    /// Build the app around a custom [`AgentRunner`].
    ///
    /// Must be called inside a tokio runtime: the event hub dispatcher is
    /// spawned immediately.
    pub fn with_runner(config: ServerConfig, runner: Arc<dyn AgentRunner>) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let store = Arc::new(IssueStore::open(&config.paths.data_dir)?);
        let hub = EventHub::spawn(&tracker, shutdown.child_token());
        let registry = ProcessRegistry::with_parent(shutdown.clone());
        let lifecycle = Lifecycle::new(store, hub.clone(), registry.clone());

        let settings = Arc::new(AgentSettingsRegistry::new(&config.paths.scenario_root));
        let control = ProcessorControl::new(config.processor.clone(), registry, hub);
        let investigator = Investigator::new(
            lifecycle.clone(),
            settings.clone(),
            runner,
            control.clone(),
            &config.paths.scenario_root,
            tracker.clone(),
        );
        let rate_limits = RateLimitTracker::new(lifecycle.clone());

        tracing::info!(
            data_dir = %config.paths.data_dir.display(),
            scenario_root = %config.paths.scenario_root.display(),
            "issue tracker initialized"
        );

        Ok(Self {
            config,
            shutdown,
            tracker,
            lifecycle,
            settings,
            control,
            investigator,
            rate_limits,
        })
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn control(&self) -> &ProcessorControl {
        &self.control
    }

    pub fn investigator(&self) -> &Investigator {
        &self.investigator
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// State shared by the HTTP handlers.
    pub fn api_state(&self) -> ApiState {
        ApiState {
            lifecycle: self.lifecycle.clone(),
            investigator: self.investigator.clone(),
            control: self.control.clone(),
            settings: self.settings.clone(),
            rate_limits: self.rate_limits.clone(),
            scenario_root: Arc::new(self.config.paths.scenario_root.clone()),
            allowed_origins: Arc::new(self.config.allowed_origins.clone()),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn router(&self) -> Router {
        api::router(self.api_state())
    }

    /// Start the processor loop on the app's tracker.
    pub fn start_processor(&self) {
        let processor = Processor::new(self.control.clone(), self.investigator.clone(), self.lifecycle.clone());
        self.tracker.spawn(processor.run(self.shutdown.child_token()));
    }

    /// Bind the configured address and serve until a shutdown signal.
    pub async fn serve(self) -> Result<()> {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener until a signal or [`App::shutdown_token`] fires.
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        self.start_processor();
        let router = self.router();

        tracing::info!(%addr, "issue tracker listening");

        let token = self.shutdown.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => tracing::info!("shutdown signal received"),
                    _ = token.cancelled() => {}
                }
            })
            .await;

        self.shutdown().await;
        served?;
        Ok(())
    }

    /// Cancel everything and wait for tracked tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("issue tracker stopped");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
