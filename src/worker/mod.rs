//! Worker runtime: two cooperating long-lived loops over the substrate.
//!
//! Workers are stateless dispatchers. The heartbeat worker services the
//! external-call queue and starts due heartbeats; the maintenance worker owns
//! inbox polling, outbox flushing, substrate maintenance, and the
//! subconscious decider. Both observe a signal-driven shutdown flag and exit
//! cleanly when the agent is terminated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bridge::RabbitBridge;
use crate::calls::ExternalCallProcessor;
use crate::config::{RabbitSettings, WorkerMode, WorkerSettings};
use crate::store::Store;
use crate::subconscious::run_subconscious_decider;
use crate::tools::create_default_registry;

/// Shared stop flag flipped by signals or an observed termination.
#[derive(Debug, Clone)]
pub struct Shutdown {
    running: Arc<AtomicBool>,
}

impl Shutdown {
    /// A fresh, running flag.
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether loops should keep running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request shutdown; loops exit at their next iteration boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless worker bridging the substrate and external APIs.
pub struct HeartbeatWorker {
    store: Store,
    processor: ExternalCallProcessor,
    settings: WorkerSettings,
    shutdown: Shutdown,
}

impl HeartbeatWorker {
    /// Build a heartbeat worker with the default tool registry attached.
    pub fn new(store: Store, settings: WorkerSettings, shutdown: Shutdown) -> Self {
        let registry = Arc::new(create_default_registry(store.clone()));
        let processor = ExternalCallProcessor::new(store.clone(), settings.max_retries)
            .with_tool_registry(registry);
        Self {
            store,
            processor,
            settings,
            shutdown,
        }
    }

    /// Run the loop until shutdown, consent refusal, or termination.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("heartbeat worker starting");

        match crate::consent::ensure_consent(&self.store, None).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("LLM consent not granted; heartbeat worker exiting");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "consent flow failed; heartbeat worker exiting");
                return Ok(());
            }
        }

        while self.shutdown.is_running() {
            if self.is_terminated().await {
                info!("agent is terminated; heartbeat worker exiting");
                self.shutdown.stop();
                break;
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "heartbeat worker loop error");
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }

        info!("heartbeat worker stopped");
        Ok(())
    }

    async fn tick(&self) -> anyhow::Result<()> {
        if let Some(processed) = self.processor.process_pending_call().await? {
            if processed.terminated {
                info!("termination executed; stopping workers");
                self.shutdown.stop();
                return Ok(());
            }
        }

        if let Some(started) = self.store.run_heartbeat().await? {
            info!(heartbeat_id = %started.heartbeat_id, "heartbeat started");
        }

        Ok(())
    }

    async fn is_terminated(&self) -> bool {
        self.store.is_agent_terminated().await.unwrap_or(false)
    }
}

/// Maintenance loop: inbox/outbox bridging, substrate upkeep, subconscious.
pub struct MaintenanceWorker {
    store: Store,
    bridge: Option<RabbitBridge>,
    settings: WorkerSettings,
    shutdown: Shutdown,
}

impl MaintenanceWorker {
    /// Build a maintenance worker; the bridge is attached when enabled.
    pub fn new(store: Store, settings: WorkerSettings, shutdown: Shutdown) -> Self {
        let rabbit = RabbitSettings::from_env();
        let bridge = rabbit
            .enabled
            .then(|| RabbitBridge::new(store.clone(), rabbit));
        Self {
            store,
            bridge,
            settings,
            shutdown,
        }
    }

    /// Run the loop until shutdown or termination.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("maintenance worker starting");

        if let Some(bridge) = &self.bridge {
            bridge.ensure_ready().await;
        }

        while self.shutdown.is_running() {
            if self.store.is_agent_terminated().await.unwrap_or(false) {
                info!("agent is terminated; maintenance worker exiting");
                self.shutdown.stop();
                break;
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "maintenance loop error");
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }

        info!("maintenance worker stopped");
        Ok(())
    }

    async fn tick(&self) -> anyhow::Result<()> {
        if let Some(bridge) = &self.bridge {
            bridge.poll_inbox_messages(10).await;
            bridge.flush_outbox(10).await;
        }

        if let Some(stats) = self
            .store
            .run_maintenance_if_due(&serde_json::json!({}))
            .await?
        {
            let skipped = stats
                .get("skipped")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if !skipped {
                info!(stats = %stats, "substrate maintenance");
            }
        }

        if self.store.should_run_subconscious_decider().await? {
            let result = run_subconscious_decider(&self.store).await;
            // Mark regardless of outcome so a broken binding cannot wedge the
            // cadence.
            self.store.mark_subconscious_decider_run().await?;
            match result {
                Ok(summary) => info!(result = %summary, "subconscious decider"),
                Err(e) => warn!(error = %e, "subconscious decider failed"),
            }
        }

        Ok(())
    }
}

/// Run the selected worker loops with signal-driven shutdown.
pub async fn run_workers(store: Store, mode: WorkerMode) -> anyhow::Result<()> {
    let settings = WorkerSettings::from_env();
    let shutdown = Shutdown::new();

    spawn_signal_handler(shutdown.clone());

    match mode {
        WorkerMode::Heartbeat => {
            HeartbeatWorker::new(store, settings, shutdown).run().await
        }
        WorkerMode::Maintenance => {
            MaintenanceWorker::new(store, settings, shutdown).run().await
        }
        WorkerMode::Both => {
            let heartbeat = HeartbeatWorker::new(store.clone(), settings.clone(), shutdown.clone());
            let maintenance = MaintenanceWorker::new(store, settings, shutdown);
            let (hb, maint) = tokio::join!(heartbeat.run(), maintenance.run());
            hb?;
            maint
        }
    }
}

/// Flip the shutdown flag on SIGINT/SIGTERM.
fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    if ctrl_c.await.is_ok() {
                        info!("interrupt received; shutting down");
                        shutdown.stop();
                    }
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("interrupt received; shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received; shutting down"),
            }
            shutdown.stop();
        }

        #[cfg(not(unix))]
        {
            if ctrl_c.await.is_ok() {
                info!("interrupt received; shutting down");
                shutdown.stop();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag() {
        let shutdown = Shutdown::new();
        assert!(shutdown.is_running());
        let observer = shutdown.clone();
        shutdown.stop();
        assert!(!observer.is_running());
    }
}
