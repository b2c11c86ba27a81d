//! Explicit wiring of every long-lived service.
//!
//! Built once at process start (or per test) and passed by reference;
//! nothing here is global.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collaborators::Collaborators;
use crate::config::GlobalConfig;
use crate::orchestrator::{
    HealthMonitor, MonitorSettings, Orchestrator, OrchestratorSettings, ResumptionService,
    WorkDiscoveryMonitor,
};
use crate::persistence::db::Database;
use crate::persistence::{retention, StateStore};
use crate::phases::PhaseRegistry;
use crate::resilience::CallGuard;
use crate::scheduler::Scheduler;

/// Shared application state.
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Repositories.
    pub store: StateStore,
    /// Breakers, semaphore and retry policy shared by every external call.
    pub guard: CallGuard,
    /// Phase driver.
    pub orchestrator: Arc<Orchestrator>,
    /// Stuck-phase watchdog.
    pub health: Arc<HealthMonitor>,
    /// Crash recovery.
    pub resumption: Arc<ResumptionService>,
    /// Recurrence scheduler.
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Wire every service with the built-in phase executors.
    #[must_use]
    pub fn build(config: GlobalConfig, db: Arc<Database>, collaborators: &Collaborators) -> Self {
        let guard = CallGuard::from_config(&config);
        let phases = PhaseRegistry::builtin(collaborators, &guard);
        Self::with_phases(config, db, collaborators, guard, phases)
    }

    /// Wire every service around a caller-supplied phase registry.
    #[must_use]
    pub fn with_phases(
        config: GlobalConfig,
        db: Arc<Database>,
        collaborators: &Collaborators,
        guard: CallGuard,
        phases: PhaseRegistry,
    ) -> Self {
        let store = StateStore::new(db);
        let monitor = WorkDiscoveryMonitor::new(
            store.clone(),
            Arc::clone(&collaborators.analyzer),
            guard.clone(),
            MonitorSettings::from_config(&config),
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            phases,
            monitor,
            OrchestratorSettings::from_config(&config),
        );
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&orchestrator),
            Arc::clone(guard.breakers()),
            config.health.clone(),
        ));
        let resumption = Arc::new(ResumptionService::new(Arc::clone(&orchestrator), &config));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&orchestrator),
            config.scheduler.clone(),
        ));

        Self {
            config: Arc::new(config),
            store,
            guard,
            orchestrator,
            health,
            resumption,
            scheduler,
        }
    }

    /// Start every background loop under `cancel`.
    #[must_use]
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            Arc::clone(&self.health).spawn(cancel.clone()),
            retention::spawn_retention_task(
                Arc::clone(self.store.db()),
                self.config.retention_days,
                cancel.clone(),
            ),
        ];
        if self.config.scheduler.enabled {
            handles.push(Arc::clone(&self.scheduler).spawn(cancel.clone()));
        } else {
            info!("scheduler disabled");
        }
        if let Some(handle) = Arc::clone(&self.resumption).spawn(cancel.clone()) {
            handles.push(handle);
        }
        handles
    }
}
