//! Execution orchestration.
//!
//! Covers the phase driver, concurrent work discovery for analysis,
//! stuck-phase recovery, and crash resumption.

pub mod health_monitor;
pub mod pipeline;
pub mod resumption;
pub mod work_discovery;

pub use self::health_monitor::{DefaultTimeoutPolicy, HealthMonitor, RecoveryAction, TimeoutPolicy};
pub use self::pipeline::{Orchestrator, OrchestratorSettings};
pub use self::resumption::{ResumeReason, ResumptionService};
pub use self::work_discovery::{AnalysisContext, MonitorSettings, WorkDiscoveryMonitor};
