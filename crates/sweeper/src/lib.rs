//! # Sweeper
//!
//! A daemon that sweeps a directory of repositories for open issues and hands
//! each one to an automated fixer.
//!
//! This crate provides:
//! - A single-instance process lock with stale-owner reclamation
//! - A quota governor that paces remote calls against GitHub rate limits
//! - Attempt tracking with durable cooldown markers and a per-run failure set
//! - The scan, dispatch and sleep loop that ties them together
//!
//! External work (listing issues, generating fixes, running tests, git) sits
//! behind the [`source::ItemSource`], [`fixer::Fixer`], [`quota::QuotaProvider`]
//! and [`tracker::MarkerStore`] traits.

#[cfg(not(unix))]
compile_error!("sweeper relies on unix signals and file locks and only builds on unix");

pub mod config;
pub mod doctor;
pub mod error;
pub mod exec;
pub mod fixer;
pub mod lock;
pub mod orchestrator;
pub mod quota;
pub mod source;
pub mod tracker;

pub use config::Config;
pub use error::{SweeperError, SweeperResult};
pub use fixer::{FixReport, Fixer, PipelineFixer};
pub use lock::ProcessLock;
pub use orchestrator::{Orchestrator, OrchestratorSettings, PassOutcome, PassReport, RunSummary};
pub use quota::{QuotaGovernor, QuotaProvider, QuotaSnapshot};
pub use source::{GhIssueSource, ItemKey, ItemSource, Repository, WorkItem};
pub use tracker::{AttemptOutcome, AttemptRecord, AttemptTracker, MarkerStore};
