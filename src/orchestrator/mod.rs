//! Orchestrator module
//!
//! Dependency graph, launch back-ends, and the health-gated startup engine.

mod engine;
mod graph;
mod launcher;

pub use engine::{DependencyOrchestrator, ProbeFactory, StartOrder, StartupEvent};
pub use graph::{ServiceGraph, ServiceNode};
pub use launcher::{Launcher, RuntimeLauncher};
