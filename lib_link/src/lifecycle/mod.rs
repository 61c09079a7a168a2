//! # Lifecycle Module
//!
//! Swapping dashboard views without a reload, with at most one page module
//! active at a time.
//!
//! ## Contained Modules:
//! - **`page`**: the `PageModule` trait, `Route`, and the `PageScope` every
//!   registration goes through.
//! - **`registry`**: route to module table, including deferred loaders.
//! - **`history`**: push / replace / back / forward history entries.
//! - **`controller`**: the `PageLifecycleController` state machine.

pub mod controller;
pub mod history;
pub mod page;
pub mod registry;

pub use controller::{ControllerState, NavigationKind, NavigationReport, PageLifecycleController};
pub use history::{HistoryState, NavigationHistory};
pub use page::{
    ActivationToken, ComponentId, Disposable, PageModule, PageScope, ReleaseSummary, Route, ScopeHandle, TaskId,
};
pub use registry::{ModuleLoader, PageRegistry};
