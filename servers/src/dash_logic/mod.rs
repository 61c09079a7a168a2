//! Building blocks of the `dash_shell` binary.
//!
//! - **`config`**: command line and environment layer over `LinkConfig`.
//! - **`pages`**: the dashboard page modules and their route table.
//! - **`shell`**: the stdin navigation loop and the offline simulator.

pub mod config;
pub mod pages;
pub mod shell;
