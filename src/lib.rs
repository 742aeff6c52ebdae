pub mod app;
pub mod branch_ops;
pub mod broadcast;
pub mod cache;
pub mod cli;
pub mod error;
pub mod logging;
pub mod materializer;
pub mod pty;
pub mod scanner;
pub mod store;
pub mod vcs;
pub mod web;

pub use app::AppState;
pub use error::{CoreError, CoreResult};
