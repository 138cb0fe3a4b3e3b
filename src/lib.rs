pub mod auth;
pub mod compute;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod image;
pub mod poller;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod watcher;
pub mod worker;
