//! Multiserver - a pre-forking supervisor for prefix-routed services
//!
//! This library provides a multi-process request server that:
//! - Binds one listening socket and shares it with N worker processes
//! - Routes each request to the first service whose URI prefix matches
//! - Bounds every service with a worker limit, a queue capacity and a timeout
//! - Hot-reloads services when their touch files or the config file change
//! - Scales the worker set up and down on reload (newest workers stop first)
//! - Funnels the log output of every process through one relay

pub mod app;
pub mod config;
pub mod error;
pub mod expand;
pub mod handlers;
pub mod relay;
pub mod service;
pub mod supervisor;
pub mod worker;
