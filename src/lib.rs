//! vttgate - a path-routing gateway for virtual tabletop server instances
//!
//! This library provides:
//! - Routing of `/<prefix>/<slug>/...` traffic to per-instance backend processes
//! - A WebSocket relay that rewrites login and admin templates in flight
//! - A deny-list for privileged backend actions posted by the public
//! - Supervision of backend processes (spawn, readiness, termination)
//! - Arbitration of a limited pool of activation licenses

pub mod admin;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod license;
pub mod lifecycle;
pub mod markup;
pub mod model;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod rewrite;
pub mod state;
pub mod store;
pub mod websocket;
pub mod wire;
