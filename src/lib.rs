//! rbacscan: client-side session and scan-workflow controller for an RBAC
//! scanning service.
//!
//! The controller owns the bearer credential, gates protected pages, drives
//! the cluster -> scan -> report flow and the administrator's optimistic
//! edits. Every component shares one [`session::Session`] context; a
//! credential change invalidates everything that depended on the old one.
//!
//! `server` is an in-memory backend implementing the same REST surface, used
//! by the end-to-end tests and for local demos.

pub mod admin;
pub mod analyze;
pub mod app;
pub mod clusters;
pub mod config;
pub mod credential;
pub mod error;
pub mod http;
pub mod logging;
pub mod models;
pub mod profile;
pub mod render;
// Development backend: axum router, auth middleware, fixture analyser
pub mod server;
pub mod session;
pub mod storage;
pub mod workflow;

#[cfg(test)]
mod test_support;
