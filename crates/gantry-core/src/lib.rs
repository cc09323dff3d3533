//! # Gantry Core
//!
//! Core library for the Gantry pluggable API gateway.
//!
//! Gantry sits in front of one or more upstream HTTP backends,
//! authenticates requests against heterogeneous credential schemes,
//! enforces smoothed per-IP and per-key rate limits, runs a pipeline of
//! extensions that may inspect or rewrite traffic, and proxies whatever
//! survives. This crate provides:
//!
//! - **[`gateway`]**: the staged request handler
//!   (auth -> post-auth -> quota -> pre-upstream -> proxy -> post-upstream
//!   -> respond -> log) and the builder assembling it from configuration.
//!
//! - **[`plugin`]**: the extension contract: capability traits, the
//!   registry with factory-based construction, and the per-stage pipeline.
//!
//! - **[`auth`]**: credential resolution with detect / backend lookup /
//!   validate and rate-store caching.
//!
//! - **[`quota`]**: exponentially weighted moving-average quota
//!   enforcement per IP and per key.
//!
//! - **[`proxy`]**: the upstream reverse proxy with hop-by-hop hygiene.
//!
//! - **[`store`]**: the shared rate store (Redis in production, in-memory
//!   for tests) holding counters, cached credentials and portal codes.
//!
//! - **[`mail`]**: transactional mail and cooldown-gated alerting.
//!
//! - **[`plugins`]**: the built-in extensions (`hmac`, `memory`,
//!   `log-tracing`).
//!
//! ## Request flow
//!
//! ```text
//! Client Request
//!       |
//!       v
//! +-----------------+     detect/validate      +-----------------+
//! |  Authenticator  | <----------------------> | Auth extensions |
//! +--------+--------+      get_key             | Backends        |
//!          |                                   +-----------------+
//!          v
//! +-----------------+     EWMA (atomic)        +-----------------+
//! |  QuotaEnforcer  | <----------------------> |   Rate store    |
//! +--------+--------+                          +-----------------+
//!          |
//!          v
//! +-----------------+
//! |  UpstreamProxy  | ---> upstream backend
//! +--------+--------+
//!          |
//!          v
//!   Response to client ---> logging extensions (post-response)
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mail;
pub mod plugin;
pub mod plugins;
pub mod proxy;
pub mod quota;
pub mod store;
pub mod types;
pub mod util;
