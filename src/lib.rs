//! flowcheck - execution tracking for API test flows
//!
//! flowcheck stores API test flows drawn as node graphs, validates them into
//! a deterministic step order, and records every suite execution as a
//! suite → case → step hierarchy while an external worker runs the requests.
//! Clients follow an execution live over server-sent events.
//!
//! ## Key Features
//!
//! - **Validated flows**: cycles and references to steps that have not run yet are rejected on save
//! - **Environment snapshots**: each execution keeps the settings it started with, retries reuse them
//! - **Conditional transitions**: terminal records never change, whichever report arrives last
//! - **Live progress**: full snapshots on every change, heartbeats, and a bounded session
//!
//! ## Example
//!
//! ```yaml
//! nodes:
//!   - type: start
//!     id: start
//!   - type: api
//!     id: login
//!     data:
//!       apiId: auth.login
//!       method: POST
//!       url: /login
//!       responseExtract:
//!         - path: data.token
//!           variable: token
//!   - type: api
//!     id: profile
//!     data:
//!       apiId: users.me
//!       method: GET
//!       url: /me
//!       requestConfig:
//!         headers:
//!           Authorization:
//!             valueType: variable
//!             variable: login.response.data.token
//!             template: "Bearer {value}"
//!   - type: end
//!     id: end
//! edges:
//!   - { source: start, target: login }
//!   - { source: login, target: profile }
//!   - { source: profile, target: end }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod progress;
pub mod shutdown;
pub mod storage;
pub mod telemetry;

pub use error::{Error, Result};
