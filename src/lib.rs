// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some handlers are inherently long
#![allow(clippy::too_many_lines)]
// Documentation style: many domain terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in counter/timestamp code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

//! Spire - pub/sub broker and gateway for a fleet of pylon devices.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Environment-based configuration
//! - `core::runtime` - Runtime orchestration (wiring + listeners)
//! - `core::telemetry` - Tracing initialization
//!
//! ## Broker
//! - `broker` - Subscriber registry, publish fan-out, control session loop
//! - `broker::session` - One connected MQTT peer with idle deadlines
//! - `broker::subscriber` - Session / in-process handler subscriber variants
//! - `broker::topic` - Wildcard matching and topic parsing
//! - `broker::message` - Payload variants and internal lifecycle events
//!
//! ## Devices
//! - `gateway` - Device-facing session loop (connect/disconnect lifecycle)
//! - `store` - Formation/device state store
//! - `handlers` - Telemetry handlers (ota, ping, up, stations, sentry, ...)
//!
//! ## Edges
//! - `net` - TCP accept loops
//! - `external` - Liberator metadata client, audit sink, crash reporter
//!
//! ## CLI
//! - `cli` - clap argument definitions and command runners

pub mod core;

pub mod broker;
pub mod net;

pub mod gateway;
pub mod handlers;
pub mod store;

pub mod external;

pub mod cli;

// Re-exports for convenience
pub use self::core::{config, runtime, telemetry};
pub use broker::{Broker, Message, Session, Subscriber};
pub use store::FormationStore;
