//! Host telemetry sensor for Linux kernel trace events.
//!
//! The sensor subscribes to kernel trace events through the perf_event
//! subsystem, decodes raw sample payloads against schemas discovered in
//! tracefs, enriches events with process and container context, and
//! delivers matching events to concurrent subscribers over bounded
//! channels.
//!
//! The two core subsystems are the decoder registry
//! ([`decode::registry::DecoderRegistry`]), a read-optimized concurrent map
//! from kernel event ids to schema-driven decoders, and the dispatch core
//! ([`sensor::Sensor`]), which owns subscription lifecycles, event
//! stamping, and the fan-out from the monitor callback to subscriber
//! channels. The perf ring-buffer reader itself is external and drives
//! [`sensor::Sensor::dispatch`] through the [`monitor::EventMonitor`]
//! boundary.

pub mod config;
pub mod decode;
pub mod events;
pub mod filter;
pub mod monitor;
pub mod mounts;
pub mod process;
pub mod schema;
pub mod sensor;
