//! # taskstream
//!
//! Reliable task distribution over a durable, ordered log.
//!
//! Producers append tasks to a stream ([`queue`]). A consumer-group
//! dispatcher claims entries and hands each to one worker of a bounded pool
//! ([`engine`]), which runs the task's handler ([`handler`]) and
//! acknowledges the entry. Every lifecycle transition is fanned out to
//! observers ([`broadcast`]). The log and the channels live behind the
//! [`broker::Broker`] seam: Postgres for production, in-memory for tests.

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod model;
pub mod queue;
pub mod server;
pub mod telemetry;
