//! Steerqueue — durable job queue and session steering engine.

pub mod classify;
pub mod config;
pub mod deliver;
pub mod engine;
pub mod error;
pub mod gate;
pub mod monitor;
pub mod plan;
pub mod queue;
pub mod runner;
pub mod session;
pub mod store;
