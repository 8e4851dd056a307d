//! Common types and utilities for OpenLedger
//!
//! This crate provides shared types, traits, and utilities used across
//! all OpenLedger crates.
//!
//! # Modules
//!
//! - [`types`] - Shared domain types (UserId, Side, Instrument, etc.)
//! - [`command`] - Command ingress and answer message types

pub mod command;
pub mod types;

pub use command::{
    AnswerSink, CommandAnswer, CommandBody, CommandEnvelope, DeadLetterSink,
};
pub use types::*;
