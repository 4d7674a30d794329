// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test fixtures and helpers for Trellis crates.
#![forbid(unsafe_code)]
//!
//! This crate provides commonly used test utilities to reduce duplication
//! across the Trellis test suite:
//!
//! - [`schemas`] - Ready-made schema fixtures (users, posts, threads)
//! - [`recorder`] - View/node event recorders with assertion helpers
//! - [`rng`] - Tiny deterministic PRNG so tests don't need `rand`

pub mod recorder;
pub mod rng;
pub mod schemas;

pub use recorder::{EventRecorder, NodeEventRecorder, RecordedEvent};
pub use rng::XorShift64;
pub use schemas::{forum_schema, thread_schema, user_schema};
