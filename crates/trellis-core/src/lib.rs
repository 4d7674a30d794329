// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! trellis-core: an in-memory, schema-driven reactive graph database.
//!
//! Clients declare a schema of node types, typed properties, bidirectional
//! edges, computed rollup fields, and composite indexes, then open live
//! views over declarative queries. A view is a windowed, tree-shaped
//! result that emits fine-grained events (*enter / leave / change /
//! move*) as the graph mutates; per-edge expansion state is first-class.
//!
//! The core is strictly single-threaded and synchronous: callbacks fire
//! inline, may re-enter the database, and are never batched.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod db;
mod event;
mod executor;
mod ident;
mod index;
mod key;
mod node;
mod plan;
mod query;
mod result_set;
mod rollup;
mod schema;
mod store;
mod tracker;
mod tree;
mod value;
mod view;
mod viewport;

// Re-exports for stable public API
/// Database facade, builder, and the raw handles.
pub use db::{Database, DatabaseBuilder, NodeWatch, Subscription};
/// Event payloads.
pub use event::{Item, NodeEvent, ViewEvent};
/// Core identifier types.
pub use ident::{EdgeId, IndexId, NodeId, TypeId};
/// Index plan coverage reporting and selection.
pub use plan::{select_index, IndexCoverage};
/// Composite key encoding.
pub use key::{CompoundKey, Direction, KeyWriter, DEFAULT_MAX_KEY_LEN};
/// Node snapshots.
pub use node::{Node, NodeRef};
/// Query input structures and the compiled AST.
pub use query::{
    EdgeSelInput, EdgeSelection, Filter, FilterInput, FilterOp, Query, QueryError, QueryInput,
    SortInput, SortSpec,
};
/// Result-set records (exposed for embedding layers building on the
/// callback surface).
pub use result_set::{ResultNode, ResultSet};
/// Rollup cache.
pub use rollup::RollupCache;
/// Schema input structures, resolution, and definitions.
pub use schema::{
    EdgeDef, EdgeDefInput, EdgeSort, EdgeSortInput, FieldKind, IndexDef, IndexDefInput,
    IndexField, IndexFieldInput, PropertyDef, PropertyDefInput, RollupDef, RollupDefInput,
    RollupKind, RollupKindInput, Schema, SchemaError, SchemaInput, TypeDef, TypeDefInput,
};
/// Node storage and its error taxonomy.
pub use store::{NodeStore, NodeStoreError};
/// The reactive tree and its structural events.
pub use tree::{ReactiveTree, TreeEvent};
/// Scalar values and property types.
pub use value::{PropertyType, Value};
/// Views over queries.
pub use view::{View, ViewItem, ViewOptions};
/// The sliding window over a visible chain.
pub use viewport::Viewport;
