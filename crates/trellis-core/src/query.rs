// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Query input structures and the compiled query AST.
//!
//! A query names a root type, optional direct root id, filters, sorts, and
//! nested edge selections (possibly recursive, possibly virtual). The core
//! accepts already-parsed [`QueryInput`] and compiles it against a resolved
//! [`Schema`] into an immutable [`Query`] with dense ids; all name
//! resolution errors surface here, before anything subscribes.

use thiserror::Error;

use crate::ident::{EdgeId, NodeId, TypeId};
use crate::key::Direction;
use crate::schema::Schema;
use crate::value::Value;

/// Filter comparison operators.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FilterOp {
    /// Equal.
    #[default]
    Eq,
    /// Not equal.
    Neq,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Member of `values`.
    In,
}

impl FilterOp {
    /// Whether the operator describes a half-open range usable as an index
    /// scan bound.
    #[must_use]
    pub const fn is_range(self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }
}

/// Unresolved filter condition.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilterInput {
    /// Property, rollup, or edge name; may be a dotted path reaching
    /// through edges (`"author.name"`).
    pub field: String,
    /// Operator (defaults to equality).
    #[cfg_attr(feature = "serde", serde(default))]
    pub op: FilterOp,
    /// Comparison value for every operator except `in`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub value: Option<Value>,
    /// Member set for `in`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub values: Vec<Value>,
}

/// Unresolved sort specification.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SortInput {
    /// Property or rollup name.
    pub field: String,
    /// Direction.
    #[cfg_attr(feature = "serde", serde(default))]
    pub direction: Direction,
}

impl From<&str> for SortInput {
    /// Parses the compact form: a leading `-` means descending.
    fn from(s: &str) -> Self {
        s.strip_prefix('-').map_or_else(
            || Self {
                field: s.to_owned(),
                direction: Direction::Asc,
            },
            |rest| Self {
                field: rest.to_owned(),
                direction: Direction::Desc,
            },
        )
    }
}

/// Unresolved edge selection.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EdgeSelInput {
    /// Edge name on the parent level's type.
    pub edge: String,
    /// Recursive selection: with no nested selections it loops back to
    /// itself, yielding arbitrary-depth trees.
    #[cfg_attr(feature = "serde", serde(default))]
    pub recursive: bool,
    /// Virtual level: traversed, but its nodes are not emitted.
    #[cfg_attr(feature = "serde", serde(default, rename = "virtual"))]
    pub is_virtual: bool,
    /// Filters on this level's nodes.
    #[cfg_attr(feature = "serde", serde(default))]
    pub filter: Vec<FilterInput>,
    /// Sorts for this level's nodes.
    #[cfg_attr(feature = "serde", serde(default))]
    pub sort: Vec<SortInput>,
    /// Nested selections.
    #[cfg_attr(feature = "serde", serde(default))]
    pub edges: Vec<EdgeSelInput>,
}

/// Unresolved query: the shape the embedding layer hands over.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryInput {
    /// Root type name.
    pub root: String,
    /// Optional direct root id (bypasses index scanning).
    #[cfg_attr(feature = "serde", serde(default))]
    pub id: Option<NodeId>,
    /// Virtual root: the root is traversed but not emitted.
    #[cfg_attr(feature = "serde", serde(default, rename = "virtual"))]
    pub is_virtual: bool,
    /// Root-level filters.
    #[cfg_attr(feature = "serde", serde(default))]
    pub filter: Vec<FilterInput>,
    /// Root-level sorts.
    #[cfg_attr(feature = "serde", serde(default))]
    pub sort: Vec<SortInput>,
    /// Edge selections.
    #[cfg_attr(feature = "serde", serde(default))]
    pub edges: Vec<EdgeSelInput>,
}

/// Query compilation and execution failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The root type is not declared by the schema.
    #[error("unknown root type: {0}")]
    UnknownRootType(String),
    /// No index covers the requested sorts (unrecoverable: the core never
    /// sorts in memory).
    #[error("no index on {type_name} covers the requested filters and sorts")]
    NoIndexCovers {
        /// The queried type.
        type_name: String,
    },
    /// A filter referenced an unknown field or was malformed.
    #[error("invalid filter on field {field}")]
    InvalidFilter {
        /// Offending field path.
        field: String,
    },
    /// A sort referenced an unknown field.
    #[error("invalid sort on field {field}")]
    InvalidSort {
        /// Offending field.
        field: String,
    },
    /// A selection named an edge its level's type does not declare.
    #[error("unknown edge {edge} in selection on {type_name}")]
    UnknownEdgeInSelection {
        /// The level's type.
        type_name: String,
        /// Missing edge name.
        edge: String,
    },
}

/// One resolved hop of a path filter.
#[derive(Clone, Debug)]
pub struct PathHop {
    /// Edge walked (first target only).
    pub edge: EdgeId,
}

/// Resolved filter condition.
#[derive(Clone, Debug)]
pub struct Filter {
    /// Original field path, for diagnostics and index matching.
    pub field: String,
    /// Edge hops before the final field (empty for plain filters).
    pub path: Vec<PathHop>,
    /// Final property, rollup, or edge name.
    pub leaf: String,
    /// `true` when `leaf` names an edge (the comparison value is then a
    /// node id).
    pub leaf_is_edge: bool,
    /// Operator.
    pub op: FilterOp,
    /// Comparison value (`Null` when absent).
    pub value: Value,
    /// Member set for `in`.
    pub values: Vec<Value>,
}

/// Resolved sort specification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortSpec {
    /// Property or rollup name.
    pub field: String,
    /// Direction.
    pub direction: Direction,
}

/// Resolved edge selection.
#[derive(Clone, Debug)]
pub struct EdgeSelection {
    /// The selected edge.
    pub edge: EdgeId,
    /// The level's node type (the edge's target).
    pub target: TypeId,
    /// Recursive marker.
    pub recursive: bool,
    /// Virtual marker.
    pub is_virtual: bool,
    /// Level filters.
    pub filters: Vec<Filter>,
    /// Level sorts.
    pub sorts: Vec<SortSpec>,
    /// Nested selections.
    pub selections: Vec<EdgeSelection>,
}

impl EdgeSelection {
    /// The selections applied to this level's children. A recursive
    /// selection with no nested selections loops back to itself.
    #[must_use]
    pub fn child_selections(&self) -> &[EdgeSelection] {
        if self.recursive && self.selections.is_empty() {
            std::slice::from_ref(self)
        } else {
            &self.selections
        }
    }
}

/// An immutable compiled query.
#[derive(Clone, Debug)]
pub struct Query {
    /// Root type.
    pub root: TypeId,
    /// Optional direct root id.
    pub root_id: Option<NodeId>,
    /// Virtual root marker.
    pub is_virtual: bool,
    /// Root filters.
    pub filters: Vec<Filter>,
    /// Root sorts.
    pub sorts: Vec<SortSpec>,
    /// Edge selections.
    pub selections: Vec<EdgeSelection>,
}

impl Query {
    /// Compiles an input query against a resolved schema.
    pub fn compile(schema: &Schema, input: &QueryInput) -> Result<Self, QueryError> {
        let root = schema
            .type_id(&input.root)
            .ok_or_else(|| QueryError::UnknownRootType(input.root.clone()))?;
        Ok(Self {
            root,
            root_id: input.id,
            is_virtual: input.is_virtual,
            filters: compile_filters(schema, root, &input.filter)?,
            sorts: compile_sorts(schema, root, &input.sort)?,
            selections: compile_selections(schema, root, &input.edges)?,
        })
    }
}

fn compile_filters(
    schema: &Schema,
    ty: TypeId,
    inputs: &[FilterInput],
) -> Result<Vec<Filter>, QueryError> {
    inputs
        .iter()
        .map(|input| {
            let invalid = || QueryError::InvalidFilter {
                field: input.field.clone(),
            };
            let mut segments: Vec<&str> = input.field.split('.').collect();
            let leaf = segments.pop().ok_or_else(invalid)?;
            let mut cursor = ty;
            let mut path = Vec::new();
            for seg in segments {
                let edge = schema
                    .type_def(cursor)
                    .edge_id(seg)
                    .ok_or_else(invalid)?;
                path.push(PathHop { edge });
                cursor = schema.edge(edge).target;
            }
            let def = schema.type_def(cursor);
            let leaf_is_edge = def.edge_id(leaf).is_some();
            if !leaf_is_edge && !def.has_field(leaf) {
                return Err(invalid());
            }
            if input.op == FilterOp::In && input.values.is_empty() && input.value.is_none() {
                return Err(invalid());
            }
            Ok(Filter {
                field: input.field.clone(),
                path,
                leaf: leaf.to_owned(),
                leaf_is_edge,
                op: input.op,
                value: input.value.clone().unwrap_or(Value::Null),
                values: input.values.clone(),
            })
        })
        .collect()
}

fn compile_sorts(
    schema: &Schema,
    ty: TypeId,
    inputs: &[SortInput],
) -> Result<Vec<SortSpec>, QueryError> {
    inputs
        .iter()
        .map(|input| {
            if schema.type_def(ty).has_field(&input.field) {
                Ok(SortSpec {
                    field: input.field.clone(),
                    direction: input.direction,
                })
            } else {
                Err(QueryError::InvalidSort {
                    field: input.field.clone(),
                })
            }
        })
        .collect()
}

fn compile_selections(
    schema: &Schema,
    ty: TypeId,
    inputs: &[EdgeSelInput],
) -> Result<Vec<EdgeSelection>, QueryError> {
    inputs
        .iter()
        .map(|input| {
            let def = schema.type_def(ty);
            let edge = def
                .edge_id(&input.edge)
                .ok_or_else(|| QueryError::UnknownEdgeInSelection {
                    type_name: def.name.clone(),
                    edge: input.edge.clone(),
                })?;
            let target = schema.edge(edge).target;
            Ok(EdgeSelection {
                edge,
                target,
                recursive: input.recursive,
                is_virtual: input.is_virtual,
                filters: compile_filters(schema, target, &input.filter)?,
                sorts: compile_sorts(schema, target, &input.sort)?,
                selections: compile_selections(schema, target, &input.edges)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::schema::{
        EdgeDefInput, PropertyDefInput, SchemaInput, TypeDefInput,
    };
    use crate::value::PropertyType;

    fn schema() -> Schema {
        Schema::resolve(&SchemaInput {
            types: vec![
                TypeDefInput {
                    name: "User".into(),
                    properties: vec![
                        PropertyDefInput {
                            name: "name".into(),
                            ty: PropertyType::String,
                        },
                        PropertyDefInput {
                            name: "active".into(),
                            ty: PropertyType::Bool,
                        },
                    ],
                    edges: vec![EdgeDefInput {
                        name: "posts".into(),
                        target: "Post".into(),
                        reverse: "author".into(),
                        sort: None,
                    }],
                    ..Default::default()
                },
                TypeDefInput {
                    name: "Post".into(),
                    properties: vec![PropertyDefInput {
                        name: "views".into(),
                        ty: PropertyType::Int,
                    }],
                    edges: vec![EdgeDefInput {
                        name: "author".into(),
                        target: "User".into(),
                        reverse: "posts".into(),
                        sort: None,
                    }],
                    ..Default::default()
                },
            ],
        })
        .unwrap()
    }

    #[test]
    fn compiles_nested_selections_with_dense_ids() {
        let schema = schema();
        let query = Query::compile(
            &schema,
            &QueryInput {
                root: "User".into(),
                filter: vec![FilterInput {
                    field: "active".into(),
                    value: Some(Value::Bool(true)),
                    ..Default::default()
                }],
                sort: vec![SortInput::from("-name")],
                edges: vec![EdgeSelInput {
                    edge: "posts".into(),
                    sort: vec![SortInput::from("views")],
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(query.root, schema.type_id("User").unwrap());
        assert_eq!(query.sorts[0].direction, Direction::Desc);
        assert_eq!(query.selections.len(), 1);
        assert_eq!(
            query.selections[0].target,
            schema.type_id("Post").unwrap()
        );
    }

    #[test]
    fn path_filters_resolve_edge_hops() {
        let schema = schema();
        let query = Query::compile(
            &schema,
            &QueryInput {
                root: "Post".into(),
                filter: vec![FilterInput {
                    field: "author.active".into(),
                    value: Some(Value::Bool(true)),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(query.filters[0].path.len(), 1);
        assert_eq!(query.filters[0].leaf, "active");
    }

    #[test]
    fn recursive_selection_loops_back_to_itself() {
        let schema = Schema::resolve(&SchemaInput {
            types: vec![TypeDefInput {
                name: "Dir".into(),
                edges: vec![
                    EdgeDefInput {
                        name: "children".into(),
                        target: "Dir".into(),
                        reverse: "parent".into(),
                        sort: None,
                    },
                    EdgeDefInput {
                        name: "parent".into(),
                        target: "Dir".into(),
                        reverse: "children".into(),
                        sort: None,
                    },
                ],
                ..Default::default()
            }],
        })
        .unwrap();
        let query = Query::compile(
            &schema,
            &QueryInput {
                root: "Dir".into(),
                edges: vec![EdgeSelInput {
                    edge: "children".into(),
                    recursive: true,
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .unwrap();
        let sel = &query.selections[0];
        let children = sel.child_selections();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].edge, sel.edge);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let schema = schema();
        assert!(matches!(
            Query::compile(
                &schema,
                &QueryInput {
                    root: "Ghost".into(),
                    ..Default::default()
                }
            ),
            Err(QueryError::UnknownRootType(_))
        ));
        assert!(matches!(
            Query::compile(
                &schema,
                &QueryInput {
                    root: "User".into(),
                    filter: vec![FilterInput {
                        field: "ghost".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }
            ),
            Err(QueryError::InvalidFilter { .. })
        ));
        assert!(matches!(
            Query::compile(
                &schema,
                &QueryInput {
                    root: "User".into(),
                    edges: vec![EdgeSelInput {
                        edge: "ghost".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }
            ),
            Err(QueryError::UnknownEdgeInSelection { .. })
        ));
    }
}
