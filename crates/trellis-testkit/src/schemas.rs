// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ready-made schema fixtures shared across the test suite.

use trellis_core::{
    Direction, EdgeDefInput, EdgeSortInput, FieldKind, IndexDefInput, IndexFieldInput,
    PropertyDefInput, PropertyType, RollupDefInput, RollupKindInput, SchemaInput, TypeDefInput,
};

fn prop(name: &str, ty: PropertyType) -> PropertyDefInput {
    PropertyDefInput {
        name: name.into(),
        ty,
    }
}

fn field(name: &str, direction: Direction) -> IndexFieldInput {
    IndexFieldInput {
        field: name.into(),
        direction,
        kind: FieldKind::Property,
    }
}

fn edge_field(name: &str) -> IndexFieldInput {
    IndexFieldInput {
        field: name.into(),
        direction: Direction::Asc,
        kind: FieldKind::Edge,
    }
}

/// `User { name: string, active: bool }` with an index on `active`.
#[must_use]
pub fn user_schema() -> SchemaInput {
    SchemaInput {
        types: vec![TypeDefInput {
            name: "User".into(),
            properties: vec![
                prop("name", PropertyType::String),
                prop("active", PropertyType::Bool),
            ],
            indexes: vec![IndexDefInput {
                fields: vec![field("active", Direction::Asc)],
            }],
            ..Default::default()
        }],
    }
}

/// Users and posts with a sorted `posts` edge, a `post_count` rollup, and
/// a `(published asc, views desc)` index on posts.
#[must_use]
pub fn forum_schema() -> SchemaInput {
    SchemaInput {
        types: vec![
            TypeDefInput {
                name: "User".into(),
                properties: vec![
                    prop("name", PropertyType::String),
                    prop("active", PropertyType::Bool),
                ],
                edges: vec![EdgeDefInput {
                    name: "posts".into(),
                    target: "Post".into(),
                    reverse: "author".into(),
                    sort: Some(EdgeSortInput {
                        property: "views".into(),
                        direction: Direction::Desc,
                    }),
                }],
                rollups: vec![RollupDefInput {
                    name: "post_count".into(),
                    kind: RollupKindInput::Count {
                        edge: "posts".into(),
                    },
                }],
                indexes: vec![IndexDefInput {
                    fields: vec![field("active", Direction::Asc)],
                }],
                ..Default::default()
            },
            TypeDefInput {
                name: "Post".into(),
                properties: vec![
                    prop("published", PropertyType::Bool),
                    prop("views", PropertyType::Int),
                ],
                edges: vec![EdgeDefInput {
                    name: "author".into(),
                    target: "User".into(),
                    reverse: "posts".into(),
                    sort: None,
                }],
                indexes: vec![IndexDefInput {
                    fields: vec![
                        field("published", Direction::Asc),
                        field("views", Direction::Desc),
                    ],
                }],
                ..Default::default()
            },
        ],
    }
}

/// Debugger-shaped fixture: threads own frames, frames own scopes, scopes
/// own variables; stacks carry a cross-entity `(thread, ts)` index.
#[must_use]
pub fn thread_schema() -> SchemaInput {
    SchemaInput {
        types: vec![
            TypeDefInput {
                name: "Thread".into(),
                properties: vec![prop("name", PropertyType::String)],
                edges: vec![EdgeDefInput {
                    name: "frames".into(),
                    target: "Frame".into(),
                    reverse: "thread".into(),
                    sort: Some(EdgeSortInput {
                        property: "ts".into(),
                        direction: Direction::Asc,
                    }),
                }],
                indexes: vec![IndexDefInput {
                    fields: vec![field("name", Direction::Asc)],
                }],
                ..Default::default()
            },
            TypeDefInput {
                name: "Frame".into(),
                properties: vec![prop("ts", PropertyType::Int)],
                edges: vec![
                    EdgeDefInput {
                        name: "thread".into(),
                        target: "Thread".into(),
                        reverse: "frames".into(),
                        sort: None,
                    },
                    EdgeDefInput {
                        name: "scopes".into(),
                        target: "Scope".into(),
                        reverse: "frame".into(),
                        sort: None,
                    },
                ],
                indexes: vec![IndexDefInput {
                    fields: vec![edge_field("thread"), field("ts", Direction::Asc)],
                }],
                ..Default::default()
            },
            TypeDefInput {
                name: "Scope".into(),
                properties: vec![prop("kind", PropertyType::String)],
                edges: vec![
                    EdgeDefInput {
                        name: "frame".into(),
                        target: "Frame".into(),
                        reverse: "scopes".into(),
                        sort: None,
                    },
                    EdgeDefInput {
                        name: "variables".into(),
                        target: "Variable".into(),
                        reverse: "scope".into(),
                        sort: None,
                    },
                ],
                ..Default::default()
            },
            TypeDefInput {
                name: "Variable".into(),
                properties: vec![
                    prop("name", PropertyType::String),
                    prop("value", PropertyType::String),
                ],
                edges: vec![EdgeDefInput {
                    name: "scope".into(),
                    target: "Scope".into(),
                    reverse: "variables".into(),
                    sort: None,
                }],
                ..Default::default()
            },
        ],
    }
}
