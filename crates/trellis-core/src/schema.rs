// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Schema input structures, resolution, and validation.
//!
//! The core accepts already-parsed input (`SchemaInput` and friends) and
//! resolves it into a [`Schema`]: dense [`TypeId`]/[`EdgeId`]/[`IndexId`]
//! assignment, reverse-edge validation, and the derived dependency tables
//! the mutation path consults (which indexes a property touches, which
//! rollups an edge feeds, which edge sorts a property drives).
//!
//! Resolution is all-or-nothing: any validation failure returns a
//! [`SchemaError`] and no `Schema` is produced.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ident::{EdgeId, IndexId, TypeId};
use crate::key::Direction;
use crate::value::PropertyType;

// ============================================================================
// Input structures
// ============================================================================

/// Whether an index field refers to a property or to an edge.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FieldKind {
    /// A scalar property (or rollup) of the indexed type.
    #[default]
    Property,
    /// An edge of the indexed type linking to a parent entity. The key
    /// component is the parent's node id, which is what makes cross-entity
    /// indexes ("all stacks of thread X by timestamp") scannable by prefix.
    Edge,
}

/// Unresolved schema: the shape the embedding layer hands over.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchemaInput {
    /// Type definitions, in declaration order.
    pub types: Vec<TypeDefInput>,
}

/// Unresolved node type definition.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TypeDefInput {
    /// Type name, unique within the schema.
    pub name: String,
    /// Scalar properties.
    #[cfg_attr(feature = "serde", serde(default))]
    pub properties: Vec<PropertyDefInput>,
    /// Edges to other types (or this one).
    #[cfg_attr(feature = "serde", serde(default))]
    pub edges: Vec<EdgeDefInput>,
    /// Computed rollup fields.
    #[cfg_attr(feature = "serde", serde(default))]
    pub rollups: Vec<RollupDefInput>,
    /// Composite indexes over properties, rollups, and edges.
    #[cfg_attr(feature = "serde", serde(default))]
    pub indexes: Vec<IndexDefInput>,
}

/// Unresolved property definition.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PropertyDefInput {
    /// Property name, unique within its type.
    pub name: String,
    /// Declared value type.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub ty: PropertyType,
}

/// Unresolved edge definition.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EdgeDefInput {
    /// Edge name, unique within its type.
    pub name: String,
    /// Target type name.
    pub target: String,
    /// Name of the matching reverse edge on the target type.
    pub reverse: String,
    /// Optional ordering of the edge's target list.
    #[cfg_attr(feature = "serde", serde(default))]
    pub sort: Option<EdgeSortInput>,
}

/// Declared ordering of an edge's target list.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EdgeSortInput {
    /// Property on the target type that orders the list.
    pub property: String,
    /// Sort direction.
    #[cfg_attr(feature = "serde", serde(default))]
    pub direction: Direction,
}

/// Unresolved rollup definition.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RollupDefInput {
    /// Rollup name, unique within its type (shares the property namespace).
    pub name: String,
    /// What the rollup computes.
    pub kind: RollupKindInput,
}

/// Unresolved rollup kind.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RollupKindInput {
    /// Cardinality of the edge's target list.
    Count {
        /// Edge whose targets are counted.
        edge: String,
    },
    /// Value of `property` on the first target in the edge's declared order.
    Traverse {
        /// Edge to traverse.
        edge: String,
        /// Property read from the first target.
        property: String,
    },
    /// Value of `property` on the target highest under the edge's sort.
    First {
        /// Edge to inspect.
        edge: String,
        /// Property read from the chosen target.
        property: String,
    },
    /// Value of `property` on the target lowest under the edge's sort.
    Last {
        /// Edge to inspect.
        edge: String,
        /// Property read from the chosen target.
        property: String,
    },
}

/// Unresolved index definition.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexDefInput {
    /// Ordered key fields.
    pub fields: Vec<IndexFieldInput>,
}

/// Unresolved index field.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexFieldInput {
    /// Property, rollup, or edge name, depending on `kind`.
    pub field: String,
    /// Sort direction of this component.
    #[cfg_attr(feature = "serde", serde(default))]
    pub direction: Direction,
    /// Whether `field` names a property/rollup or an edge.
    #[cfg_attr(feature = "serde", serde(default))]
    pub kind: FieldKind,
}

// ============================================================================
// Errors
// ============================================================================

/// Schema resolution failures. Nothing is mutated when one is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// Two types share a name.
    #[error("duplicate type name: {0}")]
    DuplicateTypeName(String),
    /// A property, edge, or rollup name is declared twice on one type.
    #[error("duplicate field name on type {type_name}: {field}")]
    DuplicateFieldName {
        /// Owning type.
        type_name: String,
        /// Offending member name.
        field: String,
    },
    /// An edge targets a type that does not exist.
    #[error("edge {type_name}.{edge} targets unknown type {target}")]
    UnknownType {
        /// Owning type.
        type_name: String,
        /// Offending edge.
        edge: String,
        /// Missing target type name.
        target: String,
    },
    /// An edge's declared reverse is absent (or points elsewhere) on the
    /// target type.
    #[error("edge {type_name}.{edge} has no matching reverse edge {reverse} on {target}")]
    MissingReverseEdge {
        /// Owning type.
        type_name: String,
        /// Forward edge name.
        edge: String,
        /// Target type name.
        target: String,
        /// Expected reverse edge name.
        reverse: String,
    },
    /// A sort, rollup, or index referenced a property that does not exist.
    #[error("unknown property {property} referenced by {type_name}")]
    UnknownProperty {
        /// Type whose member referenced the property.
        type_name: String,
        /// Missing property name.
        property: String,
    },
    /// A rollup or index referenced an edge that does not exist.
    #[error("unknown edge {edge} referenced by {type_name}")]
    UnknownEdge {
        /// Type whose member referenced the edge.
        type_name: String,
        /// Missing edge name.
        edge: String,
    },
    /// An index field's kind does not match what its name resolves to
    /// (a property-kind field naming an edge, or vice versa).
    #[error("index field {field} on {type_name} resolves to the wrong kind")]
    InvalidPropertyType {
        /// Owning type.
        type_name: String,
        /// Offending field name.
        field: String,
    },
}

// ============================================================================
// Resolved schema
// ============================================================================

/// Resolved property definition.
#[derive(Clone, Debug)]
pub struct PropertyDef {
    /// Property name.
    pub name: String,
    /// Declared value type.
    pub ty: PropertyType,
}

/// Resolved ordering of an edge's target list.
#[derive(Clone, Debug)]
pub struct EdgeSort {
    /// Property on the target type.
    pub property: String,
    /// Sort direction.
    pub direction: Direction,
}

/// Resolved edge definition.
#[derive(Clone, Debug)]
pub struct EdgeDef {
    /// Edge name (unique within the source type).
    pub name: String,
    /// Source type.
    pub source: TypeId,
    /// Target type.
    pub target: TypeId,
    /// The matching reverse edge on the target type.
    pub reverse: EdgeId,
    /// Declared target-list ordering, if any.
    pub sort: Option<EdgeSort>,
}

/// Resolved rollup kind with dense edge ids.
#[derive(Clone, Debug)]
pub enum RollupKind {
    /// Cardinality of the edge's target list.
    Count {
        /// Edge whose targets are counted.
        edge: EdgeId,
    },
    /// `property` on the first target in declared order.
    Traverse {
        /// Edge to traverse.
        edge: EdgeId,
        /// Property read from the first target.
        property: String,
    },
    /// `property` on the target highest under the edge's sort.
    First {
        /// Edge to inspect.
        edge: EdgeId,
        /// Property read from the chosen target.
        property: String,
    },
    /// `property` on the target lowest under the edge's sort.
    Last {
        /// Edge to inspect.
        edge: EdgeId,
        /// Property read from the chosen target.
        property: String,
    },
}

impl RollupKind {
    /// The edge this rollup observes.
    #[must_use]
    pub const fn edge(&self) -> EdgeId {
        match self {
            Self::Count { edge }
            | Self::Traverse { edge, .. }
            | Self::First { edge, .. }
            | Self::Last { edge, .. } => *edge,
        }
    }

    /// The target-side input property, if the kind reads one.
    #[must_use]
    pub fn input_property(&self) -> Option<&str> {
        match self {
            Self::Count { .. } => None,
            Self::Traverse { property, .. }
            | Self::First { property, .. }
            | Self::Last { property, .. } => Some(property),
        }
    }
}

/// Resolved rollup definition.
#[derive(Clone, Debug)]
pub struct RollupDef {
    /// Rollup name.
    pub name: String,
    /// What it computes.
    pub kind: RollupKind,
}

/// Resolved index field.
#[derive(Clone, Debug)]
pub enum IndexField {
    /// A scalar property or rollup of the indexed type.
    Property {
        /// Property (or rollup) name.
        name: String,
        /// Sort direction.
        direction: Direction,
    },
    /// An edge of the indexed type; the key component is the first target's
    /// node id.
    Edge {
        /// The edge on the indexed type.
        edge: EdgeId,
        /// Edge name (kept for filter matching).
        name: String,
        /// Sort direction.
        direction: Direction,
    },
}

impl IndexField {
    /// The field's sort direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Property { direction, .. } | Self::Edge { direction, .. } => *direction,
        }
    }

    /// The name a query filter or sort would use to address this field.
    #[must_use]
    pub fn field_name(&self) -> &str {
        match self {
            Self::Property { name, .. } | Self::Edge { name, .. } => name,
        }
    }
}

/// Resolved index definition.
#[derive(Clone, Debug)]
pub struct IndexDef {
    /// Dense id within the schema's global index table.
    pub id: IndexId,
    /// The indexed type.
    pub owner: TypeId,
    /// Ordered key fields.
    pub fields: Vec<IndexField>,
}

/// Resolved node type definition.
#[derive(Debug)]
pub struct TypeDef {
    /// Type name.
    pub name: String,
    /// Dense id.
    pub id: TypeId,
    /// Properties in declaration order.
    pub properties: Vec<PropertyDef>,
    prop_by_name: FxHashMap<String, usize>,
    /// Edges declared on this type.
    pub edges: Vec<EdgeId>,
    edge_by_name: FxHashMap<String, EdgeId>,
    /// Rollups in declaration order.
    pub rollups: Vec<RollupDef>,
    rollup_by_name: FxHashMap<String, usize>,
    /// Indexes declared on this type.
    pub indexes: Vec<IndexId>,
    /// Property/rollup name → indexes whose key contains it.
    indexes_by_field: FxHashMap<String, Vec<IndexId>>,
}

impl TypeDef {
    /// Looks up a declared property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.prop_by_name.get(name).map(|&i| &self.properties[i])
    }

    /// Looks up an edge by name.
    #[must_use]
    pub fn edge_id(&self, name: &str) -> Option<EdgeId> {
        self.edge_by_name.get(name).copied()
    }

    /// Looks up a rollup by name.
    #[must_use]
    pub fn rollup(&self, name: &str) -> Option<&RollupDef> {
        self.rollup_by_name.get(name).map(|&i| &self.rollups[i])
    }

    /// Position of a rollup in declaration order.
    #[must_use]
    pub fn rollup_index(&self, name: &str) -> Option<usize> {
        self.rollup_by_name.get(name).copied()
    }

    /// Indexes whose key involves the named property or rollup.
    #[must_use]
    pub fn indexes_touching(&self, field: &str) -> &[IndexId] {
        self.indexes_by_field.get(field).map_or(&[], Vec::as_slice)
    }

    /// Returns `true` if `name` is a declared property or rollup.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.prop_by_name.contains_key(name) || self.rollup_by_name.contains_key(name)
    }
}

/// Dependency of a rollup on a target-side property: when a node of the
/// target type changes that property, the rollup must be recomputed on
/// every owner reachable through `via_reverse`.
#[derive(Clone, Copy, Debug)]
pub struct RollupPropDep {
    /// Reverse edge from the changed node back to the rollup owners.
    pub via_reverse: EdgeId,
    /// Type owning the rollup.
    pub owner: TypeId,
    /// Rollup position on the owner type.
    pub rollup: usize,
}

/// A fully resolved, immutable schema.
#[derive(Debug)]
pub struct Schema {
    types: Vec<TypeDef>,
    type_by_name: FxHashMap<String, TypeId>,
    edges: Vec<EdgeDef>,
    indexes: Vec<IndexDef>,
    /// Per edge id: indexes whose key contains an `Edge` field on that edge.
    indexes_by_edge: Vec<Vec<IndexId>>,
    /// Per edge id: rollups on the edge's source type that observe it,
    /// as positions into the source type's rollup table.
    rollups_by_edge: Vec<Vec<usize>>,
    /// (target type, property) → rollups to recompute on linked owners.
    rollup_prop_deps: FxHashMap<(TypeId, String), Vec<RollupPropDep>>,
    /// (target type, property) → edges whose declared sort reads it.
    edge_sort_deps: FxHashMap<(TypeId, String), Vec<EdgeId>>,
}

impl Schema {
    /// Resolves an input schema, validating every cross-reference.
    pub fn resolve(input: &SchemaInput) -> Result<Self, SchemaError> {
        Resolver::new(input).run()
    }

    /// Looks up a type by name.
    #[must_use]
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.type_by_name.get(name).copied()
    }

    /// Returns the definition of a type.
    #[must_use]
    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id.index()]
    }

    /// All types, in declaration order.
    #[must_use]
    pub fn types(&self) -> &[TypeDef] {
        &self.types
    }

    /// Returns the definition of an edge.
    #[must_use]
    pub fn edge(&self, id: EdgeId) -> &EdgeDef {
        &self.edges[id.index()]
    }

    /// Returns the definition of an index.
    #[must_use]
    pub fn index(&self, id: IndexId) -> &IndexDef {
        &self.indexes[id.index()]
    }

    /// Total number of index definitions across all types.
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    /// Indexes whose key contains an `Edge` field on `edge`.
    #[must_use]
    pub fn indexes_keyed_by_edge(&self, edge: EdgeId) -> &[IndexId] {
        &self.indexes_by_edge[edge.index()]
    }

    /// Rollups on the edge's source type that observe `edge`, as positions
    /// into that type's rollup table.
    #[must_use]
    pub fn rollups_over_edge(&self, edge: EdgeId) -> &[usize] {
        &self.rollups_by_edge[edge.index()]
    }

    /// Rollups to recompute when a node of `ty` changes `property`.
    #[must_use]
    pub fn rollup_prop_deps(&self, ty: TypeId, property: &str) -> &[RollupPropDep] {
        self.rollup_prop_deps
            .get(&(ty, property.to_owned()))
            .map_or(&[], Vec::as_slice)
    }

    /// Edges whose declared sort reads `property` on targets of type `ty`.
    #[must_use]
    pub fn edge_sort_deps(&self, ty: TypeId, property: &str) -> &[EdgeId] {
        self.edge_sort_deps
            .get(&(ty, property.to_owned()))
            .map_or(&[], Vec::as_slice)
    }
}

// ============================================================================
// Resolution
// ============================================================================

struct Resolver<'a> {
    input: &'a SchemaInput,
    type_by_name: FxHashMap<String, TypeId>,
    /// (type, edge name) → dense edge id, assigned in declaration order.
    edge_ids: FxHashMap<(TypeId, String), EdgeId>,
}

impl<'a> Resolver<'a> {
    fn new(input: &'a SchemaInput) -> Self {
        Self {
            input,
            type_by_name: FxHashMap::default(),
            edge_ids: FxHashMap::default(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn run(mut self) -> Result<Schema, SchemaError> {
        // Pass 1: type names and dense ids.
        for (i, ty) in self.input.types.iter().enumerate() {
            let id = TypeId::new(i as u32);
            if self.type_by_name.insert(ty.name.clone(), id).is_some() {
                return Err(SchemaError::DuplicateTypeName(ty.name.clone()));
            }
        }

        // Pass 2: member-name uniqueness and dense edge ids.
        let mut next_edge = 0_u32;
        for ty in &self.input.types {
            let tid = self.type_by_name[&ty.name];
            let mut seen: FxHashMap<&str, ()> = FxHashMap::default();
            let names = ty
                .properties
                .iter()
                .map(|p| p.name.as_str())
                .chain(ty.edges.iter().map(|e| e.name.as_str()))
                .chain(ty.rollups.iter().map(|r| r.name.as_str()));
            for name in names {
                if seen.insert(name, ()).is_some() {
                    return Err(SchemaError::DuplicateFieldName {
                        type_name: ty.name.clone(),
                        field: name.to_owned(),
                    });
                }
            }
            for edge in &ty.edges {
                self.edge_ids
                    .insert((tid, edge.name.clone()), EdgeId::new(next_edge));
                next_edge += 1;
            }
        }

        // Pass 3: edge targets, reverses, and sorts.
        let mut edges: Vec<EdgeDef> = Vec::new();
        for ty in &self.input.types {
            let tid = self.type_by_name[&ty.name];
            for edge in &ty.edges {
                let target =
                    self.type_by_name
                        .get(&edge.target)
                        .copied()
                        .ok_or_else(|| SchemaError::UnknownType {
                            type_name: ty.name.clone(),
                            edge: edge.name.clone(),
                            target: edge.target.clone(),
                        })?;
                let reverse = self
                    .edge_ids
                    .get(&(target, edge.reverse.clone()))
                    .copied()
                    .filter(|rev| {
                        // The reverse must point back at this type.
                        let rev_def = &self.input.types[target.index()].edges[{
                            // Position of the reverse edge within its type.
                            let base = self.edge_base(target);
                            rev.index() - base
                        }];
                        self.type_by_name.get(&rev_def.target) == Some(&tid)
                    })
                    .ok_or_else(|| SchemaError::MissingReverseEdge {
                        type_name: ty.name.clone(),
                        edge: edge.name.clone(),
                        target: edge.target.clone(),
                        reverse: edge.reverse.clone(),
                    })?;
                let sort = edge
                    .sort
                    .as_ref()
                    .map(|s| {
                        let target_ty = &self.input.types[target.index()];
                        if target_ty.properties.iter().any(|p| p.name == s.property) {
                            Ok(EdgeSort {
                                property: s.property.clone(),
                                direction: s.direction,
                            })
                        } else {
                            Err(SchemaError::UnknownProperty {
                                type_name: edge.target.clone(),
                                property: s.property.clone(),
                            })
                        }
                    })
                    .transpose()?;
                edges.push(EdgeDef {
                    name: edge.name.clone(),
                    source: tid,
                    target,
                    reverse,
                    sort,
                });
            }
        }

        // Pass 4: rollups and indexes, then assemble type defs.
        let mut types: Vec<TypeDef> = Vec::new();
        let mut indexes: Vec<IndexDef> = Vec::new();
        for ty in &self.input.types {
            let tid = self.type_by_name[&ty.name];
            let mut rollups = Vec::new();
            for rollup in &ty.rollups {
                rollups.push(RollupDef {
                    name: rollup.name.clone(),
                    kind: self.resolve_rollup_kind(ty, tid, rollup, &edges)?,
                });
            }

            let mut index_ids = Vec::new();
            let mut indexes_by_field: FxHashMap<String, Vec<IndexId>> = FxHashMap::default();
            for index in &ty.indexes {
                let id = IndexId::new(indexes.len() as u32);
                let mut fields = Vec::new();
                for field in &index.fields {
                    fields.push(self.resolve_index_field(ty, tid, field, &rollups)?);
                }
                for field in &fields {
                    if let IndexField::Property { name, .. } = field {
                        indexes_by_field.entry(name.clone()).or_default().push(id);
                    }
                }
                indexes.push(IndexDef {
                    id,
                    owner: tid,
                    fields,
                });
                index_ids.push(id);
            }

            types.push(TypeDef {
                name: ty.name.clone(),
                id: tid,
                prop_by_name: ty
                    .properties
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (p.name.clone(), i))
                    .collect(),
                properties: ty
                    .properties
                    .iter()
                    .map(|p| PropertyDef {
                        name: p.name.clone(),
                        ty: p.ty,
                    })
                    .collect(),
                edges: ty
                    .edges
                    .iter()
                    .map(|e| self.edge_ids[&(tid, e.name.clone())])
                    .collect(),
                edge_by_name: ty
                    .edges
                    .iter()
                    .map(|e| (e.name.clone(), self.edge_ids[&(tid, e.name.clone())]))
                    .collect(),
                rollup_by_name: rollups
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (r.name.clone(), i))
                    .collect(),
                rollups,
                indexes: index_ids,
                indexes_by_field,
            });
        }

        // Pass 5: derived dependency tables.
        let mut indexes_by_edge: Vec<Vec<IndexId>> = vec![Vec::new(); edges.len()];
        for index in &indexes {
            for field in &index.fields {
                if let IndexField::Edge { edge, .. } = field {
                    indexes_by_edge[edge.index()].push(index.id);
                }
            }
        }

        let mut rollups_by_edge: Vec<Vec<usize>> = vec![Vec::new(); edges.len()];
        let mut rollup_prop_deps: FxHashMap<(TypeId, String), Vec<RollupPropDep>> =
            FxHashMap::default();
        for ty in &types {
            for (pos, rollup) in ty.rollups.iter().enumerate() {
                let edge = rollup.kind.edge();
                rollups_by_edge[edge.index()].push(pos);
                if let Some(prop) = rollup.kind.input_property() {
                    let target = edges[edge.index()].target;
                    rollup_prop_deps
                        .entry((target, prop.to_owned()))
                        .or_default()
                        .push(RollupPropDep {
                            via_reverse: edges[edge.index()].reverse,
                            owner: ty.id,
                            rollup: pos,
                        });
                }
            }
        }

        let mut edge_sort_deps: FxHashMap<(TypeId, String), Vec<EdgeId>> = FxHashMap::default();
        for (i, edge) in edges.iter().enumerate() {
            if let Some(sort) = &edge.sort {
                edge_sort_deps
                    .entry((edge.target, sort.property.clone()))
                    .or_default()
                    .push(EdgeId::new(i as u32));
            }
        }

        Ok(Schema {
            types,
            type_by_name: self.type_by_name,
            edges,
            indexes,
            indexes_by_edge,
            rollups_by_edge,
            rollup_prop_deps,
            edge_sort_deps,
        })
    }

    /// First dense edge id belonging to `ty` (edges are numbered in type
    /// declaration order, then edge declaration order).
    fn edge_base(&self, ty: TypeId) -> usize {
        self.input.types[..ty.index()]
            .iter()
            .map(|t| t.edges.len())
            .sum()
    }

    fn resolve_rollup_kind(
        &self,
        ty: &TypeDefInput,
        tid: TypeId,
        rollup: &RollupDefInput,
        edges: &[EdgeDef],
    ) -> Result<RollupKind, SchemaError> {
        let resolve_edge = |name: &str| {
            self.edge_ids
                .get(&(tid, name.to_owned()))
                .copied()
                .ok_or_else(|| SchemaError::UnknownEdge {
                    type_name: ty.name.clone(),
                    edge: name.to_owned(),
                })
        };
        let check_property = |edge: EdgeId, property: &str| {
            let target = edges[edge.index()].target;
            if self.input.types[target.index()]
                .properties
                .iter()
                .any(|p| p.name == property)
            {
                Ok(())
            } else {
                Err(SchemaError::UnknownProperty {
                    type_name: self.input.types[target.index()].name.clone(),
                    property: property.to_owned(),
                })
            }
        };
        Ok(match &rollup.kind {
            RollupKindInput::Count { edge } => RollupKind::Count {
                edge: resolve_edge(edge)?,
            },
            RollupKindInput::Traverse { edge, property } => {
                let edge = resolve_edge(edge)?;
                check_property(edge, property)?;
                RollupKind::Traverse {
                    edge,
                    property: property.clone(),
                }
            }
            RollupKindInput::First { edge, property } => {
                let edge = resolve_edge(edge)?;
                check_property(edge, property)?;
                RollupKind::First {
                    edge,
                    property: property.clone(),
                }
            }
            RollupKindInput::Last { edge, property } => {
                let edge = resolve_edge(edge)?;
                check_property(edge, property)?;
                RollupKind::Last {
                    edge,
                    property: property.clone(),
                }
            }
        })
    }

    fn resolve_index_field(
        &self,
        ty: &TypeDefInput,
        tid: TypeId,
        field: &IndexFieldInput,
        rollups: &[RollupDef],
    ) -> Result<IndexField, SchemaError> {
        let is_property = ty.properties.iter().any(|p| p.name == field.field)
            || rollups.iter().any(|r| r.name == field.field);
        let edge = self.edge_ids.get(&(tid, field.field.clone())).copied();
        match field.kind {
            FieldKind::Property => {
                if is_property {
                    Ok(IndexField::Property {
                        name: field.field.clone(),
                        direction: field.direction,
                    })
                } else if edge.is_some() {
                    Err(SchemaError::InvalidPropertyType {
                        type_name: ty.name.clone(),
                        field: field.field.clone(),
                    })
                } else {
                    Err(SchemaError::UnknownProperty {
                        type_name: ty.name.clone(),
                        property: field.field.clone(),
                    })
                }
            }
            FieldKind::Edge => match edge {
                Some(edge) => Ok(IndexField::Edge {
                    edge,
                    name: field.field.clone(),
                    direction: field.direction,
                }),
                None if is_property => Err(SchemaError::InvalidPropertyType {
                    type_name: ty.name.clone(),
                    field: field.field.clone(),
                }),
                None => Err(SchemaError::UnknownEdge {
                    type_name: ty.name.clone(),
                    edge: field.field.clone(),
                }),
            },
        }
    }
}
