// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Index plan selection.
//!
//! Given a query's root type, filters, and sorts, every index of the type
//! is scored and the best coverage wins:
//!
//! 1. consecutive leading equality filters covered (weighted highest),
//! 2. whether the next field serves a range filter,
//! 3. how many requested sort fields follow in matching direction —
//!    opposite direction counts only when the *entire* requested suffix is
//!    reversed, which permits reverse iteration.
//!
//! Conditions the chosen index does not resolve become post-filters. A
//! requested sort the chosen index cannot fully cover is unrecoverable
//! (`NoIndexCovers`): the core never sorts in memory.

use tracing::debug;

use crate::ident::{IndexId, TypeId};
use crate::query::{Filter, FilterOp, QueryError, SortSpec};
use crate::schema::{IndexField, Schema};

/// The portion of a query one chosen index resolves.
#[derive(Clone, Debug)]
pub struct IndexCoverage {
    /// The chosen index.
    pub index: IndexId,
    /// Number of leading fields served by equality filters.
    pub equality_prefix: usize,
    /// Whether the field after the equality prefix serves a range filter.
    pub range_field: bool,
    /// Number of requested sort fields the index then covers.
    pub sort_suffix: usize,
    /// Whether the scan iterates backwards (whole sort suffix reversed).
    pub reverse: bool,
    /// Residual conditions the scan does not resolve; applied after.
    pub post_filters: Vec<Filter>,
}

/// Scores every index of `ty` and returns the best coverage, or `None`
/// when the type declares no indexes (callers fall back to a type scan in
/// id order, which is only legal for unsorted queries).
pub fn select_index(
    schema: &Schema,
    ty: TypeId,
    filters: &[Filter],
    sorts: &[SortSpec],
) -> Result<Option<IndexCoverage>, QueryError> {
    let def = schema.type_def(ty);
    let mut best: Option<(usize, IndexCoverage)> = None;
    for &index in &def.indexes {
        let coverage = score(schema, index, filters, sorts);
        let rank = coverage.equality_prefix * 10_000
            + usize::from(coverage.range_field) * 100
            + coverage.sort_suffix;
        let better = best.as_ref().is_none_or(|(prev, _)| rank > *prev);
        if better {
            best = Some((rank, coverage));
        }
    }

    let covered = best
        .as_ref()
        .map_or(sorts.is_empty(), |(_, c)| c.sort_suffix == sorts.len());
    if !covered {
        return Err(QueryError::NoIndexCovers {
            type_name: def.name.clone(),
        });
    }
    if let Some((rank, coverage)) = &best {
        debug!(
            type_name = %def.name,
            index = coverage.index.index(),
            rank,
            equality_prefix = coverage.equality_prefix,
            range = coverage.range_field,
            sort_suffix = coverage.sort_suffix,
            reverse = coverage.reverse,
            "index plan selected"
        );
    }
    Ok(best.map(|(_, c)| c))
}

fn score(schema: &Schema, index: IndexId, filters: &[Filter], sorts: &[SortSpec]) -> IndexCoverage {
    let def = schema.index(index);
    let mut consumed = vec![false; filters.len()];

    // 1. Leading equality prefix.
    let mut equality_prefix = 0;
    for field in &def.fields {
        let found = filters.iter().enumerate().find(|(i, f)| {
            !consumed[*i]
                && f.path.is_empty()
                && f.op == FilterOp::Eq
                && field_matches(field, f)
        });
        match found {
            Some((i, _)) => {
                consumed[i] = true;
                equality_prefix += 1;
            }
            None => break,
        }
    }

    // 2. One range filter on the next field.
    let mut range_field = false;
    if let Some(field) = def.fields.get(equality_prefix) {
        let found = filters.iter().enumerate().find(|(i, f)| {
            !consumed[*i] && f.path.is_empty() && f.op.is_range() && field_matches(field, f)
        });
        if let Some((i, _)) = found {
            consumed[i] = true;
            range_field = true;
        }
    }

    // 3. Sort suffix, forward or wholly reversed.
    let suffix = &def.fields[equality_prefix.min(def.fields.len())..];
    let forward = matched_sorts(suffix, sorts, false);
    let (sort_suffix, reverse) = if forward == sorts.len() {
        (forward, false)
    } else if !sorts.is_empty() && matched_sorts(suffix, sorts, true) == sorts.len() {
        (sorts.len(), true)
    } else {
        (forward, false)
    };

    let post_filters = filters
        .iter()
        .enumerate()
        .filter(|(i, _)| !consumed[*i])
        .map(|(_, f)| f.clone())
        .collect();

    IndexCoverage {
        index,
        equality_prefix,
        range_field,
        sort_suffix,
        reverse,
        post_filters,
    }
}

fn field_matches(field: &IndexField, filter: &Filter) -> bool {
    match field {
        IndexField::Property { name, .. } => !filter.leaf_is_edge && *name == filter.leaf,
        IndexField::Edge { name, .. } => filter.leaf_is_edge && *name == filter.leaf,
    }
}

/// Counts requested sorts covered consecutively by `fields`, in matching
/// (or, with `reversed`, uniformly opposite) direction.
fn matched_sorts(fields: &[IndexField], sorts: &[SortSpec], reversed: bool) -> usize {
    let mut count = 0;
    for (field, sort) in fields.iter().zip(sorts) {
        let IndexField::Property { name, direction } = field else {
            break;
        };
        let wanted = if reversed {
            sort.direction.reversed()
        } else {
            sort.direction
        };
        if *name == sort.field && *direction == wanted {
            count += 1;
        } else {
            break;
        }
    }
    count
}
