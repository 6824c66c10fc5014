// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Column predicates pushed down into block decoding.

use bytes::Bytes;

/// The predicate shapes the dictionary evaluation path understands.
/// Anything richer is evaluated above the storage layer.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnPredicate {
    /// Cell == value.
    Equality(Bytes),
    /// Cell ∈ values.
    InList(Vec<Bytes>),
    /// Cell is non-null. Decoders return every decoded row; null
    /// filtering happens against the null bitmap above.
    IsNotNull,
}

impl ColumnPredicate {
    pub fn equality(value: impl AsRef<[u8]>) -> ColumnPredicate {
        ColumnPredicate::Equality(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn evaluate_cell(&self, cell: &[u8]) -> bool {
        match self {
            ColumnPredicate::Equality(v) => cell == &v[..],
            ColumnPredicate::InList(vs) => vs.iter().any(|v| cell == &v[..]),
            ColumnPredicate::IsNotNull => true,
        }
    }

    pub fn is_not_null(&self) -> bool {
        matches!(self, ColumnPredicate::IsNotNull)
    }
}
