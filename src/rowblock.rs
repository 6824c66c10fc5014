// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Column-major row batches used on the scan and flush paths.

use bitvec::prelude::*;

use crate::schema::SchemaRef;
use crate::types::{ColumnVec, Value};

/// Marks which rows of a block are live. A cleared bit means the row
/// was deselected, e.g. by a pushed-down predicate or a deletion.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionVector {
    bits: BitVec<u8, Lsb0>,
}

impl SelectionVector {
    pub fn new_all_selected(nrows: usize) -> SelectionVector {
        SelectionVector {
            bits: BitVec::repeat(true, nrows),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_selected(&self, row: usize) -> bool {
        self.bits[row]
    }

    pub fn clear_bit(&mut self, row: usize) {
        self.bits.set(row, false);
    }

    pub fn set_bit(&mut self, row: usize) {
        self.bits.set(row, true);
    }

    /// Clears the first `n` bits, e.g. when a whole batch fails a
    /// predicate without decoding.
    pub fn clear_bits(&mut self, n: usize) {
        for i in 0..n {
            self.bits.set(i, false);
        }
    }

    pub fn any_selected(&self) -> bool {
        self.bits.any()
    }

    pub fn count_selected(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn as_bools(&self) -> Vec<bool> {
        self.bits.iter().by_vals().collect()
    }
}

/// One column of a [`RowBlock`]: the cell array plus a null bitmap,
/// present iff the column is nullable. A set bit means non-null.
#[derive(Clone, Debug)]
pub struct ColumnBlock {
    pub data: ColumnVec,
    pub non_null: Option<BitVec<u8, Lsb0>>,
}

impl ColumnBlock {
    pub fn new(data: ColumnVec, nullable: bool) -> ColumnBlock {
        let non_null = nullable.then(|| BitVec::repeat(true, data.len()));
        ColumnBlock { data, non_null }
    }

    pub fn nrows(&self) -> usize {
        self.data.len()
    }

    pub fn is_null(&self, row: usize) -> bool {
        match &self.non_null {
            Some(bitmap) => !bitmap[row],
            None => false,
        }
    }

    pub fn cell(&self, row: usize) -> Value {
        if self.is_null(row) {
            Value::Null
        } else {
            self.data.get(row)
        }
    }
}

/// A column-major block of up to `nrows` rows over a projection schema.
///
/// Invariants: every column block has exactly `nrows` cells; the null
/// bitmap is present iff the column is nullable; the selection vector
/// covers `nrows` bits.
pub struct RowBlock {
    pub schema: SchemaRef,
    pub columns: Vec<ColumnBlock>,
    pub selection: SelectionVector,
    nrows: usize,
}

impl RowBlock {
    pub fn new(schema: SchemaRef, columns: Vec<ColumnBlock>) -> RowBlock {
        assert_eq!(schema.num_columns(), columns.len());
        let nrows = columns.first().map(ColumnBlock::nrows).unwrap_or(0);
        for (i, col) in columns.iter().enumerate() {
            assert_eq!(col.nrows(), nrows, "column {i} row count mismatch");
            assert_eq!(
                col.non_null.is_some(),
                schema.column(i).nullable,
                "column {i} null bitmap presence mismatch"
            );
        }
        RowBlock {
            schema,
            columns,
            selection: SelectionVector::new_all_selected(nrows),
            nrows,
        }
    }

    /// Builds a block from row-major cells, e.g. an MRS flush batch.
    pub fn from_rows(schema: SchemaRef, rows: &[Vec<Value>]) -> RowBlock {
        let mut columns = Vec::with_capacity(schema.num_columns());
        for (i, col_schema) in schema.columns().iter().enumerate() {
            let mut data = ColumnVec::new(col_schema.data_type.physical_type());
            let mut non_null =
                col_schema.nullable.then(|| BitVec::<u8, Lsb0>::repeat(true, rows.len()));
            for (r, row) in rows.iter().enumerate() {
                match &row[i] {
                    Value::Null => {
                        let bitmap = non_null
                            .as_mut()
                            .expect("null cell in a non-nullable column");
                        bitmap.set(r, false);
                        // Keep the cell array dense: nulls store the
                        // type's zero value.
                        data.push(zero_cell(&data));
                    }
                    v => data.push(v.clone()),
                }
            }
            columns.push(ColumnBlock { data, non_null });
        }
        let nrows = rows.len();
        RowBlock {
            schema,
            columns,
            selection: SelectionVector::new_all_selected(nrows),
            nrows,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn column(&self, idx: usize) -> &ColumnBlock {
        &self.columns[idx]
    }

    /// Materializes the selected rows back to row-major form.
    pub fn to_rows(&self) -> Vec<Vec<Value>> {
        (0..self.nrows)
            .filter(|&r| self.selection.is_selected(r))
            .map(|r| self.columns.iter().map(|c| c.cell(r)).collect())
            .collect()
    }
}

fn zero_cell(data: &ColumnVec) -> Value {
    use crate::types::PhysicalType::*;
    match data.physical_type() {
        I8 => Value::I8(0),
        I16 => Value::I16(0),
        I32 => Value::I32(0),
        I64 => Value::I64(0),
        I128 => Value::I128(0),
        F32 => Value::F32(0.0),
        F64 => Value::F64(0.0),
        Bool => Value::Bool(false),
        Binary => Value::Binary(bytes::Bytes::new()),
    }
}
