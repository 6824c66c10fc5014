// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Table schemas: ordered columns, key prefix, storage attributes.
//!
//! A server-side schema always has [`ColumnId`]s assigned; a client
//! projection never does. Schemas are immutable once installed on a
//! tablet; alters install a new schema version.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{encode_key_part, DataType, Value};

pub type ColumnId = u32;

/// Per-column encoding choice for the base CFile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EncodingType {
    /// Default for the column's physical type: bit-shuffle for
    /// fixed-width, plain for binary.
    Auto,
    Plain,
    BitShuffle,
    Dictionary,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
}

/// Storage attributes a column carries into its CFile writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StorageAttributes {
    pub encoding: EncodingType,
    pub compression: CompressionType,
    /// Target encoded size of one data block, in bytes.
    pub cfile_block_size: usize,
}

impl Default for StorageAttributes {
    fn default() -> Self {
        StorageAttributes {
            encoding: EncodingType::Auto,
            compression: CompressionType::None,
            cfile_block_size: 32 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub immutable: bool,
    pub auto_incrementing: bool,
    pub read_default: Option<Value>,
    pub write_default: Option<Value>,
    pub attributes: StorageAttributes,
    /// Stable numeric id; `None` in client projections.
    pub id: Option<ColumnId>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            data_type,
            nullable: false,
            immutable: false,
            auto_incrementing: false,
            read_default: None,
            write_default: None,
            attributes: StorageAttributes::default(),
            id: None,
        }
    }

    pub fn nullable(mut self, nullable: bool) -> ColumnSchema {
        self.nullable = nullable;
        self
    }

    pub fn encoding(mut self, encoding: EncodingType) -> ColumnSchema {
        self.attributes.encoding = encoding;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> ColumnSchema {
        self.attributes.compression = compression;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> ColumnSchema {
        self.attributes.cfile_block_size = bytes;
        self
    }

    pub fn with_id(mut self, id: ColumnId) -> ColumnSchema {
        self.id = Some(id);
        self
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl Schema {
    /// Builds a schema whose first `num_key_columns` columns form the
    /// primary key, validating the §3 invariants.
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Result<Schema> {
        if num_key_columns == 0 || num_key_columns > columns.len() {
            return Err(Error::invalid_argument(format!(
                "bad key column count {} for {} columns",
                num_key_columns,
                columns.len()
            )));
        }
        let mut names = HashSet::new();
        let mut auto_incrementing = 0;
        for (i, col) in columns.iter().enumerate() {
            if col.name.is_empty() {
                return Err(Error::invalid_argument("column names must be non-empty"));
            }
            if !names.insert(col.name.as_str()) {
                return Err(Error::invalid_argument(format!(
                    "duplicate column name: {}",
                    col.name
                )));
            }
            if i < num_key_columns && col.nullable {
                return Err(Error::invalid_argument(format!(
                    "key column {} may not be nullable",
                    col.name
                )));
            }
            if col.auto_incrementing {
                if col.data_type != DataType::Int64 || i >= num_key_columns {
                    return Err(Error::invalid_argument(
                        "auto-increment columns must be INT64 key columns",
                    ));
                }
                auto_incrementing += 1;
            }
            if col.data_type == DataType::IsDeleted {
                if col.nullable {
                    return Err(Error::invalid_argument(
                        "the is_deleted virtual column must be non-nullable",
                    ));
                }
                if col.read_default.is_none() {
                    return Err(Error::invalid_argument(
                        "the is_deleted virtual column requires a read default",
                    ));
                }
            }
        }
        if auto_incrementing > 1 {
            return Err(Error::invalid_argument(
                "at most one auto-increment column is allowed",
            ));
        }
        Ok(Schema {
            columns,
            num_key_columns,
        })
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> &ColumnSchema {
        &self.columns[idx]
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn find_column_by_id(&self, id: ColumnId) -> Option<usize> {
        self.columns.iter().position(|c| c.id == Some(id))
    }

    pub fn has_column_ids(&self) -> bool {
        self.columns.iter().all(|c| c.id.is_some())
    }

    /// Returns a copy of this schema with fresh sequential column ids,
    /// as the catalog does when installing a client-provided schema.
    pub fn with_assigned_ids(&self) -> Schema {
        let columns = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let mut c = c.clone();
                c.id = Some(i as ColumnId);
                c
            })
            .collect();
        Schema {
            columns,
            num_key_columns: self.num_key_columns,
        }
    }

    /// Memcomparable encoding of the row's primary key. `row` must hold
    /// at least the key columns in schema order.
    pub fn encode_key(&self, row: &[Value]) -> Vec<u8> {
        assert!(row.len() >= self.num_key_columns);
        let mut buf = vec![];
        for i in 0..self.num_key_columns {
            encode_key_part(&row[i], i + 1 == self.num_key_columns, &mut buf);
        }
        buf
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.num_key_columns == other.num_key_columns && self.columns == other.columns
    }
}

pub type SchemaRef = Arc<Schema>;

#[cfg(test)]
mod tests {
    use super::*;

    fn two_col_schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new("id", DataType::Int32),
                ColumnSchema::new("val", DataType::String).nullable(true),
            ],
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_reject_nullable_key() {
        let err = Schema::new(
            vec![ColumnSchema::new("id", DataType::Int32).nullable(true)],
            1,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_reject_duplicate_names() {
        let err = Schema::new(
            vec![
                ColumnSchema::new("c", DataType::Int32),
                ColumnSchema::new("c", DataType::Int64),
            ],
            1,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_reject_second_auto_increment() {
        let mut a = ColumnSchema::new("a", DataType::Int64);
        a.auto_incrementing = true;
        let mut b = ColumnSchema::new("b", DataType::Int64);
        b.auto_incrementing = true;
        let err = Schema::new(vec![a, b], 2).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_is_deleted_constraints() {
        let err = Schema::new(
            vec![
                ColumnSchema::new("id", DataType::Int32),
                ColumnSchema::new("is_deleted", DataType::IsDeleted),
            ],
            1,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let mut vc = ColumnSchema::new("is_deleted", DataType::IsDeleted);
        vc.read_default = Some(Value::Bool(false));
        Schema::new(vec![ColumnSchema::new("id", DataType::Int32), vc], 1).unwrap();
    }

    #[test]
    fn test_id_assignment() {
        let schema = two_col_schema();
        assert!(!schema.has_column_ids());
        let with_ids = schema.with_assigned_ids();
        assert!(with_ids.has_column_ids());
        assert_eq!(with_ids.find_column_by_id(1), Some(1));
    }

    #[test]
    fn test_key_encoding_orders_rows() {
        let schema = two_col_schema();
        let a = schema.encode_key(&[Value::I32(-1)]);
        let b = schema.encode_key(&[Value::I32(7)]);
        assert!(a < b);
    }
}
