//! Relations, tables and partitions
//!
//! A relation is `(schema, name)`. A table maps to a single index, or, for
//! partitioned tables, to one index per tuple of partition-column values.
//! The partition ident is a deterministic, reversible encoding of those
//! values: each value is length-prefixed (u16 big-endian, `0xFFFF` marks SQL
//! NULL), the prefixed values are concatenated, and the result is
//! base64-url encoded without padding.

use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every partition index name
pub const PARTITIONED_PREFIX: &str = ".partitioned.";

const NULL_MARKER: u32 = u32::MAX;

/// Fully qualified relation identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationName {
    pub schema: String,
    pub name: String,
}

impl RelationName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Index name backing the non-partitioned form of this table
    pub fn index_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One partition of a partitioned table, identified by its values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionName {
    relation: RelationName,
    values: Vec<Option<String>>,
}

impl PartitionName {
    pub fn new(relation: RelationName, values: Vec<Option<String>>) -> Self {
        Self { relation, values }
    }

    pub fn relation(&self) -> &RelationName {
        &self.relation
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    /// Index name backing this partition
    pub fn index_name(&self) -> String {
        format!(
            "{}{}.{}.{}",
            PARTITIONED_PREFIX,
            self.relation.schema,
            self.relation.name,
            encode_ident(&self.values)
        )
    }

    /// Whether `index` names a partition of `relation`
    pub fn is_partition_of(index: &str, relation: &RelationName) -> bool {
        index
            .strip_prefix(PARTITIONED_PREFIX)
            .and_then(|rest| rest.strip_prefix(&format!("{}.{}.", relation.schema, relation.name)))
            .is_some()
    }

    /// Parse a partition index name back into relation and values
    pub fn from_index_name(index: &str) -> Result<PartitionName> {
        let rest = index.strip_prefix(PARTITIONED_PREFIX).ok_or_else(|| {
            Error::IllegalArgument(format!("not a partition index name: {index}"))
        })?;
        let mut parts = rest.splitn(3, '.');
        let (schema, name, ident) = match (parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(n), Some(i)) if !s.is_empty() && !n.is_empty() => (s, n, i),
            _ => {
                return Err(Error::IllegalArgument(format!(
                    "invalid partition index name: {index}"
                )))
            }
        };
        Ok(PartitionName {
            relation: RelationName::new(schema, name),
            values: decode_ident(ident)?,
        })
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.relation)?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match value {
                Some(v) => write!(f, "{v}")?,
                None => write!(f, "NULL")?,
            }
        }
        write!(f, "]")
    }
}

/// Encode partition values into the ident used in index names
pub fn encode_ident(values: &[Option<String>]) -> String {
    let mut bytes = Vec::new();
    for value in values {
        match value {
            None => bytes.extend_from_slice(&NULL_MARKER.to_be_bytes()),
            Some(v) => {
                bytes.extend_from_slice(&(v.len() as u32).to_be_bytes());
                bytes.extend_from_slice(v.as_bytes());
            }
        }
    }
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a partition ident back into values
pub fn decode_ident(ident: &str) -> Result<Vec<Option<String>>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(ident)
        .map_err(|e| Error::IllegalArgument(format!("invalid partition ident: {e}")))?;
    let mut values = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if pos + 4 > bytes.len() {
            return Err(Error::IllegalArgument("truncated partition ident".into()));
        }
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
        pos += 4;
        if len == NULL_MARKER {
            values.push(None);
            continue;
        }
        let end = pos
            .checked_add(len as usize)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| Error::IllegalArgument("truncated partition ident".into()))?;
        let value = std::str::from_utf8(&bytes[pos..end])
            .map_err(|e| Error::IllegalArgument(format!("invalid partition value: {e}")))?;
        values.push(Some(value.to_string()));
        pos = end;
    }
    Ok(values)
}

/// Column description the write path needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,

    /// Generated column whose expression is not deterministic; its stored
    /// value cannot be reused and must be recomputed on write
    #[serde(default)]
    pub non_deterministic_generated: bool,

    /// Column default that is not deterministic (e.g. now())
    #[serde(default)]
    pub non_deterministic_default: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            non_deterministic_generated: false,
            non_deterministic_default: false,
        }
    }

    pub fn non_deterministic_generated(mut self) -> Self {
        self.non_deterministic_generated = true;
        self
    }

    pub fn non_deterministic_default(mut self) -> Self {
        self.non_deterministic_default = true;
        self
    }
}

/// Table description the write path and close protocol need
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub relation: RelationName,

    /// Routing column; absent means the document id is the routing key
    #[serde(default)]
    pub routing_column: Option<String>,

    /// Partition columns; empty means the table is not partitioned
    #[serde(default)]
    pub partitioned_by: Vec<String>,

    pub columns: Vec<ColumnInfo>,

    #[serde(default)]
    pub primary_keys: Vec<String>,
}

impl TableInfo {
    pub fn is_partitioned(&self) -> bool {
        !self.partitioned_by.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel() -> RelationName {
        RelationName::new("doc", "p")
    }

    #[test]
    fn test_relation_index_name() {
        assert_eq!(RelationName::new("doc", "t").index_name(), "doc.t");
    }

    #[test]
    fn test_ident_roundtrip() {
        let cases: Vec<Vec<Option<String>>> = vec![
            vec![Some("2024-01-01".into())],
            vec![Some("a".into()), Some("b".into())],
            vec![None],
            vec![Some("".into())],
            vec![Some("x".into()), None, Some("zürich".into())],
            vec![],
        ];
        for values in cases {
            let ident = encode_ident(&values);
            assert_eq!(decode_ident(&ident).unwrap(), values, "ident {ident}");
        }
    }

    #[test]
    fn test_ident_deterministic() {
        let values = vec![Some("2024-01-01".into()), Some("eu".into())];
        assert_eq!(encode_ident(&values), encode_ident(&values));
        assert_ne!(
            encode_ident(&values),
            encode_ident(&[Some("2024-01-02".into()), Some("eu".into())])
        );
    }

    #[test]
    fn test_partition_index_name_roundtrip() {
        let partition = PartitionName::new(rel(), vec![Some("2024-01-01".into()), None]);
        let index = partition.index_name();
        assert!(index.starts_with(".partitioned.doc.p."));
        assert!(PartitionName::is_partition_of(&index, &rel()));
        assert!(!PartitionName::is_partition_of(
            &index,
            &RelationName::new("doc", "other")
        ));

        let back = PartitionName::from_index_name(&index).unwrap();
        assert_eq!(back, partition);
    }

    #[test]
    fn test_from_index_name_rejects_garbage() {
        assert!(PartitionName::from_index_name("doc.t").is_err());
        assert!(PartitionName::from_index_name(".partitioned.doc").is_err());
        assert!(PartitionName::from_index_name(".partitioned.doc.p.!!!").is_err());
    }

    #[test]
    fn test_table_info() {
        let table = TableInfo {
            relation: rel(),
            routing_column: None,
            partitioned_by: vec!["day".into()],
            columns: vec![ColumnInfo::new("day"), ColumnInfo::new("id")],
            primary_keys: vec!["id".into()],
        };
        assert!(table.is_partitioned());
        assert!(table.column("day").is_some());
        assert!(table.column("missing").is_none());
    }
}
