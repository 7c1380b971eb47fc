//! Update-to-insert folding
//!
//! ON CONFLICT updates are executed by folding the update assignments with
//! the stored document into an absolute insert row. The output column order
//! is fixed at plan time - explicit insert columns, then non-deterministic
//! synthetic columns, then the remaining table columns - and is identical
//! on the insert and conflict-update branches of the same statement, so
//! bulk payloads never get misaligned.

use crate::grouper::{unix_millis, IndexItem};
use basalt::table::TableInfo;
use basalt::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Right-hand side of one assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssignmentValue {
    /// Evaluated constant
    Literal(Value),
    /// `excluded.col`: the value at this position of the candidate insert row
    Excluded(usize),
}

/// One SET assignment: `col = v` or `col['a']['b'] = v`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    /// Path below the column for nested assignments; empty for top-level
    #[serde(default)]
    pub path: Vec<String>,
    pub value: AssignmentValue,
}

impl Assignment {
    pub fn top_level(column: impl Into<String>, value: AssignmentValue) -> Self {
        Self {
            column: column.into(),
            path: Vec::new(),
            value,
        }
    }

    pub fn nested(
        column: impl Into<String>,
        path: Vec<String>,
        value: AssignmentValue,
    ) -> Self {
        Self {
            column: column.into(),
            path,
            value,
        }
    }
}

/// Folds `(existing document, assignments, excluded row)` into an absolute
/// insert item
#[derive(Debug)]
pub struct UpdateToInsert {
    assignments: Vec<Assignment>,
    target_columns: Vec<String>,
    non_deterministic: Vec<bool>,
}

impl UpdateToInsert {
    pub fn new(
        table: &TableInfo,
        insert_columns: &[String],
        assignments: Vec<Assignment>,
    ) -> Result<Self> {
        for assignment in &assignments {
            if table.column(&assignment.column).is_none() {
                return Err(Error::Validation(format!(
                    "unknown column in assignment: {}",
                    assignment.column
                )));
            }
        }

        // explicit insert columns, then non-deterministic synthetic
        // columns, then everything else; identical on both branches of the
        // statement
        let mut target_columns: Vec<String> = insert_columns.to_vec();
        for column in &table.columns {
            let synthetic = !target_columns.contains(&column.name);
            if synthetic
                && (column.non_deterministic_generated || column.non_deterministic_default)
            {
                target_columns.push(column.name.clone());
            }
        }
        for column in &table.columns {
            if !target_columns.contains(&column.name) {
                target_columns.push(column.name.clone());
            }
        }
        let non_deterministic = target_columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map(|c| c.non_deterministic_generated || c.non_deterministic_default)
                    .unwrap_or(false)
            })
            .collect();

        Ok(Self {
            assignments,
            target_columns,
            non_deterministic,
        })
    }

    /// The fixed output column order
    pub fn target_columns(&self) -> &[String] {
        &self.target_columns
    }

    /// Produce the absolute post-update row for one conflicting document
    pub fn convert(
        &self,
        existing: &Map<String, Value>,
        excluded_row: &[Value],
        id: &str,
        pk_values: Vec<Value>,
    ) -> Result<IndexItem> {
        let mut values = Vec::with_capacity(self.target_columns.len());
        for (position, column) in self.target_columns.iter().enumerate() {
            values.push(self.value_for(column, position, existing, excluded_row)?);
        }
        Ok(IndexItem {
            id: id.to_string(),
            pk_values,
            auto_generated_timestamp: unix_millis(),
            values,
            source: None,
        })
    }

    fn value_for(
        &self,
        column: &str,
        position: usize,
        existing: &Map<String, Value>,
        excluded_row: &[Value],
    ) -> Result<Value> {
        if let Some(assignment) = self
            .assignments
            .iter()
            .find(|a| a.column == column && a.path.is_empty())
        {
            return resolve(&assignment.value, excluded_row);
        }

        let nested: Vec<&Assignment> = self
            .assignments
            .iter()
            .filter(|a| a.column == column && !a.path.is_empty())
            .collect();
        if !nested.is_empty() {
            let mut root = existing
                .get(column)
                .filter(|v| v.is_object())
                .cloned()
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "cannot apply nested update: object column {column} is missing"
                    ))
                })?;
            for assignment in nested {
                let value = resolve(&assignment.value, excluded_row)?;
                deep_merge(&mut root, &assignment.path, value)?;
            }
            return Ok(root);
        }

        // stored values of non-deterministic columns cannot be reused; emit
        // null and let the write path recompute them
        if self.non_deterministic[position] {
            return Ok(Value::Null);
        }

        Ok(existing.get(column).cloned().unwrap_or(Value::Null))
    }
}

fn resolve(value: &AssignmentValue, excluded_row: &[Value]) -> Result<Value> {
    match value {
        AssignmentValue::Literal(v) => Ok(v.clone()),
        AssignmentValue::Excluded(index) => {
            excluded_row.get(*index).cloned().ok_or_else(|| {
                Error::IllegalArgument(format!(
                    "excluded reference {index} out of bounds for row of {} values",
                    excluded_row.len()
                ))
            })
        }
    }
}

/// Merge `value` into the object at `path` below `root`, creating missing
/// intermediate objects
fn deep_merge(root: &mut Value, path: &[String], value: Value) -> Result<()> {
    let mut current = root;
    for segment in &path[..path.len() - 1] {
        let object = current.as_object_mut().ok_or_else(|| {
            Error::Validation(format!("cannot traverse non-object at {segment}"))
        })?;
        current = object
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let last = &path[path.len() - 1];
    let object = current
        .as_object_mut()
        .ok_or_else(|| Error::Validation(format!("cannot set {last} on a non-object")))?;
    object.insert(last.clone(), value);
    Ok(())
}
