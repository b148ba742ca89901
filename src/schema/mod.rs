// =====================================================
// TABLE MODEL
// Destination tables, columns and per-column function chains
// =====================================================

use crate::db_types::RowValue;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// --- Schema document (already-parsed input) ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    #[serde(default)]
    pub entries: Vec<SchemaEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaEntry {
    pub name: String,
    /// Source-side SELECT the client runs for this table.
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ParameterDefinition {
    Column(String),
    Literal(RowValue),
}

impl SchemaDefinition {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice::<SchemaDefinition>(bytes)
            .map_err(|e| format!("Failed to decode schema definition: {}", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| format!("Failed to encode schema definition: {}", e))
    }

    pub fn entry(&self, name: &str) -> Option<&SchemaEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }
}

// --- Built model ---

#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    Literal(RowValue),
    /// Resolved per row from the named source field.
    RowSourced(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<Parameter>,
}

/// Row-sourced parameter slots of one function in a column's chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub function_index: usize,
    pub function: String,
    pub positions: Vec<usize>,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub source_field: String,
    pub functions: Vec<Function>,
    pub variables: Vec<Variable>,
}

impl Column {
    pub fn variable_for(&self, function_index: usize) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|variable| variable.function_index == function_index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub query: String,
    pub columns: HashMap<String, Column>,
    pub order: Vec<String>,
}

impl Table {
    /// Columns in INSERT order.
    pub fn ordered_columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.order.iter().filter_map(move |name| {
            self.columns
                .get(name)
                .map(|column| (name.as_str(), column))
        })
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.columns
            .values()
            .flat_map(|column| column.functions.iter())
            .map(|function| function.name.as_str())
    }
}

pub type TableMap = HashMap<String, Arc<Table>>;

fn build_column(table: &str, field: &FieldDefinition) -> Result<Column, String> {
    let source_field = field.value.trim();
    if source_field.is_empty() {
        return Err(format!(
            "Column '{}' of table '{}' has an empty source field",
            field.key, table
        ));
    }

    let mut functions = Vec::with_capacity(field.functions.len());
    let mut variables = Vec::new();

    for (function_index, definition) in field.functions.iter().enumerate() {
        let name = definition.name.trim();
        if name.is_empty() {
            return Err(format!(
                "Function {} of column '{}' in table '{}' has no name",
                function_index + 1,
                field.key,
                table
            ));
        }

        let mut parameters = Vec::with_capacity(definition.parameters.len());
        let mut positions = Vec::new();
        let mut sources = Vec::new();

        for (position, parameter) in definition.parameters.iter().enumerate() {
            match parameter {
                ParameterDefinition::Column(source) => {
                    let source = source.trim().to_string();
                    if source.is_empty() {
                        return Err(format!(
                            "Function '{}' of column '{}' in table '{}' references an empty column",
                            name, field.key, table
                        ));
                    }
                    positions.push(position);
                    sources.push(source.clone());
                    parameters.push(Parameter::RowSourced(source));
                }
                ParameterDefinition::Literal(value) => {
                    parameters.push(Parameter::Literal(value.clone()));
                }
            }
        }

        if !positions.is_empty() {
            variables.push(Variable {
                function_index,
                function: name.to_string(),
                positions,
                sources,
            });
        }

        functions.push(Function {
            name: name.to_string(),
            parameters,
        });
    }

    Ok(Column {
        source_field: source_field.to_string(),
        functions,
        variables,
    })
}

/// Builds the table model and its row-sourced parameter records.
pub fn build_tables(definition: &SchemaDefinition) -> Result<TableMap, String> {
    let mut tables = TableMap::with_capacity(definition.entries.len());

    for entry in &definition.entries {
        let name = entry.name.trim();
        if name.is_empty() {
            return Err("Schema entry has an empty table name".to_string());
        }
        if tables.contains_key(name) {
            return Err(format!("Table '{}' is defined more than once", name));
        }

        let mut columns = HashMap::with_capacity(entry.fields.len());
        let mut order = Vec::with_capacity(entry.fields.len());
        let mut seen = HashSet::with_capacity(entry.fields.len());

        for field in &entry.fields {
            let key = field.key.trim();
            if key.is_empty() {
                return Err(format!("Table '{}' has a column with an empty name", name));
            }
            if !seen.insert(key.to_string()) {
                return Err(format!("Column '{}' is defined more than once in table '{}'", key, name));
            }
            columns.insert(key.to_string(), build_column(name, field)?);
            order.push(key.to_string());
        }

        tables.insert(
            name.to_string(),
            Arc::new(Table {
                name: name.to_string(),
                query: entry.query.trim().to_string(),
                columns,
                order,
            }),
        );
    }

    Ok(tables)
}

#[cfg(test)]
mod tests;
