// =====================================================
// ROW TRANSFORMATION PIPELINE
// Folds each column's function chain over the incoming row
// =====================================================

use crate::db_types::{IncomingRow, RowValue};
use crate::error::FlockError;
use crate::functions::FunctionSet;
use crate::schema::{Column, Function, Parameter, Table, Variable};

fn resolve_arguments(
    function: &Function,
    variable: Option<&Variable>,
    row: &IncomingRow,
    running: RowValue,
) -> Vec<RowValue> {
    let mut args = Vec::with_capacity(function.parameters.len() + 1);
    for parameter in &function.parameters {
        match parameter {
            Parameter::Literal(value) => args.push(value.clone()),
            Parameter::RowSourced(_) => args.push(RowValue::Null),
        }
    }

    if let Some(variable) = variable {
        for (position, source) in variable.positions.iter().zip(variable.sources.iter()) {
            if let Some(slot) = args.get_mut(*position) {
                *slot = row.get(source).cloned().unwrap_or(RowValue::Null);
            }
        }
    }

    args.push(running);
    args
}

fn transform_column(
    table: &Table,
    column_name: &str,
    column: &Column,
    functions: &FunctionSet,
    row: &IncomingRow,
) -> Result<RowValue, FlockError> {
    let mut running = row
        .get(&column.source_field)
        .cloned()
        .unwrap_or(RowValue::Null);

    for (index, function) in column.functions.iter().enumerate() {
        let registered = functions.get(&function.name).ok_or_else(|| FlockError::Transformation {
            table: table.name.clone(),
            column: column_name.to_string(),
            message: format!("function '{}' is not registered", function.name),
        })?;

        let args = resolve_arguments(function, column.variable_for(index), row, running);
        running = registered
            .call(&args)
            .map_err(|error| FlockError::Transformation {
                table: table.name.clone(),
                column: column_name.to_string(),
                message: format!("function '{}' failed: {}", function.name, error),
            })?;
    }

    Ok(running)
}

/// Values for one row in the table's declared column order.
pub fn transform_row(
    table: &Table,
    functions: &FunctionSet,
    row: &IncomingRow,
) -> Result<Vec<RowValue>, FlockError> {
    table
        .ordered_columns()
        .map(|(name, column)| transform_column(table, name, column, functions, row))
        .collect()
}

pub fn transform_rows(
    table: &Table,
    functions: &FunctionSet,
    rows: &[IncomingRow],
) -> Result<Vec<Vec<RowValue>>, FlockError> {
    rows.iter()
        .map(|row| transform_row(table, functions, row))
        .collect()
}

#[cfg(test)]
mod tests;
