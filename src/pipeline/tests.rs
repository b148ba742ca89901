use super::*;
use crate::functions::{FnTransform, FunctionRegistry, ReturnKind, Signature};
use crate::identity::IdentityCache;
use crate::schema::{build_tables, FieldDefinition, FunctionDefinition, ParameterDefinition, SchemaDefinition, SchemaEntry};
use std::sync::Arc;

fn field(key: &str, value: &str, functions: Vec<FunctionDefinition>) -> FieldDefinition {
    FieldDefinition {
        key: key.to_string(),
        value: value.to_string(),
        functions,
    }
}

fn function(name: &str, parameters: Vec<ParameterDefinition>) -> FunctionDefinition {
    FunctionDefinition {
        name: name.to_string(),
        parameters,
    }
}

fn table_t() -> Arc<Table> {
    let definition = SchemaDefinition {
        entries: vec![SchemaEntry {
            name: "T".to_string(),
            query: String::new(),
            fields: vec![
                field(
                    "id",
                    "old_id",
                    vec![function(
                        "ToGuid",
                        vec![ParameterDefinition::Literal(RowValue::from("T"))],
                    )],
                ),
                field(
                    "label",
                    "nick",
                    vec![function(
                        "Nil",
                        vec![ParameterDefinition::Column("name".to_string())],
                    )],
                ),
                field("name", "name", vec![]),
            ],
        }],
    };
    build_tables(&definition).unwrap().remove("T").unwrap()
}

fn row(pairs: &[(&str, RowValue)]) -> IncomingRow {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[test]
fn test_same_old_id_maps_to_same_identity() {
    let cache = Arc::new(IdentityCache::new());
    let functions = FunctionRegistry::with_builtins(Arc::clone(&cache))
        .unwrap()
        .snapshot()
        .unwrap();
    let table = table_t();

    let first = transform_row(&table, &functions, &row(&[("old_id", RowValue::Int(5))])).unwrap();
    let second = transform_row(&table, &functions, &row(&[("old_id", RowValue::Int(5))])).unwrap();
    let third = transform_row(&table, &functions, &row(&[("old_id", RowValue::Int(7))])).unwrap();

    assert_eq!(first[0], second[0]);
    assert_ne!(first[0], third[0]);
    assert!(matches!(first[0], RowValue::Text(_)));

    // Warm cache: rerunning gives the same identity.
    let rerun = transform_row(&table, &functions, &row(&[("old_id", RowValue::Int(5))])).unwrap();
    assert_eq!(rerun[0], first[0]);
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_row_sourced_parameter_reads_sibling_field() {
    let functions = FunctionRegistry::with_builtins(Arc::new(IdentityCache::new()))
        .unwrap()
        .snapshot()
        .unwrap();
    let table = table_t();

    let values = transform_row(
        &table,
        &functions,
        &row(&[
            ("old_id", RowValue::Int(1)),
            ("name", RowValue::from("Ada Lovelace")),
        ]),
    )
    .unwrap();
    assert_eq!(values[1], RowValue::from("Ada Lovelace"));
    assert_eq!(values[2], RowValue::from("Ada Lovelace"));

    let values = transform_row(
        &table,
        &functions,
        &row(&[
            ("old_id", RowValue::Int(1)),
            ("nick", RowValue::from("ada")),
            ("name", RowValue::from("Ada Lovelace")),
        ]),
    )
    .unwrap();
    assert_eq!(values[1], RowValue::from("ada"));
}

#[test]
fn test_missing_source_field_is_null() {
    let functions = FunctionRegistry::with_builtins(Arc::new(IdentityCache::new()))
        .unwrap()
        .snapshot()
        .unwrap();
    let values = transform_row(&table_t(), &functions, &IncomingRow::new()).unwrap();
    assert_eq!(values, vec![RowValue::Null, RowValue::Null, RowValue::Null]);
}

#[test]
fn test_chain_applies_left_to_right_with_running_value_last() {
    let registry = FunctionRegistry::new();
    registry
        .register(
            "Append",
            FnTransform::new(Signature::value(1), |args| match args {
                [RowValue::Text(suffix), RowValue::Text(value)] => {
                    Ok(RowValue::Text(format!("{}{}", value, suffix)))
                }
                _ => Ok(RowValue::Null),
            }),
        )
        .unwrap();
    let functions = registry.snapshot().unwrap();

    let definition = SchemaDefinition {
        entries: vec![SchemaEntry {
            name: "t".to_string(),
            query: String::new(),
            fields: vec![field(
                "code",
                "code",
                vec![
                    function("Append", vec![ParameterDefinition::Literal(RowValue::from("-a"))]),
                    function("Append", vec![ParameterDefinition::Literal(RowValue::from("-b"))]),
                ],
            )],
        }],
    };
    let table = build_tables(&definition).unwrap().remove("t").unwrap();

    let values = transform_row(&table, &functions, &row(&[("code", RowValue::from("x"))])).unwrap();
    assert_eq!(values, vec![RowValue::from("x-a-b")]);
}

#[test]
fn test_function_error_carries_table_and_column() {
    let registry = FunctionRegistry::new();
    registry
        .register(
            "Reject",
            FnTransform::new(
                Signature::variadic(vec![ReturnKind::Value, ReturnKind::Error]),
                |_| Err("bad value".to_string()),
            ),
        )
        .unwrap();
    let functions = registry.snapshot().unwrap();

    let definition = SchemaDefinition {
        entries: vec![SchemaEntry {
            name: "t".to_string(),
            query: String::new(),
            fields: vec![field("code", "code", vec![function("Reject", vec![])])],
        }],
    };
    let table = build_tables(&definition).unwrap().remove("t").unwrap();

    let error = transform_rows(&table, &functions, &[IncomingRow::new()]).unwrap_err();
    match error {
        FlockError::Transformation { table, column, message } => {
            assert_eq!(table, "t");
            assert_eq!(column, "code");
            assert!(message.contains("bad value"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
