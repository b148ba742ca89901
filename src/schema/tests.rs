use super::*;

fn users_definition() -> SchemaDefinition {
    SchemaDefinition {
        entries: vec![SchemaEntry {
            name: "users".to_string(),
            query: "SELECT * FROM legacy_users".to_string(),
            fields: vec![
                FieldDefinition {
                    key: "id".to_string(),
                    value: "old_id".to_string(),
                    functions: vec![FunctionDefinition {
                        name: "ToGuid".to_string(),
                        parameters: vec![ParameterDefinition::Literal(RowValue::from("users"))],
                    }],
                },
                FieldDefinition {
                    key: "display_name".to_string(),
                    value: "nick".to_string(),
                    functions: vec![FunctionDefinition {
                        name: "Nil".to_string(),
                        parameters: vec![ParameterDefinition::Column("full_name".to_string())],
                    }],
                },
                FieldDefinition {
                    key: "email".to_string(),
                    value: "email".to_string(),
                    functions: vec![],
                },
            ],
        }],
    }
}

#[test]
fn test_build_tables_keeps_declared_order() {
    let tables = build_tables(&users_definition()).unwrap();
    let users = tables.get("users").unwrap();

    assert_eq!(users.order, vec!["id", "display_name", "email"]);
    let names = users.ordered_columns().map(|(name, _)| name).collect::<Vec<_>>();
    assert_eq!(names, vec!["id", "display_name", "email"]);
    assert_eq!(users.query, "SELECT * FROM legacy_users");
    for name in &users.order {
        assert!(users.columns.contains_key(name));
    }
}

#[test]
fn test_build_tables_records_row_sourced_parameters() {
    let tables = build_tables(&users_definition()).unwrap();
    let users = tables.get("users").unwrap();

    let id = users.columns.get("id").unwrap();
    assert!(id.variables.is_empty());
    assert_eq!(
        id.functions[0].parameters,
        vec![Parameter::Literal(RowValue::from("users"))]
    );

    let display = users.columns.get("display_name").unwrap();
    let variable = display.variable_for(0).unwrap();
    assert_eq!(variable.function, "Nil");
    assert_eq!(variable.positions, vec![0]);
    assert_eq!(variable.sources, vec!["full_name"]);
    assert!(display.variable_for(1).is_none());
}

#[test]
fn test_build_tables_rejects_duplicates() {
    let mut definition = users_definition();
    let duplicate = definition.entries[0].fields[2].clone();
    definition.entries[0].fields.push(duplicate);
    assert!(build_tables(&definition).is_err());

    let mut definition = users_definition();
    definition.entries.push(definition.entries[0].clone());
    assert!(build_tables(&definition).is_err());
}

#[test]
fn test_schema_definition_json_shape() {
    let raw = r#"{
        "entries": [{
            "name": "orders",
            "query": "SELECT * FROM orders",
            "fields": [
                {"key": "id", "value": "id"},
                {"key": "user_id", "value": "user_id", "functions": [
                    {"name": "ToGuid", "parameters": [{"literal": {"type": "text", "value": "users"}}]}
                ]},
                {"key": "note", "value": "note", "functions": [
                    {"name": "Nil", "parameters": [{"column": "fallback_note"}]}
                ]}
            ]
        }]
    }"#;

    let definition = SchemaDefinition::from_bytes(raw.as_bytes()).unwrap();
    let tables = build_tables(&definition).unwrap();
    let orders = tables.get("orders").unwrap();

    assert_eq!(orders.order.len(), 3);
    assert_eq!(orders.function_names().count(), 2);
    assert_eq!(
        orders.columns.get("note").unwrap().variables[0].sources,
        vec!["fallback_note"]
    );
    assert!(SchemaDefinition::from_bytes(b"not json").is_err());
}
