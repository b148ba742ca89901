use super::*;
use crate::schema::{build_tables, FieldDefinition, FunctionDefinition, ParameterDefinition, SchemaDefinition, SchemaEntry};

fn constant(returns: Vec<ReturnKind>) -> Arc<dyn TransformFunction> {
    FnTransform::new(Signature::variadic(returns), |_| Ok(RowValue::Int(1)))
}

#[test]
fn test_validate_signature_shapes() {
    let cases = vec![
        (vec![ReturnKind::Value], true),
        (vec![ReturnKind::Value, ReturnKind::Error], true),
        (vec![ReturnKind::Error, ReturnKind::Error], true),
        (vec![], false),
        (vec![ReturnKind::Value, ReturnKind::Value], false),
        (vec![ReturnKind::Value, ReturnKind::Value, ReturnKind::Error], false),
    ];

    for (returns, valid) in cases {
        let signature = Signature::variadic(returns.clone());
        assert_eq!(
            validate_signature("f", &signature).is_ok(),
            valid,
            "returns {:?}",
            returns
        );
    }
}

#[test]
fn test_invalid_registration_leaves_registry_untouched() {
    let registry = FunctionRegistry::new();
    let result = registry.register_all(vec![
        ("good".to_string(), constant(vec![ReturnKind::Value])),
        (
            "three".to_string(),
            constant(vec![ReturnKind::Value, ReturnKind::Value, ReturnKind::Error]),
        ),
    ]);

    assert!(result.is_err());
    assert!(registry.snapshot().unwrap().is_empty());

    let result = registry.register("pair", constant(vec![ReturnKind::Value, ReturnKind::Value]));
    assert!(result.is_err());
    assert!(registry.register("good", constant(vec![ReturnKind::Value])).is_ok());
    assert_eq!(registry.snapshot().unwrap().len(), 1);
}

#[test]
fn test_builtins_are_registered() {
    let registry = FunctionRegistry::with_builtins(Arc::new(IdentityCache::new())).unwrap();
    let functions = registry.snapshot().unwrap();

    let to_guid = functions.get("ToGuid").unwrap();
    assert_eq!(to_guid.shape(), ReturnShape::ValueOrError);
    assert_eq!(to_guid.parameters(), Some(1));

    let nil = functions.get("Nil").unwrap();
    assert_eq!(nil.shape(), ReturnShape::Value);
    assert_eq!(
        nil.call(&[RowValue::from("n/a"), RowValue::Null]).unwrap(),
        RowValue::from("n/a")
    );
    assert_eq!(
        nil.call(&[RowValue::from("n/a"), RowValue::from("bob")]).unwrap(),
        RowValue::from("bob")
    );
}

#[test]
fn test_to_guid_builtin() {
    let cache = Arc::new(IdentityCache::new());
    let to_guid = ToGuid::new(Arc::clone(&cache));

    let first = to_guid.apply(&[RowValue::from("users"), RowValue::Int(5)]).unwrap();
    let second = to_guid.apply(&[RowValue::from("users"), RowValue::from("5")]).unwrap();
    assert_eq!(first, second);
    assert_eq!(to_guid.apply(&[RowValue::from("users"), RowValue::Null]).unwrap(), RowValue::Null);
    assert!(to_guid.apply(&[RowValue::Int(1), RowValue::Int(5)]).is_err());
    assert!(to_guid.apply(&[RowValue::Int(5)]).is_err());
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_snapshot_is_isolated_from_later_registrations() {
    let registry = FunctionRegistry::new();
    registry.register("a", constant(vec![ReturnKind::Value])).unwrap();
    let mut snapshot = registry.snapshot().unwrap();

    snapshot
        .extend(vec![("b".to_string(), constant(vec![ReturnKind::Value]))])
        .unwrap();
    registry.register("c", constant(vec![ReturnKind::Value])).unwrap();

    assert!(snapshot.get("b").is_some());
    assert!(snapshot.get("c").is_none());
    assert!(registry.snapshot().unwrap().get("b").is_none());
}

#[test]
fn test_infallible_function_error_is_reported() {
    let mut functions = FunctionSet::default();
    functions
        .extend(vec![(
            "boom".to_string(),
            FnTransform::new(Signature::value(0), |_| Err("exploded".to_string())),
        )])
        .unwrap();

    let error = functions.get("boom").unwrap().call(&[RowValue::Null]).unwrap_err();
    assert!(error.contains("exploded"));
}

#[test]
fn test_check_tables_reports_unknown_and_arity() {
    let definition = |function: &str, parameters: Vec<ParameterDefinition>| SchemaDefinition {
        entries: vec![SchemaEntry {
            name: "t".to_string(),
            query: String::new(),
            fields: vec![FieldDefinition {
                key: "id".to_string(),
                value: "old_id".to_string(),
                functions: vec![FunctionDefinition {
                    name: function.to_string(),
                    parameters,
                }],
            }],
        }],
    };
    let functions = FunctionRegistry::with_builtins(Arc::new(IdentityCache::new()))
        .unwrap()
        .snapshot()
        .unwrap();

    let ok = build_tables(&definition(
        "ToGuid",
        vec![ParameterDefinition::Literal(RowValue::from("t"))],
    ))
    .unwrap();
    assert!(functions.check_tables(&ok).is_ok());

    let unknown = build_tables(&definition("Missing", vec![])).unwrap();
    assert!(functions.check_tables(&unknown).unwrap_err().contains("not registered"));

    let arity = build_tables(&definition("ToGuid", vec![])).unwrap();
    assert!(functions.check_tables(&arity).unwrap_err().contains("takes 1 parameter"));
}

#[test]
fn test_no_plugins_loader() {
    assert!(NoPlugins.load(b"").unwrap().is_empty());
    assert!(NoPlugins.load(b"  \n").unwrap().is_empty());
    assert!(NoPlugins.load(b"package main").is_err());
}
