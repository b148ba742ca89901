use crate::db_types::RowValue;
use crate::functions::{Signature, TransformFunction};
use crate::identity::IdentityCache;
use std::sync::Arc;

/// `ToGuid(table, oldID)`: stable new identity for an old key.
pub struct ToGuid {
    cache: Arc<IdentityCache>,
}

impl ToGuid {
    pub fn new(cache: Arc<IdentityCache>) -> Self {
        Self { cache }
    }
}

impl TransformFunction for ToGuid {
    fn signature(&self) -> Signature {
        Signature::fallible(1)
    }

    fn apply(&self, args: &[RowValue]) -> Result<RowValue, String> {
        let [table, old_id] = args else {
            return Err(format!("ToGuid expects 2 arguments, got {}", args.len()));
        };

        let table = match table {
            RowValue::Text(name) => name.as_str(),
            other => {
                return Err(format!(
                    "ToGuid table argument must be text, got {}",
                    other.type_label()
                ))
            }
        };

        // A missing reference stays missing.
        let Some(old_id) = old_id.to_key_text() else {
            return Ok(RowValue::Null);
        };

        self.cache.remap(table, &old_id).map(RowValue::Text)
    }
}

/// `Nil(default, value)`: `default` when the value is null.
pub struct CoalesceNull;

impl TransformFunction for CoalesceNull {
    fn signature(&self) -> Signature {
        Signature::value(1)
    }

    fn apply(&self, args: &[RowValue]) -> Result<RowValue, String> {
        match args {
            [default, value] if value.is_null() => Ok(default.clone()),
            [_, value] => Ok(value.clone()),
            _ => Err(format!("Nil expects 2 arguments, got {}", args.len())),
        }
    }
}
