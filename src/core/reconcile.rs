use serde_json::{Map, Value};

/// Deep-merges `template` into `data`, filling only absent fields.
///
/// Nested objects present on both sides are merged recursively. A field that
/// already exists in `data` is never replaced, even if its type differs from
/// the template's. Returns true when anything was inserted.
pub fn reconcile_template(data: &mut Map<String, Value>, template: &Map<String, Value>) -> bool {
    let mut changed = false;
    for (field, default) in template {
        match data.get_mut(field) {
            None => {
                data.insert(field.clone(), default.clone());
                changed = true;
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(nested_default) = default {
                    changed |= reconcile_template(existing, nested_default);
                }
            }
            Some(_) => {}
        }
    }
    changed
}
