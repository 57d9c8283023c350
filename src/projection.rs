//! Ready-made optimistic projections.
//!
//! Most dashboard mutations fall into a handful of shapes: a create prepends
//! the new record to a list, an update replaces the matching record in
//! place, a delete filters it out, and a single-object edit merges fields.
//! These constructors build the corresponding [`ProjectFn`] so callers do
//! not hand-roll JSON surgery per mutation.
//!
//! All of them treat a missing or non-matching current value conservatively:
//! they never invent structure beyond what the variables carry.

use std::sync::Arc;

use serde_json::Value;

use crate::mutation::ProjectFn;

/// New record goes to the front of the cached list; newest-first ordering
/// is the dashboard convention.
pub fn prepend_item() -> ProjectFn {
    Arc::new(|old: Option<&Value>, variables: &Value| {
        let mut items = vec![variables.clone()];
        if let Some(Value::Array(existing)) = old {
            items.extend(existing.iter().cloned());
        }
        Value::Array(items)
    })
}

/// Replace the list element whose `id` equals the variables' `id`, merging
/// the variables' fields over it. Elements without a matching `id` are left
/// untouched.
pub fn merge_by_id() -> ProjectFn {
    Arc::new(|old: Option<&Value>, variables: &Value| {
        let Some(Value::Array(existing)) = old else {
            return Value::Array(Vec::new());
        };
        let target = &variables["id"];
        let items = existing
            .iter()
            .map(|item| {
                if !target.is_null() && item["id"] == *target {
                    merged(item, variables)
                } else {
                    item.clone()
                }
            })
            .collect();
        Value::Array(items)
    })
}

/// Drop the list element whose `id` equals the variables' `id`.
pub fn remove_by_id() -> ProjectFn {
    Arc::new(|old: Option<&Value>, variables: &Value| {
        let Some(Value::Array(existing)) = old else {
            return Value::Array(Vec::new());
        };
        let target = &variables["id"];
        let items = existing
            .iter()
            .filter(|item| target.is_null() || item["id"] != *target)
            .cloned()
            .collect();
        Value::Array(items)
    })
}

/// Merge the variables' fields over the cached object, keeping fields the
/// mutation does not touch.
pub fn merge_object() -> ProjectFn {
    Arc::new(|old: Option<&Value>, variables: &Value| match old {
        Some(current) => merged(current, variables),
        None => variables.clone(),
    })
}

fn merged(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut out = base.clone();
            for (field, value) in overlay {
                out.insert(field.clone(), value.clone());
            }
            Value::Object(out)
        }
        _ => overlay.clone(),
    }
}
