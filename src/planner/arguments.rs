//! Argument resolution and canonicalization: AST values plus variables become
//! key-sorted JSON objects with a stable string rendering, which is what page
//! and identity keys are built from.

use crate::error::CacheError;
use crate::graph::FieldMap;
use apollo_compiler::ast::Value as AstValue;
use apollo_compiler::Node;
use indexmap::IndexSet;
use lazy_static::lazy_static;
use serde_json::Value as JsonValue;

lazy_static! {
    /// Arguments that page a connection rather than filter it. They are part
    /// of page keys and never part of identity keys.
    pub(crate) static ref PAGINATION_ARGUMENTS: IndexSet<&'static str> =
        IndexSet::from(["first", "last", "after", "before"]);
}

/// A `@include`/`@skip` argument: either a literal or a variable reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BooleanOrVariable {
    Boolean(bool),
    Variable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub(crate) enum OperationConditionalKind {
    #[strum(to_string = "include")]
    Include,
    #[strum(to_string = "skip")]
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OperationConditional {
    pub(crate) kind: OperationConditionalKind,
    pub(crate) value: BooleanOrVariable,
}

impl OperationConditional {
    /// Whether the conditional lets its selection through. A missing variable
    /// reads as `false`.
    pub(crate) fn passes(&self, variables: &FieldMap) -> bool {
        let value = match &self.value {
            BooleanOrVariable::Boolean(value) => *value,
            BooleanOrVariable::Variable(name) => variables
                .get(name)
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
        };
        match self.kind {
            OperationConditionalKind::Include => value,
            OperationConditionalKind::Skip => !value,
        }
    }
}

/// Resolves an AST value against the provided variables. Returns `None` for a
/// reference to a variable the caller did not provide, which drops the
/// argument from the canonical set entirely (an explicit `null` is kept).
pub(crate) fn resolve_value(
    value: &AstValue,
    variables: &FieldMap,
) -> Result<Option<JsonValue>, CacheError> {
    Ok(Some(match value {
        AstValue::Null => JsonValue::Null,
        AstValue::Boolean(value) => JsonValue::Bool(*value),
        AstValue::Enum(name) => JsonValue::String(name.as_str().to_string()),
        AstValue::String(value) => JsonValue::String(value.as_str().to_string()),
        AstValue::Int(value) => match value.try_to_i32() {
            Ok(value) => JsonValue::from(value),
            Err(_) => value
                .as_str()
                .parse::<f64>()
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null),
        },
        AstValue::Float(value) => value
            .try_to_f64()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::Null),
        AstValue::Variable(name) => match variables.get(name.as_str()) {
            Some(value) => value.clone(),
            None => return Ok(None),
        },
        AstValue::List(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                // A missing variable inside a list collapses to null so the
                // list keeps its shape.
                list.push(resolve_value(item, variables)?.unwrap_or(JsonValue::Null));
            }
            JsonValue::Array(list)
        }
        AstValue::Object(entries) => {
            let mut resolved: Vec<(String, JsonValue)> = Vec::with_capacity(entries.len());
            for (name, value) in entries {
                if let Some(value) = resolve_value(value, variables)? {
                    resolved.push((name.as_str().to_string(), value));
                }
            }
            resolved.sort_by(|a, b| a.0.cmp(&b.0));
            let mut map = FieldMap::new();
            for (name, value) in resolved {
                map.insert(name, value);
            }
            JsonValue::Object(map)
        }
    }))
}

/// Resolves a field's argument list into a canonical, key-sorted object.
pub(crate) fn canonical_args(
    arguments: &[(String, Node<AstValue>)],
    variables: &FieldMap,
) -> Result<FieldMap, CacheError> {
    let mut resolved: Vec<(String, JsonValue)> = Vec::with_capacity(arguments.len());
    for (name, value) in arguments {
        if let Some(value) = resolve_value(value, variables)? {
            resolved.push((name.clone(), value));
        }
    }
    resolved.sort_by(|a, b| a.0.cmp(&b.0));
    let mut map = FieldMap::new();
    for (name, value) in resolved {
        map.insert(name, value);
    }
    Ok(map)
}

/// Renders a value as canonical JSON: object keys sorted recursively, so the
/// rendering is stable across argument orderings.
pub(crate) fn canonical_json(value: &JsonValue) -> String {
    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

fn sorted(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = FieldMap::new();
            for (name, value) in entries {
                out.insert(name.clone(), sorted(value));
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// `field` for an argument-free field, `field({...})` otherwise.
pub(crate) fn storage_key(field_name: &str, args: &FieldMap) -> String {
    if args.is_empty() {
        field_name.to_string()
    } else {
        format!(
            "{field_name}({})",
            canonical_json(&JsonValue::Object(args.clone()))
        )
    }
}

/// Splits canonical args into the identity (filter-only) subset declared by
/// the connection spec. Pagination arguments never participate.
pub(crate) fn filter_args(args: &FieldMap, filters: &[String]) -> FieldMap {
    let mut out = FieldMap::new();
    for (name, value) in args {
        if PAGINATION_ARGUMENTS.contains(name.as_str()) {
            continue;
        }
        if filters.iter().any(|filter| filter == name) {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}
