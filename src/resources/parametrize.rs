//! Argument substitution over allow-listed template fields.
//!
//! Placeholders are `$name` or `${name}`. Fields are dot-separated paths
//! into the serialized template; arrays met along a path are traversed
//! element-wise and every string below the final segment is expanded.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::errors::Result;
use crate::graph::GraphContext;

/// Return a deep copy of `template` with placeholders in `fields` resolved
/// through `ctx`. Unknown arguments expand to the empty string.
pub fn parametrize<T>(template: &T, ctx: &dyn GraphContext, fields: &[&str]) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(template)?;
    let lookup = |name: &str| ctx.get_arg(name);
    for field in fields {
        let path: Vec<&str> = field.split('.').filter(|s| !s.is_empty()).collect();
        substitute_at(&mut value, &path, &lookup);
    }
    Ok(serde_json::from_value(value)?)
}

fn substitute_at(value: &mut Value, path: &[&str], lookup: &dyn Fn(&str) -> String) {
    if let Value::Array(items) = value {
        for item in items {
            substitute_at(item, path, lookup);
        }
        return;
    }

    match path.split_first() {
        None => substitute_all(value, lookup),
        Some((head, rest)) => {
            if let Value::Object(map) = value {
                if let Some(child) = map.get_mut(*head) {
                    substitute_at(child, rest, lookup);
                }
            }
        }
    }
}

fn substitute_all(value: &mut Value, lookup: &dyn Fn(&str) -> String) {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = expand(s, lookup);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| substitute_all(item, lookup)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|item| substitute_all(item, lookup)),
        _ => {}
    }
}

fn is_arg_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Expand `$name` and `${name}` placeholders in `input`.
///
/// A `$` that does not start a placeholder, and an unterminated `${`,
/// are kept verbatim.
pub fn expand(input: &str, lookup: &dyn Fn(&str) -> String) -> String {
    let mut output = String::with_capacity(input.len());
    let mut remainder = input;

    while let Some(start) = remainder.find('$') {
        output.push_str(&remainder[..start]);
        let after = &remainder[start + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if end > 0 => {
                    output.push_str(&lookup(braced[..end].trim()));
                    remainder = &braced[end + 1..];
                }
                _ => {
                    output.push('$');
                    remainder = after;
                }
            }
            continue;
        }

        let name_len = after
            .char_indices()
            .find(|(_, c)| !is_arg_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        if name_len == 0 {
            output.push('$');
            remainder = after;
        } else {
            output.push_str(&lookup(&after[..name_len]));
            remainder = &after[name_len..];
        }
    }

    output.push_str(remainder);
    output
}
