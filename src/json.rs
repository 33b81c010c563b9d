use serde_json::Value;

/// Looks up a dotted setting in either flat (`"index.lifecycle.name"`) or
/// nested (`{"index": {"lifecycle": {"name": ..}}}`) form, or any mix of both.
pub fn lookup<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    if let Some(found) = value.get(dotted) {
        return Some(found);
    }
    let object = value.as_object()?;
    for (pos, _) in dotted.match_indices('.') {
        if let Some(child) = object.get(&dotted[..pos]) {
            if let Some(found) = lookup(child, &dotted[pos + 1..]) {
                return Some(found);
            }
        }
    }
    None
}

/// Numbers that may arrive as JSON numbers or as strings (`_cat`, settings).
pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
