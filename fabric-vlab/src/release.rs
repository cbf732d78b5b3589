use serde_yaml::Value;

/// Marker joining a disagreeing override/release string pair.
const MERGE_ARROW: &str = "←→";

/// Walk two parsed YAML trees and emit a third: wherever both sides carry a
/// string leaf and the override disagrees with the release, the result leaf
/// reads `override←→release`; matching leaves pass through; non-string
/// subtrees recurse. Keys present only in the release are kept, keys present
/// only in the override are ignored. No schema required.
pub fn merge_versions(overrides: &Value, release: &Value) -> Value {
    match (overrides, release) {
        (Value::String(over), Value::String(rel)) => {
            if over == rel {
                Value::String(rel.clone())
            } else {
                Value::String(format!("{}{}{}", over, MERGE_ARROW, rel))
            }
        }
        (Value::Mapping(over), Value::Mapping(rel)) => {
            let mut merged = serde_yaml::Mapping::new();
            for (key, rel_value) in rel {
                let value = match over.get(key) {
                    Some(over_value) => merge_versions(over_value, rel_value),
                    None => rel_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Mapping(merged)
        }
        // Type mismatch or non-string scalar: the release side wins.
        (_, other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).expect("yaml")
    }

    #[test]
    fn test_disagreeing_strings_get_marked() {
        let merged = merge_versions(
            &yaml("fabric: v0.42.0\nagent: v1.2.0"),
            &yaml("fabric: v0.41.0\nagent: v1.2.0"),
        );
        assert_eq!(
            merged,
            yaml("fabric: v0.42.0←→v0.41.0\nagent: v1.2.0")
        );
    }

    #[test]
    fn test_nested_trees_recurse() {
        let merged = merge_versions(
            &yaml("versions:\n  fabric:\n    api: v2"),
            &yaml("versions:\n  fabric:\n    api: v1\n    agent: v3"),
        );
        assert_eq!(
            merged,
            yaml("versions:\n  fabric:\n    api: v2←→v1\n    agent: v3")
        );
    }

    #[test]
    fn test_extra_override_keys_ignored() {
        let merged = merge_versions(
            &yaml("known: a\nextra: b"),
            &yaml("known: a"),
        );
        assert_eq!(merged, yaml("known: a"));
    }

    #[test]
    fn test_non_string_scalars_pass_through() {
        let merged = merge_versions(&yaml("count: 3"), &yaml("count: 5"));
        assert_eq!(merged, yaml("count: 5"));
    }
}
