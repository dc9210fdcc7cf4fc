//! Result assembly into a JSON tree.
//!
//! The executor hands over an internal node tree; this module flattens it
//! into `serde_json` values with the output conventions: uids render as
//! hex strings, nodes that resolved to nothing are dropped, an empty block
//! renders as `[]` under its key unless the block groups (then the key is
//! omitted), and var blocks emit nothing.

use serde_json::{Map, Value};

use crate::types::Result;

use super::ast::{Query, Selection};
use super::executor::{BlockOut, CountEntry, Field, GroupResult, NodeResult};

pub(crate) fn assemble(query: &Query, outputs: Vec<Option<BlockOut>>) -> Result<Value> {
    let mut root = Map::new();
    for (block, out) in query.blocks.iter().zip(outputs) {
        if block.is_var {
            continue;
        }
        let Some(out) = out else { continue };
        let mut arr: Vec<Value> = Vec::new();
        for node in &out.nodes {
            let obj = node_json(node);
            if !obj.is_empty() {
                arr.push(Value::Object(obj));
            }
        }
        for c in &out.counts {
            arr.push(count_json(c));
        }
        if arr.is_empty() && selections_group(&block.selections) {
            continue;
        }
        root.insert(block.name.clone(), Value::Array(arr));
    }
    Ok(Value::Object(root))
}

fn node_json(node: &NodeResult) -> Map<String, Value> {
    let mut obj = Map::new();
    for field in &node.fields {
        match field {
            Field::Scalar(key, v) => {
                obj.insert(key.clone(), v.to_json());
            }
            Field::List(key, vs) => {
                let arr: Vec<Value> = vs.iter().map(|v| v.to_json()).collect();
                merge_list(&mut obj, key, arr);
            }
            Field::Children { key, nodes, counts } => {
                let mut arr: Vec<Value> = Vec::new();
                for child in nodes {
                    let child_obj = node_json(child);
                    if !child_obj.is_empty() {
                        arr.push(Value::Object(child_obj));
                    }
                }
                for c in counts {
                    arr.push(count_json(c));
                }
                merge_list(&mut obj, key, arr);
            }
            Field::Groups(key, groups) => {
                let arr: Vec<Value> = groups.iter().map(group_json).collect();
                let mut wrapper = Map::new();
                wrapper.insert("@groupby".to_owned(), Value::Array(arr));
                obj.insert(key.clone(), Value::Array(vec![Value::Object(wrapper)]));
            }
        }
    }
    obj
}

/// Two selections of the same list key in one node concatenate rather
/// than overwrite.
fn merge_list(obj: &mut Map<String, Value>, key: &str, arr: Vec<Value>) {
    match obj.get_mut(key) {
        Some(Value::Array(existing)) => existing.extend(arr),
        _ => {
            obj.insert(key.to_owned(), Value::Array(arr));
        }
    }
}

fn count_json(c: &CountEntry) -> Value {
    let mut obj = Map::new();
    obj.insert(c.key.clone(), Value::from(c.n));
    Value::Object(obj)
}

fn group_json(g: &GroupResult) -> Value {
    let mut obj = Map::new();
    for (key, v) in &g.keys {
        obj.insert(key.clone(), v.to_json());
    }
    for (key, v) in &g.aggs {
        obj.insert(key.clone(), v.to_json());
    }
    Value::Object(obj)
}

fn selections_group(selections: &[Selection]) -> bool {
    selections
        .iter()
        .any(|s| s.groupby.is_some() || selections_group(&s.children))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypedValue, Uid};

    #[test]
    fn empty_nodes_are_dropped() {
        let node = NodeResult { uid: Uid(7), fields: Vec::new() };
        assert!(node_json(&node).is_empty());
    }

    #[test]
    fn uids_render_as_hex() {
        let node = NodeResult {
            uid: Uid(1),
            fields: vec![Field::Scalar("uid".into(), TypedValue::Uid(Uid(31)))],
        };
        let obj = node_json(&node);
        assert_eq!(obj["uid"], serde_json::json!("0x1f"));
    }

    #[test]
    fn child_counts_append_to_the_edge_array() {
        let node = NodeResult {
            uid: Uid(1),
            fields: vec![Field::Children {
                key: "friend".into(),
                nodes: vec![NodeResult {
                    uid: Uid(23),
                    fields: vec![Field::Scalar(
                        "name".into(),
                        TypedValue::Str("Rick Grimes".into()),
                    )],
                }],
                counts: vec![CountEntry { key: "count".into(), n: 1 }],
            }],
        };
        let obj = node_json(&node);
        assert_eq!(
            Value::Object(obj),
            serde_json::json!({
                "friend": [
                    {"name": "Rick Grimes"},
                    {"count": 1},
                ]
            })
        );
    }
}
