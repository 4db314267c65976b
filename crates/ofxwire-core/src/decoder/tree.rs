//! Tree construction from normalized markup

use serde_json::{Map, Value};
use tracing::debug;

use super::normalize::{Token, Tokenizer};
use crate::error::Result;

struct Frame {
    name: String,
    children: Map<String, Value>,
    text: Option<String>,
}

impl Frame {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            children: Map::new(),
            text: None,
        }
    }

    /// Leaves become strings, aggregates become objects
    fn into_value(self) -> Value {
        if self.children.is_empty() {
            Value::String(self.text.unwrap_or_default())
        } else {
            Value::Object(self.children)
        }
    }
}

/// Insert `value` under `name`, turning repeated siblings into an array
fn insert_child(children: &mut Map<String, Value>, name: String, value: Value) {
    match children.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            children.insert(name, value);
        }
    }
}

/// Build the element tree for normalized markup
///
/// Close tags without a matching open element are ignored; elements still
/// open at the end of input are closed implicitly.
pub(crate) fn build_tree(markup: &str) -> Result<Value> {
    // index 0 is a synthetic document root that never gets popped
    let mut stack = vec![Frame::new("")];

    for token in Tokenizer::new(markup) {
        match token? {
            Token::Open(name) => stack.push(Frame::new(name)),
            Token::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text = Some(text.to_string());
                }
            }
            Token::Close(name) => {
                let Some(depth) = stack.iter().skip(1).rposition(|f| f.name == name) else {
                    debug!(element = name, "ignoring close tag without matching open element");
                    continue;
                };
                pop_to(&mut stack, depth + 1);
            }
        }
    }

    pop_to(&mut stack, 1);
    let root = stack.pop().map(|f| f.children).unwrap_or_default();
    Ok(Value::Object(root))
}

/// Pop and attach frames until the stack has `depth` frames
fn pop_to(stack: &mut Vec<Frame>, depth: usize) {
    while stack.len() > depth {
        let Some(frame) = stack.pop() else { break };
        let name = frame.name.clone();
        let value = frame.into_value();
        if let Some(parent) = stack.last_mut() {
            insert_child(&mut parent.children, name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leaves_and_aggregates() {
        let tree = build_tree("<OFX><STATUS><CODE>0</CODE><SEVERITY>INFO</SEVERITY></STATUS></OFX>")
            .unwrap();
        assert_eq!(tree, json!({"OFX": {"STATUS": {"CODE": "0", "SEVERITY": "INFO"}}}));
    }

    #[test]
    fn test_repeated_siblings_become_array_in_order() {
        let tree = build_tree(
            "<LIST><T><ID>1</ID></T><T><ID>2</ID></T><OTHER>x</OTHER><T><ID>3</ID></T></LIST>",
        )
        .unwrap();
        let items = tree["LIST"]["T"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["ID"], "1");
        assert_eq!(items[2]["ID"], "3");
        assert_eq!(tree["LIST"]["OTHER"], "x");
    }

    #[test]
    fn test_single_occurrence_stays_scalar() {
        let tree = build_tree("<LIST><T><ID>1</ID></T></LIST>").unwrap();
        assert!(tree["LIST"]["T"].is_object());
    }

    #[test]
    fn test_key_order_follows_source() {
        let tree = build_tree("<A><Z>1</Z><M>2</M><B>3</B></A>").unwrap();
        let keys: Vec<_> = tree["A"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["Z", "M", "B"]);
    }

    #[test]
    fn test_empty_element_is_empty_string() {
        let tree = build_tree("<A><B></B><C>1</C></A>").unwrap();
        assert_eq!(tree["A"]["B"], "");
    }

    #[test]
    fn test_stray_close_is_ignored_and_open_elements_are_closed() {
        let tree = build_tree("<A><B>1</B></X><C><D>2</D>").unwrap();
        assert_eq!(tree, json!({"A": {"B": "1", "C": {"D": "2"}}}));
    }

    #[test]
    fn test_close_of_outer_element_closes_inner() {
        let tree = build_tree("<A><B><C>1</C></A><E>2</E>").unwrap();
        assert_eq!(tree, json!({"A": {"B": {"C": "1"}}, "E": "2"}));
    }
}
