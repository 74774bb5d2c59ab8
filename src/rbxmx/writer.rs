use std::{collections::{HashMap, HashSet}, fmt::{self, Write}};

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{error::{CompileError, CompileResult}, instance::{child_path, InstanceNode, InstanceTree, NodeId, Value}, types::{Float, Vec3}};

const HEADER: &str = r#"<roblox xmlns:xmime="http://www.w3.org/2005/05/xmlmime" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:noNamespaceSchemaLocation="http://www.roblox.com/roblox.xsd" version="4">"#;

/// How `referent` attributes are generated. Random referents make the output
/// differ between runs and are only used when asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentStyle {
    #[default]
    Sequential,
    Random,
}

enum WriteError {
    Fmt,
    Value { path: String, property: String, message: String },
}

impl From<fmt::Error> for WriteError {
    fn from(_: fmt::Error) -> Self {
        WriteError::Fmt
    }
}

type WriteResult = Result<(), WriteError>;

pub fn write_document(tree: &InstanceTree, referents: ReferentStyle) -> CompileResult<Vec<u8>> {
    let referents = assign_referents(&tree.root, referents);
    let mut xml = String::new();

    let result = write_root(&tree.root, &referents, &mut xml);
    match result {
        Ok(()) => Ok(xml.into_bytes()),
        Err(WriteError::Value { path, property, message }) => Err(CompileError::Serialization { path, property, message }),
        Err(WriteError::Fmt) => Err(CompileError::Serialization { path: String::new(), property: String::new(), message: "formatter error".to_string() }),
    }
}

fn write_root(root: &InstanceNode, referents: &HashMap<NodeId, String>, xml: &mut String) -> WriteResult {
    writeln!(xml, "{}", HEADER)?;
    write_item(root, "", 1, referents, xml)?;
    writeln!(xml, "</roblox>")?;
    Ok(())
}

fn assign_referents(root: &InstanceNode, style: ReferentStyle) -> HashMap<NodeId, String> {
    let mut res = HashMap::new();
    let mut index = 0usize;
    let mut used = HashSet::new();
    let mut rng = rand::thread_rng();

    root.visit("", &mut |_, node| {
        let referent = match style {
            ReferentStyle::Sequential => format!("RBX{}", index),
            ReferentStyle::Random => loop {
                let candidate = format!("RBX{:032X}", rng.gen::<u128>());
                if used.insert(candidate.clone()) {
                    break candidate;
                }
            },
        };
        index += 1;
        res.insert(node.id, referent);
    });
    return res;
}

fn write_item(node: &InstanceNode, path: &str, depth: usize, referents: &HashMap<NodeId, String>, xml: &mut String) -> WriteResult {
    let tabs = indent(depth);
    let class = escape(&node.class, true).map_err(|message| value_error(path, "ClassName", message))?;
    writeln!(xml, r#"{}<Item class="{}" referent="{}">"#, tabs, class, referents[&node.id])?;
    writeln!(xml, "{}\t<Properties>", tabs)?;

    let name = escape(&node.name, false).map_err(|message| value_error(path, "Name", message))?;
    writeln!(xml, "{}\t\t<string name=\"Name\">{}</string>", tabs, name)?;
    for (property, value) in &node.properties {
        write_property(property, value, path, depth + 2, referents, xml)?;
    }

    writeln!(xml, "{}\t</Properties>", tabs)?;
    for child in &node.children {
        write_item(child, &child_path(path, &child.name), depth + 1, referents, xml)?;
    }
    writeln!(xml, "{}</Item>", tabs)?;
    Ok(())
}

fn write_property(property: &str, value: &Value, path: &str, depth: usize, referents: &HashMap<NodeId, String>, xml: &mut String) -> WriteResult {
    if property.is_empty() || property == "Name" {
        return Err(value_error(path, property, "reserved or empty property name".to_string()));
    }
    let tabs = indent(depth);
    let tag = value.type_name();
    let name = escape(property, true).map_err(|message| value_error(path, property, message))?;

    let text = match value {
        Value::String(v) | Value::ProtectedString(v) => escape(v, false).map_err(|message| value_error(path, property, message))?,
        Value::Bool(v) => v.to_string(),
        Value::Number(v) => number(*v).map_err(|message| value_error(path, property, message))?,
        Value::Int(v) => v.to_string(),
        Value::Binary(bytes) => STANDARD.encode(bytes),
        Value::Ref(None) => "null".to_string(),
        Value::Ref(Some(target)) => match referents.get(target) {
            Some(referent) => referent.clone(),
            None => return Err(value_error(path, property, format!("reference to {} does not resolve to a node in the tree", target))),
        },
        Value::Vector3(v) => return write_components(tag, &name, ["X", "Y", "Z"], v, &tabs, xml).map_err(|e| with_location(e, path, property)),
        Value::Color3(v) => return write_components(tag, &name, ["R", "G", "B"], v, &tabs, xml).map_err(|e| with_location(e, path, property)),
    };

    writeln!(xml, r#"{}<{} name="{}">{}</{}>"#, tabs, tag, name, text, tag)?;
    Ok(())
}

fn write_components(tag: &str, name: &str, labels: [&str; 3], v: &Vec3, tabs: &str, xml: &mut String) -> WriteResult {
    writeln!(xml, r#"{}<{} name="{}">"#, tabs, tag, name)?;
    for (label, component) in labels.iter().zip([v.x, v.y, v.z]) {
        let text = number(component).map_err(|message| WriteError::Value { path: String::new(), property: String::new(), message })?;
        writeln!(xml, "{}\t<{}>{}</{}>", tabs, label, text, label)?;
    }
    writeln!(xml, "{}</{}>", tabs, tag)?;
    Ok(())
}

fn with_location(error: WriteError, path: &str, property: &str) -> WriteError {
    match error {
        WriteError::Value { message, .. } => value_error(path, property, message),
        WriteError::Fmt => WriteError::Fmt,
    }
}

fn value_error(path: &str, property: &str, message: String) -> WriteError {
    WriteError::Value { path: path.to_string(), property: property.to_string(), message }
}

fn indent(depth: usize) -> String {
    "\t".repeat(depth)
}

/// Shortest decimal text that parses back to the same `f64`.
pub fn number(v: Float) -> Result<String, String> {
    if !v.is_finite() {
        return Err(format!("{} has no textual encoding", v));
    }
    Ok(format!("{}", v))
}

/// Escapes markup characters. Characters XML 1.0 cannot carry at all are an
/// error rather than being dropped.
pub fn escape(s: &str, attribute: bool) -> Result<String, String> {
    let mut res = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => res.push_str("&amp;"),
            '<' => res.push_str("&lt;"),
            '>' => res.push_str("&gt;"),
            '"' => res.push_str("&quot;"),
            '\r' => res.push_str("&#13;"),
            '\n' if attribute => res.push_str("&#10;"),
            '\t' if attribute => res.push_str("&#9;"),
            '\n' | '\t' => res.push(c),
            c if (c as u32) < 0x20 || c == '\u{FFFE}' || c == '\u{FFFF}' => {
                return Err(format!("character U+{:04X} cannot be represented in XML", c as u32));
            }
            c => res.push(c),
        }
    }
    Ok(res)
}
