use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use cgmath::vec3;
use quick_xml::{events::{BytesStart, Event}, Reader};
use thiserror::Error;

use crate::{instance::{InstanceNode, InstanceTree, NodeId, Value}, types::{Float, Vec3}};

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("{0}")]
    Format(String),
}

fn format_error(message: impl Into<String>) -> ReadError {
    ReadError::Format(message.into())
}

/// Parses a model document holding exactly one top-level item.
pub fn read_document(text: &str) -> Result<InstanceTree, ReadError> {
    let mut parser = Parser { reader: Reader::from_str(text), tree: InstanceTree::new("Folder", ""), referents: HashMap::new(), pending: vec![] };
    let mut items = parser.read_roblox()?;

    if items.len() != 1 {
        return Err(format_error(format!("expected exactly one top-level item, found {}", items.len())));
    }
    let Some(root) = items.pop() else { return Err(format_error("document has no items")); };

    let Parser { mut tree, referents, pending, .. } = parser;
    tree.root = root;
    for (node, property, referent) in pending {
        let Some(target) = referents.get(&referent).copied() else {
            return Err(format_error(format!("unknown referent '{}' in property '{}'", referent, property)));
        };
        if let Some(node) = tree.find_mut(node) {
            node.properties.insert(property, Value::Ref(Some(target)));
        }
    }
    Ok(tree)
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
    tree: InstanceTree,
    referents: HashMap<String, NodeId>,
    pending: Vec<(NodeId, String, String)>,
}

impl<'a> Parser<'a> {
    fn read_roblox(&mut self) -> Result<Vec<InstanceNode>, ReadError> {
        loop {
            match self.reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == b"roblox" => break,
                Event::Empty(e) if e.name().as_ref() == b"roblox" => return Ok(vec![]),
                Event::Decl(_) | Event::Comment(_) | Event::DocType(_) | Event::PI(_) | Event::Text(_) => continue,
                Event::Eof => return Err(format_error("missing <roblox> element")),
                _ => return Err(format_error("unexpected content before <roblox>")),
            }
        }

        let mut items = vec![];
        loop {
            match self.reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == b"Item" => items.push(self.read_item(&e)?),
                Event::Start(e) => self.skip(&e)?,
                Event::End(e) if e.name().as_ref() == b"roblox" => break,
                Event::Eof => return Err(format_error("unterminated <roblox> element")),
                _ => continue,
            }
        }
        Ok(items)
    }

    fn read_item(&mut self, start: &BytesStart) -> Result<InstanceNode, ReadError> {
        let class = attribute(start, b"class")?.ok_or_else(|| format_error("<Item> without a class"))?;
        let mut node = self.tree.new_node(&class, "");
        if let Some(referent) = attribute(start, b"referent")? {
            if self.referents.insert(referent.clone(), node.id).is_some() {
                return Err(format_error(format!("duplicate referent '{}'", referent)));
            }
        }

        let mut named = false;
        loop {
            match self.reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == b"Properties" => named |= self.read_properties(&mut node)?,
                Event::Start(e) if e.name().as_ref() == b"Item" => {
                    let child = self.read_item(&e)?;
                    node.children.push(child);
                }
                Event::Start(e) => self.skip(&e)?,
                Event::End(e) if e.name().as_ref() == b"Item" => break,
                Event::Eof => return Err(format_error(format!("unterminated <Item class=\"{}\">", class))),
                _ => continue,
            }
        }

        if !named {
            return Err(format_error(format!("<Item class=\"{}\"> has no Name property", class)));
        }
        Ok(node)
    }

    /// Returns whether the block set the node's name.
    fn read_properties(&mut self, node: &mut InstanceNode) -> Result<bool, ReadError> {
        let mut named = false;
        loop {
            let (start, empty) = match self.reader.read_event()? {
                Event::Start(e) => (e.into_owned(), false),
                Event::Empty(e) => (e.into_owned(), true),
                Event::End(e) if e.name().as_ref() == b"Properties" => break,
                Event::Eof => return Err(format_error("unterminated <Properties>")),
                _ => continue,
            };

            let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
            let name = attribute(&start, b"name")?.ok_or_else(|| format_error(format!("<{}> property without a name", tag)))?;

            if tag == "Vector3" || tag == "Color3" {
                let components = if empty { return Err(format_error(format!("empty {} property '{}'", tag, name))) } else { self.read_components(&tag)? };
                let value = if tag == "Vector3" { Value::Vector3(components) } else { Value::Color3(components) };
                node.properties.insert(name, value);
                continue;
            }

            let text = if empty { String::new() } else { self.read_text(&tag)? };
            if name == "Name" && tag == "string" {
                node.name = text;
                named = true;
                continue;
            }

            let value = match tag.as_str() {
                "string" => Value::String(text),
                "ProtectedString" => Value::ProtectedString(text),
                "bool" => Value::Bool(parse_bool(&text)?),
                "double" | "float" => Value::Number(parse_number(&text)?),
                "int" | "int64" => Value::Int(text.trim().parse().map_err(|_| format_error(format!("'{}' is not an integer", text)))?),
                "BinaryString" => {
                    let compact: String = text.split_whitespace().collect();
                    Value::Binary(STANDARD.decode(compact.as_bytes()).map_err(|e| format_error(format!("property '{}': {}", name, e)))?)
                }
                "Ref" => {
                    let referent = text.trim();
                    if referent != "null" && !referent.is_empty() {
                        self.pending.push((node.id, name.clone(), referent.to_string()));
                    }
                    Value::Ref(None)
                }
                other => return Err(format_error(format!("unsupported property type '{}' for '{}'", other, name))),
            };
            node.properties.insert(name, value);
        }
        Ok(named)
    }

    fn read_components(&mut self, tag: &str) -> Result<Vec3, ReadError> {
        let mut values: HashMap<String, Float> = HashMap::new();
        loop {
            match self.reader.read_event()? {
                Event::Start(e) => {
                    let label = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let text = self.read_text(&label)?;
                    values.insert(label, parse_number(&text)?);
                }
                Event::End(e) if e.name().as_ref() == tag.as_bytes() => break,
                Event::Eof => return Err(format_error(format!("unterminated <{}>", tag))),
                _ => continue,
            }
        }

        let labels = if tag == "Vector3" { ["X", "Y", "Z"] } else { ["R", "G", "B"] };
        let mut res = [0.0; 3];
        for (slot, label) in res.iter_mut().zip(labels) {
            *slot = *values.get(label).ok_or_else(|| format_error(format!("{} is missing <{}>", tag, label)))?;
        }
        Ok(vec3(res[0], res[1], res[2]))
    }

    fn read_text(&mut self, tag: &str) -> Result<String, ReadError> {
        let mut res = String::new();
        loop {
            match self.reader.read_event()? {
                Event::Text(e) => res.push_str(&e.unescape()?),
                Event::CData(e) => {
                    let bytes = e.into_inner();
                    res.push_str(std::str::from_utf8(&bytes).map_err(|e| format_error(e.to_string()))?);
                }
                Event::End(e) if e.name().as_ref() == tag.as_bytes() => break,
                Event::Start(_) | Event::Empty(_) => return Err(format_error(format!("unexpected element inside <{}>", tag))),
                Event::Eof => return Err(format_error(format!("unterminated <{}>", tag))),
                _ => continue,
            }
        }
        Ok(res)
    }

    fn skip(&mut self, start: &BytesStart) -> Result<(), ReadError> {
        let end = start.to_end().into_owned();
        self.reader.read_to_end(end.name())?;
        Ok(())
    }
}

fn attribute(start: &BytesStart, key: &[u8]) -> Result<Option<String>, ReadError> {
    for attr in start.attributes() {
        let attr = attr.map_err(|e| format_error(e.to_string()))?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn parse_bool(text: &str) -> Result<bool, ReadError> {
    match text.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format_error(format!("'{}' is not a bool", other))),
    }
}

fn parse_number(text: &str) -> Result<Float, ReadError> {
    text.trim().parse().map_err(|_| format_error(format!("'{}' is not a number", text)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rbxmx::writer::{write_document, ReferentStyle};

    #[test]
    fn reads_document_written_by_writer() {
        let mut tree = InstanceTree::new("Folder", "src");
        let mut util = tree.new_node("ModuleScript", "Util");
        util.properties.insert("Source".into(), Value::ProtectedString("return {\r\n\t\"a\" & 'b'\n}".into()));
        util.properties.insert("Blob".into(), Value::Binary(vec![255, 0, 7]));
        util.properties.insert("Offset".into(), Value::Vector3(vec3(0.1, -2.0, 3e-9)));
        util.properties.insert("Tint".into(), Value::Color3(vec3(1.0, 0.5, 0.0)));
        util.properties.insert("Padding".into(), Value::String("  spaced  ".into()));
        util.properties.insert("Empty".into(), Value::String(String::new()));
        util.properties.insert("Count".into(), Value::Int(i64::MIN));
        let util_id = util.id;
        let mut main = tree.new_node("Script", "Main");
        main.properties.insert("Module".into(), Value::Ref(Some(util_id)));
        main.properties.insert("Nothing".into(), Value::Ref(None));
        main.properties.insert("Disabled".into(), Value::Bool(false));
        tree.root.children.push(util);
        tree.root.children.push(main);

        let bytes = write_document(&tree, ReferentStyle::Sequential).unwrap();
        let read = read_document(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(read.renumbered(), tree.renumbered());
    }

    #[test]
    fn accepts_foreign_documents() {
        let text = r#"<?xml version="1.0" encoding="utf-8"?>
<roblox version="4">
  <Meta name="ExplicitAutoJoints">true</Meta>
  <Item class="Part" referent="A">
    <Properties>
      <string name="Name">Brick</string>
      <float name="Transparency">0.5</float>
      <ProtectedString name="Notes"><![CDATA[a < b]]></ProtectedString>
      <string name="Blank"/>
    </Properties>
  </Item>
</roblox>"#;
        let tree = read_document(text).unwrap();
        assert_eq!(tree.root.name, "Brick");
        assert_eq!(tree.root.class, "Part");
        assert_eq!(tree.root.properties["Transparency"], Value::Number(0.5));
        assert_eq!(tree.root.properties["Notes"], Value::ProtectedString("a < b".into()));
        assert_eq!(tree.root.properties["Blank"], Value::String(String::new()));
    }

    #[test]
    fn rejects_malformed_documents() {
        for text in [
            "<model/>",
            r#"<roblox version="4"></roblox>"#,
            r#"<roblox><Item class="A"><Properties></Properties></Item></roblox>"#,
            r#"<roblox><Item class="A"><Properties><string name="Name">a</string><Ref name="R">RBX9</Ref></Properties></Item></roblox>"#,
            r#"<roblox><Item class="A"><Properties><string name="Name">a</string><UDim2 name="U">1</UDim2></Properties></Item></roblox>"#,
            r#"<roblox><Item class="A"><Properties><string name="Name">a</string></Properties></Item><Item class="B"><Properties><string name="Name">b</string></Properties></Item></roblox>"#,
        ] {
            assert!(read_document(text).is_err(), "accepted {}", text);
        }
    }
}
