use std::{collections::BTreeMap, path::{Path, PathBuf}};

use base64::{engine::general_purpose::STANDARD, Engine};
use cgmath::vec3;
use serde::Deserialize;

use crate::{error::{CompileError, CompileResult}, instance::Value};

/// A property value as written in a `.meta.json` file. Plain JSON scalars map
/// directly, everything else is a single-key object naming the type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SidecarValue {
    Bool(bool),
    Number(f64),
    String(String),
    Typed(TypedValue),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum TypedValue {
    Int(i64),
    Vector3([f64; 3]),
    Color3([f64; 3]),
    Ref(String),
    BinaryString(String),
    ProtectedString(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSidecar {
    class_name: Option<String>,
    #[serde(default)]
    properties: BTreeMap<String, SidecarValue>,
    #[serde(default)]
    overrides: BTreeMap<String, SidecarValue>,
}

/// Property value after decoding; references stay as paths until the whole
/// tree exists.
#[derive(Debug, Clone, PartialEq)]
pub enum SidecarProperty {
    Value(Value),
    Ref(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sidecar {
    pub path: PathBuf,
    pub class_name: Option<String>,
    pub properties: BTreeMap<String, SidecarProperty>,
    pub overrides: BTreeMap<String, SidecarProperty>,
}

pub fn parse(path: &Path, contents: &[u8]) -> CompileResult<Sidecar> {
    let raw: RawSidecar = serde_json::from_slice(contents).map_err(|e| CompileError::parse(path, e.to_string()))?;

    if let Some(class_name) = &raw.class_name {
        if class_name.is_empty() {
            return Err(CompileError::parse(path, "className must not be empty"));
        }
    }

    Ok(Sidecar {
        path: path.to_path_buf(),
        class_name: raw.class_name,
        properties: convert_all(path, raw.properties)?,
        overrides: convert_all(path, raw.overrides)?,
    })
}

fn convert_all(path: &Path, values: BTreeMap<String, SidecarValue>) -> CompileResult<BTreeMap<String, SidecarProperty>> {
    let mut res = BTreeMap::new();
    for (name, value) in values {
        if name == "Name" {
            return Err(CompileError::parse(path, "`Name` comes from the file name and cannot be set here"));
        }
        let property = convert(path, &name, value)?;
        res.insert(name, property);
    }
    return Ok(res);
}

fn convert(path: &Path, name: &str, value: SidecarValue) -> CompileResult<SidecarProperty> {
    let value = match value {
        SidecarValue::Bool(v) => Value::Bool(v),
        SidecarValue::Number(v) => Value::Number(v),
        SidecarValue::String(v) => Value::String(v),
        SidecarValue::Typed(TypedValue::Int(v)) => Value::Int(v),
        SidecarValue::Typed(TypedValue::Vector3([x, y, z])) => Value::Vector3(vec3(x, y, z)),
        SidecarValue::Typed(TypedValue::Color3([r, g, b])) => Value::Color3(vec3(r, g, b)),
        SidecarValue::Typed(TypedValue::ProtectedString(v)) => Value::ProtectedString(v),
        SidecarValue::Typed(TypedValue::BinaryString(v)) => {
            let bytes = STANDARD.decode(v.as_bytes())
                .map_err(|e| CompileError::parse(path, format!("property '{}' is not valid base64: {}", name, e)))?;
            Value::Binary(bytes)
        }
        SidecarValue::Typed(TypedValue::Ref(target)) => return Ok(SidecarProperty::Ref(target)),
    };
    Ok(SidecarProperty::Value(value))
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_str(json: &str) -> CompileResult<Sidecar> {
        parse(Path::new("Foo.meta.json"), json.as_bytes())
    }

    #[test]
    fn parses_plain_and_typed_values() {
        let sidecar = parse_str(r#"{
            "className": "Configuration",
            "properties": {
                "Enabled": true,
                "Speed": 1.5,
                "Label": "hi",
                "Count": { "Int": 3 },
                "Offset": { "Vector3": [0, 1, 2] },
                "Tint": { "Color3": [1, 0.5, 0] },
                "Blob": { "BinaryString": "AAEC" },
                "Target": { "Ref": "Shared/Util" }
            },
            "overrides": { "Source": { "ProtectedString": "return nil" } }
        }"#).unwrap();

        assert_eq!(sidecar.class_name.as_deref(), Some("Configuration"));
        assert_eq!(sidecar.properties["Enabled"], SidecarProperty::Value(Value::Bool(true)));
        assert_eq!(sidecar.properties["Speed"], SidecarProperty::Value(Value::Number(1.5)));
        assert_eq!(sidecar.properties["Label"], SidecarProperty::Value(Value::String("hi".into())));
        assert_eq!(sidecar.properties["Count"], SidecarProperty::Value(Value::Int(3)));
        assert_eq!(sidecar.properties["Offset"], SidecarProperty::Value(Value::Vector3(vec3(0.0, 1.0, 2.0))));
        assert_eq!(sidecar.properties["Tint"], SidecarProperty::Value(Value::Color3(vec3(1.0, 0.5, 0.0))));
        assert_eq!(sidecar.properties["Blob"], SidecarProperty::Value(Value::Binary(vec![0, 1, 2])));
        assert_eq!(sidecar.properties["Target"], SidecarProperty::Ref("Shared/Util".into()));
        assert_eq!(sidecar.overrides["Source"], SidecarProperty::Value(Value::ProtectedString("return nil".into())));
    }

    #[test]
    fn empty_object_is_valid() {
        let sidecar = parse_str("{}").unwrap();
        assert!(sidecar.class_name.is_none());
        assert!(sidecar.properties.is_empty());
    }

    #[test]
    fn malformed_metadata_is_parse_error() {
        for json in [
            "{",
            r#"{ "unknown": 1 }"#,
            r#"{ "properties": { "Name": "x" } }"#,
            r#"{ "properties": { "Blob": { "BinaryString": "***" } } }"#,
            r#"{ "properties": { "Bad": { "Vector3": [1, 2] } } }"#,
            r#"{ "className": "" }"#,
        ] {
            let err = parse_str(json).unwrap_err();
            let CompileError::Parse { path, .. } = err else { panic!("expected parse error for {}", json) };
            assert_eq!(path, PathBuf::from("Foo.meta.json"));
        }
    }
}
