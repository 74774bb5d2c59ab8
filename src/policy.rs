use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

/// How a matched file's bytes become part of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Source,
    Text,
    Binary,
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unmatched {
    Ignore,
    Error,
}

/// File name pattern -> class. The `name` capture of `pattern` becomes the
/// instance name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub pattern: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub property: Option<String>,
    pub content: ContentKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MappingPolicy {
    pub rules: Vec<Rule>,
    pub directory_class: String,
    pub index_name: String,
    pub sidecar_pattern: String,
    pub ignore: Vec<String>,
    pub unmatched: Unmatched,
    pub embedded_properties: bool,
}

impl Rule {
    fn new(pattern: &str, class: &str, property: &str, content: ContentKind) -> Self {
        Self { pattern: pattern.to_string(), class: Some(class.to_string()), property: Some(property.to_string()), content }
    }
}

impl Default for MappingPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                Rule::new(r"^(?P<name>.+)\.server\.lua$", "Script", "Source", ContentKind::Source),
                Rule::new(r"^(?P<name>.+)\.client\.lua$", "LocalScript", "Source", ContentKind::Source),
                Rule::new(r"^(?P<name>.+)\.lua$", "ModuleScript", "Source", ContentKind::Source),
                Rule::new(r"^(?P<name>.+)\.txt$", "StringValue", "Value", ContentKind::Text),
                Rule { pattern: r"^(?P<name>.+)\.rbxmx$".to_string(), class: None, property: None, content: ContentKind::Model },
            ],
            directory_class: "Folder".to_string(),
            index_name: "init".to_string(),
            sidecar_pattern: r"^(?P<name>.+)\.meta\.json$".to_string(),
            ignore: vec![r"^\.".to_string()],
            unmatched: Unmatched::Ignore,
            embedded_properties: true,
        }
    }
}

/// What a rule decided for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMapping<'a> {
    pub name: String,
    pub class: Option<&'a str>,
    pub property: Option<&'a str>,
    pub content: ContentKind,
}

/// A `MappingPolicy` with every pattern compiled and every rule checked.
#[derive(Debug)]
pub struct CompiledPolicy {
    policy: MappingPolicy,
    rules: Vec<Regex>,
    sidecar: Regex,
    ignore: Vec<Regex>,
}

impl CompiledPolicy {
    pub fn new(policy: MappingPolicy) -> CompileResult<Self> {
        let mut rules = Vec::with_capacity(policy.rules.len());
        for rule in &policy.rules {
            if rule.content != ContentKind::Model && (rule.class.is_none() || rule.property.is_none()) {
                return Err(CompileError::Config(format!("rule '{}' needs both a class and a property", rule.pattern)));
            }
            rules.push(named_regex(&rule.pattern)?);
        }

        let sidecar = named_regex(&policy.sidecar_pattern)?;
        let mut ignore = Vec::with_capacity(policy.ignore.len());
        for pattern in &policy.ignore {
            ignore.push(Regex::new(pattern).map_err(|e| CompileError::Config(format!("bad ignore pattern '{}': {}", pattern, e)))?);
        }

        if policy.index_name.is_empty() || policy.directory_class.is_empty() {
            return Err(CompileError::Config("index_name and directory_class must not be empty".to_string()));
        }

        Ok(Self { policy, rules, sidecar, ignore })
    }

    pub fn directory_class(&self) -> &str {
        &self.policy.directory_class
    }

    pub fn index_name(&self) -> &str {
        &self.policy.index_name
    }

    pub fn unmatched(&self) -> Unmatched {
        self.policy.unmatched
    }

    pub fn embedded_properties(&self) -> bool {
        self.policy.embedded_properties
    }

    pub fn is_ignored(&self, file_name: &str) -> bool {
        self.ignore.iter().any(|re| re.is_match(file_name))
    }

    /// Instance name a sidecar file attaches to, if `file_name` is a sidecar.
    pub fn sidecar_target(&self, file_name: &str) -> Option<String> {
        capture_name(&self.sidecar, file_name)
    }

    pub fn map_file(&self, file_name: &str) -> Option<FileMapping<'_>> {
        for (re, rule) in self.rules.iter().zip(&self.policy.rules) {
            let Some(name) = capture_name(re, file_name) else { continue; };
            return Some(FileMapping {
                name,
                class: rule.class.as_deref(),
                property: rule.property.as_deref(),
                content: rule.content,
            });
        }
        None
    }
}

fn named_regex(pattern: &str) -> CompileResult<Regex> {
    let re = Regex::new(pattern).map_err(|e| CompileError::Config(format!("bad pattern '{}': {}", pattern, e)))?;
    if !re.capture_names().any(|n| n == Some("name")) {
        return Err(CompileError::Config(format!("pattern '{}' has no `name` capture group", pattern)));
    }
    Ok(re)
}

fn capture_name(re: &Regex, file_name: &str) -> Option<String> {
    let captures = re.captures(file_name)?;
    let name = captures.name("name")?.as_str();
    if name.is_empty() { None } else { Some(name.to_string()) }
}

#[cfg(test)]
mod test {
    use super::*;

    fn default_policy() -> CompiledPolicy {
        CompiledPolicy::new(MappingPolicy::default()).unwrap()
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = default_policy();

        let server = policy.map_file("Main.server.lua").unwrap();
        assert_eq!(server.name, "Main");
        assert_eq!(server.class, Some("Script"));

        let module = policy.map_file("Util.lua").unwrap();
        assert_eq!(module.name, "Util");
        assert_eq!(module.class, Some("ModuleScript"));
        assert_eq!(module.property, Some("Source"));
        assert_eq!(module.content, ContentKind::Source);

        assert_eq!(policy.map_file("Asset.rbxmx").unwrap().content, ContentKind::Model);
        assert!(policy.map_file("README.md").is_none());
        assert!(policy.map_file(".lua").is_none());
    }

    #[test]
    fn sidecars_and_ignores() {
        let policy = default_policy();
        assert_eq!(policy.sidecar_target("Foo.meta.json").as_deref(), Some("Foo"));
        assert_eq!(policy.sidecar_target("Foo.lua"), None);
        assert!(policy.is_ignored(".git"));
        assert!(!policy.is_ignored("Foo.lua"));
    }

    #[test]
    fn policy_loads_from_json() {
        let policy: MappingPolicy = serde_json::from_str(r#"{
            "rules": [{ "pattern": "^(?P<name>.+)\\.luau$", "class": "ModuleScript", "property": "Source", "content": "source" }],
            "unmatched": "error"
        }"#).unwrap();
        let policy = CompiledPolicy::new(policy).unwrap();
        assert_eq!(policy.map_file("A.luau").unwrap().name, "A");
        assert!(policy.map_file("A.lua").is_none());
        assert_eq!(policy.unmatched(), Unmatched::Error);
        assert_eq!(policy.index_name(), "init");
    }

    #[test]
    fn pattern_without_name_group_is_rejected() {
        let mut policy = MappingPolicy::default();
        policy.rules[0].pattern = r"\.lua$".to_string();
        assert!(matches!(CompiledPolicy::new(policy), Err(CompileError::Config(_))));
    }
}
