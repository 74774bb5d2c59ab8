use std::{collections::BTreeMap, path::{Path, PathBuf}};

use log::debug;

use crate::{
    error::{CompileError, CompileResult},
    instance::{child_path, InstanceNode, InstanceTree, NodeId, Value, Violation},
    policy::{CompiledPolicy, ContentKind, FileMapping, Unmatched},
    rbxmx,
    sidecar::{self, Sidecar, SidecarProperty},
    source::{SourceDirectory, SourceFile, SourceNode},
};

/// Turns a source tree into an instance tree. The result already satisfies
/// every tree invariant.
pub fn build(source: &SourceDirectory, policy: &CompiledPolicy, root_name: Option<&str>) -> CompileResult<InstanceTree> {
    let mut builder = Builder { policy, tree: InstanceTree::new(policy.directory_class(), ""), pending: vec![] };
    let name = root_name.unwrap_or(&source.name).to_string();
    let root = builder.build_directory(source, name, "", None)?;

    let Builder { mut tree, pending, .. } = builder;
    tree.root = root;
    resolve_refs(&mut tree, pending)?;

    match tree.validate() {
        Ok(()) => Ok(tree),
        Err(Violation::DuplicateName { path }) => Err(CompileError::NameConflict { path, processor: None }),
        Err(violation) => Err(CompileError::parse(violation.path(), violation.to_string())),
    }
}

struct PendingRef {
    node: NodeId,
    property: String,
    target: String,
    sidecar: PathBuf,
}

/// `-- Name: X` / `-- ClassName: Y` lines at the top of a script.
#[derive(Debug, Default, PartialEq)]
struct Header {
    name: Option<String>,
    class: Option<String>,
}

struct FileEntry<'s, 'p> {
    file: &'s SourceFile,
    mapping: FileMapping<'p>,
    text: Option<String>,
    header: Header,
}

enum Entry<'s, 'p> {
    File(FileEntry<'s, 'p>),
    Directory(&'s SourceDirectory),
}

struct Builder<'p> {
    policy: &'p CompiledPolicy,
    tree: InstanceTree,
    pending: Vec<PendingRef>,
}

impl<'p> Builder<'p> {
    fn build_directory(&mut self, dir: &SourceDirectory, name: String, path: &str, outer: Option<Sidecar>) -> CompileResult<InstanceNode> {
        let mut sidecars: BTreeMap<String, Sidecar> = BTreeMap::new();
        let mut entries: BTreeMap<String, Entry> = BTreeMap::new();
        let mut index: Option<FileEntry> = None;

        for child in &dir.children {
            if self.policy.is_ignored(child.name()) {
                debug!("ignoring {}", child.path().display());
                continue;
            }

            let (entry_name, entry) = match child {
                SourceNode::Directory(sub) => (sub.name.clone(), Entry::Directory(sub)),
                SourceNode::File(file) => {
                    if let Some(target) = self.policy.sidecar_target(&file.name) {
                        let parsed = sidecar::parse(&file.path, &file.contents)?;
                        if sidecars.insert(target.clone(), parsed).is_some() {
                            return Err(CompileError::parse(&file.path, format!("second metadata file for '{}'", target)));
                        }
                        continue;
                    }

                    let Some(mapping) = self.policy.map_file(&file.name) else {
                        match self.policy.unmatched() {
                            Unmatched::Ignore => {
                                debug!("no rule for {}, skipping", file.path.display());
                                continue;
                            }
                            Unmatched::Error => return Err(CompileError::parse(&file.path, "no mapping rule matches this file")),
                        }
                    };

                    let entry = self.read_file(file, mapping)?;
                    if entry.mapping.name == self.policy.index_name() {
                        if index.is_some() {
                            return Err(CompileError::NameConflict { path: child_path(path, self.policy.index_name()), processor: None });
                        }
                        index = Some(entry);
                        continue;
                    }

                    let entry_name = entry.header.name.clone().unwrap_or_else(|| entry.mapping.name.clone());
                    (entry_name, Entry::File(entry))
                }
            };

            if entries.contains_key(&entry_name) {
                return Err(CompileError::NameConflict { path: child_path(path, &entry_name), processor: None });
            }
            entries.insert(entry_name, entry);
        }

        let mut node = self.tree.new_node(self.policy.directory_class(), &name);
        if let Some(index) = index {
            if index.header.name.is_some() {
                return Err(CompileError::parse(&index.file.path, "an index file cannot rename its directory"));
            }
            if index.mapping.content == ContentKind::Model {
                return Err(CompileError::parse(&index.file.path, "a model file cannot be a directory index"));
            }
            self.fill_from_file(&mut node, index)?;
        }

        let inner = sidecars.remove(self.policy.index_name());
        let metadata = match (outer, inner) {
            (Some(outer), Some(inner)) => {
                return Err(CompileError::parse(&inner.path, format!("'{}' already has metadata in {}", path, outer.path.display())));
            }
            (outer, inner) => outer.or(inner),
        };
        if let Some(metadata) = metadata {
            self.apply_sidecar(&mut node, metadata)?;
        }

        // a file renamed by its header still pairs with metadata named after the file
        for (entry_name, entry) in &entries {
            let Entry::File(file) = entry else { continue; };
            let stem = &file.mapping.name;
            if stem == entry_name || entries.contains_key(stem) {
                continue;
            }
            let Some(sidecar) = sidecars.remove(stem) else { continue; };
            if let Some(other) = sidecars.get(entry_name) {
                return Err(CompileError::parse(&sidecar.path, format!("'{}' already has metadata in {}", child_path(path, entry_name), other.path.display())));
            }
            sidecars.insert(entry_name.clone(), sidecar);
        }

        for (entry_name, entry) in entries {
            let sidecar = sidecars.remove(&entry_name);
            let entry_path = child_path(path, &entry_name);
            let child = match entry {
                Entry::Directory(sub) => self.build_directory(sub, entry_name, &entry_path, sidecar)?,
                Entry::File(file) => self.build_file(file, entry_name, sidecar)?,
            };
            node.children.push(child);
        }

        if let Some(orphan) = sidecars.into_values().next() {
            return Err(CompileError::parse(&orphan.path, "metadata file has no matching sibling"));
        }

        return Ok(node);
    }

    fn read_file<'s>(&self, file: &'s SourceFile, mapping: FileMapping<'p>) -> CompileResult<FileEntry<'s, 'p>> {
        let text = match mapping.content {
            ContentKind::Binary => None,
            _ => Some(String::from_utf8(file.contents.clone()).map_err(|_| CompileError::parse(&file.path, "file is not valid UTF-8"))?),
        };

        let header = match (&text, mapping.content) {
            (Some(text), ContentKind::Source) if self.policy.embedded_properties() => parse_header(text).map_err(|message| CompileError::parse(&file.path, message))?,
            _ => Header::default(),
        };
        if let Some(name) = &header.name {
            check_name(name, &file.path)?;
        }

        Ok(FileEntry { file, mapping, text, header })
    }

    fn build_file(&mut self, entry: FileEntry, name: String, sidecar: Option<Sidecar>) -> CompileResult<InstanceNode> {
        let mut node = if entry.mapping.content == ContentKind::Model {
            let text = entry.text.as_deref().unwrap_or_default();
            let model = rbxmx::read_document(text).map_err(|e| CompileError::parse(&entry.file.path, e.to_string()))?;
            let mut node = self.tree.graft(model.root);
            node.name = name;
            let mut bad_name = None;
            node.visit("", &mut |_, n| {
                if bad_name.is_none() && n.name.contains('/') {
                    bad_name = Some(n.name.clone());
                }
            });
            if let Some(bad_name) = bad_name {
                check_name(&bad_name, &entry.file.path)?;
            }
            node
        } else {
            let mut node = self.tree.new_node("", &name);
            self.fill_from_file(&mut node, entry)?;
            node
        };

        if let Some(sidecar) = sidecar {
            self.apply_sidecar(&mut node, sidecar)?;
        }
        Ok(node)
    }

    /// Class and content property of a script/value file, used both for plain
    /// files and for directory index files.
    fn fill_from_file(&mut self, node: &mut InstanceNode, entry: FileEntry) -> CompileResult<()> {
        let FileEntry { file, mapping, text, header } = entry;
        let class = header.class.as_deref().or(mapping.class).unwrap_or(self.policy.directory_class());
        node.class = class.to_string();

        let Some(property) = mapping.property else { return Ok(()); };
        let value = match (mapping.content, text) {
            (ContentKind::Source, Some(text)) => Value::ProtectedString(text),
            (ContentKind::Text, Some(text)) => Value::String(text),
            (ContentKind::Binary, _) => Value::Binary(file.contents.clone()),
            _ => return Err(CompileError::parse(&file.path, "file content cannot be mapped to a property")),
        };
        node.properties.insert(property.to_string(), value);
        Ok(())
    }

    fn apply_sidecar(&mut self, node: &mut InstanceNode, sidecar: Sidecar) -> CompileResult<()> {
        let Sidecar { path, class_name, properties, overrides } = sidecar;
        if let Some(class_name) = class_name {
            node.class = class_name;
        }

        for (property, value) in properties {
            if node.properties.contains_key(&property) {
                return Err(CompileError::parse(&path, format!("property '{}' is already inferred, list it under `overrides` to replace it", property)));
            }
            self.set_property(node, property, value, &path);
        }
        for (property, value) in overrides {
            self.set_property(node, property, value, &path);
        }
        Ok(())
    }

    fn set_property(&mut self, node: &mut InstanceNode, property: String, value: SidecarProperty, sidecar: &Path) {
        match value {
            SidecarProperty::Value(value) => {
                node.properties.insert(property, value);
            }
            SidecarProperty::Ref(target) => {
                node.properties.insert(property.clone(), Value::Ref(None));
                self.pending.push(PendingRef { node: node.id, property, target, sidecar: sidecar.to_path_buf() });
            }
        }
    }
}

fn resolve_refs(tree: &mut InstanceTree, pending: Vec<PendingRef>) -> CompileResult<()> {
    for reference in pending {
        let Some(target) = tree.find_path(&reference.target).map(|n| n.id) else {
            return Err(CompileError::parse(&reference.sidecar, format!("reference '{}' does not resolve to an instance", reference.target)));
        };
        if let Some(node) = tree.find_mut(reference.node) {
            node.properties.insert(reference.property, Value::Ref(Some(target)));
        }
    }
    Ok(())
}

fn check_name(name: &str, file: &Path) -> CompileResult<()> {
    if name.contains('/') {
        return Err(CompileError::parse(file, format!("instance name '{}' contains '/'", name)));
    }
    Ok(())
}

fn parse_header(text: &str) -> Result<Header, String> {
    let mut header = Header::default();
    for line in text.lines() {
        let Some(comment) = line.trim().strip_prefix("--") else { break; };
        let Some((key, value)) = comment.split_once(':') else { break; };
        let slot = match key.trim() {
            "Name" => &mut header.name,
            "ClassName" => &mut header.class,
            _ => break,
        };
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("empty `{}` header", key.trim()));
        }
        *slot = Some(value.to_string());
    }
    Ok(header)
}
