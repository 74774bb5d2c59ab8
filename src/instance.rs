use std::{collections::{BTreeMap, HashMap, HashSet}, fmt};

use crate::types::Vec3;

/// Identity of a node within one compilation run. References between
/// instances point at ids, so renaming or moving a node keeps them intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    ProtectedString(String),
    Bool(bool),
    Number(f64),
    Int(i64),
    Ref(Option<NodeId>),
    Binary(Vec<u8>),
    Vector3(Vec3),
    Color3(Vec3),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::ProtectedString(_) => "ProtectedString",
            Value::Bool(_) => "bool",
            Value::Number(_) => "double",
            Value::Int(_) => "int64",
            Value::Ref(_) => "Ref",
            Value::Binary(_) => "BinaryString",
            Value::Vector3(_) => "Vector3",
            Value::Color3(_) => "Color3",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceNode {
    pub id: NodeId,
    pub class: String,
    pub name: String,
    pub properties: BTreeMap<String, Value>,
    pub children: Vec<InstanceNode>,
}

impl InstanceNode {
    pub fn child(&self, name: &str) -> Option<&InstanceNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut InstanceNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn visit<'a>(&'a self, path: &str, f: &mut impl FnMut(&str, &'a InstanceNode)) {
        f(path, self);
        for child in &self.children {
            child.visit(&child_path(path, &child.name), f);
        }
    }

    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut InstanceNode)) {
        f(self);
        for child in &mut self.children {
            child.visit_mut(f);
        }
    }

    pub fn count(&self) -> usize {
        1 + self.children.iter().map(|c| c.count()).sum::<usize>()
    }
}

// the root's own path is ""
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() { name.to_string() } else { format!("{}/{}", parent, name) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    EmptyName { path: String },
    SeparatorInName { path: String, name: String },
    DuplicateName { path: String },
    DuplicateNode { path: String },
    DanglingRef { path: String, property: String },
}

impl Violation {
    pub fn path(&self) -> &str {
        match self {
            Violation::EmptyName { path }
            | Violation::SeparatorInName { path, .. }
            | Violation::DuplicateName { path }
            | Violation::DuplicateNode { path }
            | Violation::DanglingRef { path, .. } => path,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::EmptyName { path } => write!(f, "child of '{}' has an empty name", path),
            Violation::SeparatorInName { path, name } => write!(f, "child '{}' of '{}' has '/' in its name", name, path),
            Violation::DuplicateName { path } => write!(f, "duplicate sibling name '{}'", path),
            Violation::DuplicateNode { path } => write!(f, "node '{}' appears more than once in the tree", path),
            Violation::DanglingRef { path, property } => write!(f, "property '{}' of '{}' references a node outside the tree", property, path),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTree {
    pub root: InstanceNode,
    next_id: u32,
}

impl InstanceTree {
    pub fn new(class: &str, name: &str) -> Self {
        let root = InstanceNode { id: NodeId(0), class: class.to_string(), name: name.to_string(), properties: BTreeMap::new(), children: vec![] };
        Self { root, next_id: 1 }
    }

    pub fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn new_node(&mut self, class: &str, name: &str) -> InstanceNode {
        InstanceNode { id: self.alloc_id(), class: class.to_string(), name: name.to_string(), properties: BTreeMap::new(), children: vec![] }
    }

    pub fn find(&self, id: NodeId) -> Option<&InstanceNode> {
        fn find_in(node: &InstanceNode, id: NodeId) -> Option<&InstanceNode> {
            if node.id == id {
                return Some(node);
            }
            node.children.iter().find_map(|c| find_in(c, id))
        }
        find_in(&self.root, id)
    }

    pub fn find_mut(&mut self, id: NodeId) -> Option<&mut InstanceNode> {
        fn find_in(node: &mut InstanceNode, id: NodeId) -> Option<&mut InstanceNode> {
            if node.id == id {
                return Some(node);
            }
            node.children.iter_mut().find_map(|c| find_in(c, id))
        }
        find_in(&mut self.root, id)
    }

    pub fn find_path(&self, path: &str) -> Option<&InstanceNode> {
        let mut node = &self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.child(segment)?;
        }
        Some(node)
    }

    pub fn path_of(&self, id: NodeId) -> Option<String> {
        let mut found = None;
        self.root.visit("", &mut |path, node| {
            if node.id == id && found.is_none() {
                found = Some(path.to_string());
            }
        });
        found
    }

    pub fn validate(&self) -> Result<(), Violation> {
        let mut seen = HashSet::new();
        check_node(&self.root, "", &mut seen)?;

        let mut dangling = None;
        self.root.visit("", &mut |path, node| {
            if dangling.is_some() {
                return;
            }
            for (property, value) in &node.properties {
                if let Value::Ref(Some(target)) = value {
                    if !seen.contains(target) {
                        dangling = Some(Violation::DanglingRef { path: path.to_string(), property: property.clone() });
                        return;
                    }
                }
            }
        });
        match dangling {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    pub fn graft(&mut self, mut node: InstanceNode) -> InstanceNode {
        let mut mapping = HashMap::new();
        node.visit_mut(&mut |n| {
            let id = NodeId(self.next_id);
            self.next_id += 1;
            mapping.insert(n.id, id);
            n.id = id;
        });
        remap_refs(&mut node, &mapping);
        node
    }

    /// Same tree with ids reassigned in pre-order. Two trees that differ only
    /// in id allocation compare equal once renumbered.
    pub fn renumbered(&self) -> InstanceTree {
        let mut root = self.root.clone();
        let mut mapping = HashMap::new();
        let mut next = 0;
        root.visit_mut(&mut |n| {
            mapping.insert(n.id, NodeId(next));
            n.id = NodeId(next);
            next += 1;
        });
        remap_refs(&mut root, &mapping);
        InstanceTree { root, next_id: next }
    }
}

fn check_node(node: &InstanceNode, path: &str, seen: &mut HashSet<NodeId>) -> Result<(), Violation> {
    if !seen.insert(node.id) {
        return Err(Violation::DuplicateNode { path: path.to_string() });
    }

    let mut names = HashSet::new();
    for child in &node.children {
        if child.name.is_empty() {
            return Err(Violation::EmptyName { path: path.to_string() });
        }
        if child.name.contains('/') {
            return Err(Violation::SeparatorInName { path: path.to_string(), name: child.name.clone() });
        }
        if !names.insert(child.name.as_str()) {
            return Err(Violation::DuplicateName { path: child_path(path, &child.name) });
        }
    }

    for child in &node.children {
        check_node(child, &child_path(path, &child.name), seen)?;
    }
    Ok(())
}

fn remap_refs(node: &mut InstanceNode, mapping: &HashMap<NodeId, NodeId>) {
    node.visit_mut(&mut |n| {
        for value in n.properties.values_mut() {
            if let Value::Ref(Some(target)) = value {
                // targets outside the subtree are cut
                *value = Value::Ref(mapping.get(target).copied());
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> InstanceTree {
        let mut tree = InstanceTree::new("Folder", "src");
        let mut shared = tree.new_node("Folder", "Shared");
        let util = tree.new_node("ModuleScript", "Util");
        let util_id = util.id;
        shared.children.push(util);
        let mut main = tree.new_node("Script", "Main");
        main.properties.insert("Target".into(), Value::Ref(Some(util_id)));
        tree.root.children.push(shared);
        tree.root.children.push(main);
        tree
    }

    #[test]
    fn lookup_by_path_and_id() {
        let tree = sample();
        let util = tree.find_path("Shared/Util").unwrap();
        assert_eq!(util.class, "ModuleScript");
        assert_eq!(tree.path_of(util.id).as_deref(), Some("Shared/Util"));
        assert_eq!(tree.find_path("").unwrap().name, "src");
        assert!(tree.find_path("Shared/Missing").is_none());
        assert_eq!(tree.root.count(), 4);
    }

    #[test]
    fn valid_tree_passes() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn duplicate_sibling_names_are_reported() {
        let mut tree = sample();
        let dup = tree.new_node("ModuleScript", "Util");
        tree.root.child_mut("Shared").unwrap().children.push(dup);
        assert_eq!(tree.validate(), Err(Violation::DuplicateName { path: "Shared/Util".into() }));
    }

    #[test]
    fn path_separator_in_name_is_reported() {
        let mut tree = sample();
        tree.root.child_mut("Shared").unwrap().child_mut("Util").unwrap().name = "Lib/Util".into();
        assert_eq!(tree.validate(), Err(Violation::SeparatorInName { path: "Shared".into(), name: "Lib/Util".into() }));
    }

    #[test]
    fn node_reachable_twice_is_reported() {
        let mut tree = sample();
        let mut copy = tree.root.children[0].clone();
        copy.name = "Copy".into();
        tree.root.children.push(copy);
        assert_eq!(tree.validate(), Err(Violation::DuplicateNode { path: "Copy".into() }));
    }

    #[test]
    fn removing_a_referenced_node_leaves_a_dangling_ref() {
        let mut tree = sample();
        tree.root.child_mut("Shared").unwrap().children.clear();
        assert_eq!(tree.validate(), Err(Violation::DanglingRef { path: "Main".into(), property: "Target".into() }));
    }

    #[test]
    fn graft_reassigns_ids_and_keeps_internal_refs() {
        let mut host = sample();
        let guest = sample();
        let grafted = host.graft(guest.root.clone());
        let util = grafted.child("Shared").unwrap().child("Util").unwrap().id;
        assert_eq!(grafted.child("Main").unwrap().properties["Target"], Value::Ref(Some(util)));

        let mut grafted = grafted;
        grafted.name = "Guest".into();
        host.root.children.push(grafted);
        assert_eq!(host.validate(), Ok(()));
    }

    #[test]
    fn renumbering_ignores_allocation_order() {
        let a = sample();
        let mut b = InstanceTree::new("Folder", "src");
        let mut main = b.new_node("Script", "Main");
        let mut shared = b.new_node("Folder", "Shared");
        let util = b.new_node("ModuleScript", "Util");
        main.properties.insert("Target".into(), Value::Ref(Some(util.id)));
        shared.children.push(util);
        b.root.children.push(shared);
        b.root.children.push(main);

        assert_ne!(a, b);
        assert_eq!(a.renumbered(), b.renumbered());
    }
}
