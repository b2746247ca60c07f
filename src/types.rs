//! Registered record types and their ownership graph.
//!
//! `(deftype Name (field type [strong|weak|untraced]) ...)` adds a type. Every
//! field whose type is another record is scannable and starts out strong.
//! After each registration a depth-first search over the ownership graph
//! demotes back edges to weak, so strong fields never form a cycle.

use crate::Error;
use crate::ast::Value;
use std::collections::HashMap;
use std::rc::Rc;

/// Deepest DFS path followed before edges are demoted without exploring
pub const DFS_PATH_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStrength {
    Strong,
    Weak,
    /// Never visited by scanners or release routines
    Untraced,
}

impl FieldStrength {
    fn from_name(name: &str) -> Option<FieldStrength> {
        match name {
            "strong" => Some(FieldStrength::Strong),
            "weak" => Some(FieldStrength::Weak),
            "untraced" => Some(FieldStrength::Untraced),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldStrength::Strong => "strong",
            FieldStrength::Weak => "weak",
            FieldStrength::Untraced => "untraced",
        }
    }
}

/// A field as written in `deftype`
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: Rc<str>,
    pub type_name: Rc<str>,
    pub annotation: Option<FieldStrength>,
}

impl FieldSpec {
    pub fn parse(spec: &Value) -> Result<FieldSpec, Error> {
        let invalid = || Error::TypeMismatch(format!("field must be (name type [strength]), got {spec}"));
        let items = spec.list_items().ok_or_else(invalid)?;
        let (name, type_name, annotation) = match items.as_slice() {
            [Value::Sym(name), Value::Sym(type_name)] => (name, type_name, None),
            [Value::Sym(name), Value::Sym(type_name), Value::Sym(strength)] => {
                let strength = FieldStrength::from_name(strength)
                    .ok_or_else(|| Error::TypeMismatch(format!("unknown field strength: {strength}")))?;
                (name, type_name, Some(strength))
            }
            _ => return Err(invalid()),
        };
        Ok(FieldSpec {
            name: name.clone(),
            type_name: type_name.clone(),
            annotation,
        })
    }
}

pub fn is_scalar_type(name: &str) -> bool {
    matches!(name, "int" | "Int")
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: Rc<str>,
    pub type_name: Rc<str>,
    /// Holds a reference to another record
    pub scannable: bool,
    pub strength: FieldStrength,
    /// Strength was written explicitly and is never reclassified
    pub pinned: bool,
}

impl FieldDef {
    pub fn is_weak(&self) -> bool {
        self.strength == FieldStrength::Weak
    }

    /// Followed by scanners and release routines
    pub fn is_traced(&self) -> bool {
        self.scannable && self.strength == FieldStrength::Strong
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub name: Rc<str>,
    pub fields: Vec<FieldDef>,
    /// Some field refers back to this type
    pub recursive: bool,
}

impl TypeDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| &*f.name == name)
    }

    pub fn weak_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_weak())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipEdge {
    pub from: Rc<str>,
    pub field: Rc<str>,
    pub to: Rc<str>,
    pub back_edge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<TypeDef>,
    index: HashMap<Rc<str>, usize>,
    edges: Vec<OwnershipEdge>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a type, then recompute field strengths for the whole
    /// registry.
    pub fn register(&mut self, name: &Rc<str>, specs: Vec<FieldSpec>) -> Result<(), Error> {
        let mut fields: Vec<FieldDef> = Vec::with_capacity(specs.len());
        for spec in specs {
            if fields.iter().any(|f| f.name == spec.name) {
                return Err(Error::EvalError(format!(
                    "deftype {name}: duplicate field {}",
                    spec.name
                )));
            }
            let scannable = !is_scalar_type(&spec.type_name);
            fields.push(FieldDef {
                name: spec.name,
                type_name: spec.type_name,
                scannable,
                strength: spec.annotation.unwrap_or(FieldStrength::Strong),
                pinned: spec.annotation.is_some(),
            });
        }
        let recursive = fields.iter().any(|f| f.type_name == *name);
        let def = TypeDef {
            name: name.clone(),
            fields,
            recursive,
        };
        match self.index.get(name) {
            Some(&i) => {
                tracing::debug!(type_name = %name, "redefining type");
                self.types[i] = def;
            }
            None => {
                self.index.insert(name.clone(), self.types.len());
                self.types.push(def);
            }
        }
        self.detect_back_edges();
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.index.get(name).map(|&i| &self.types[i])
    }

    /// Types in registration order
    pub fn types(&self) -> &[TypeDef] {
        &self.types
    }

    pub fn edges(&self) -> &[OwnershipEdge] {
        &self.edges
    }

    /// Rebuild the ownership graph and demote every back edge to weak. A
    /// field referring to its own type reaches a gray node and is a back edge.
    fn detect_back_edges(&mut self) {
        for def in &mut self.types {
            for field in &mut def.fields {
                if !field.pinned && field.strength == FieldStrength::Weak {
                    field.strength = FieldStrength::Strong;
                }
            }
        }

        self.edges.clear();
        // per type: indices of its edges in `self.edges`
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.types.len()];
        for (t, def) in self.types.iter().enumerate() {
            for field in def.fields.iter().filter(|f| f.is_traced()) {
                adjacency[t].push(self.edges.len());
                self.edges.push(OwnershipEdge {
                    from: def.name.clone(),
                    field: field.name.clone(),
                    to: field.type_name.clone(),
                    back_edge: false,
                });
            }
        }

        let mut colors = vec![Color::White; self.types.len()];
        let mut back_edges: Vec<usize> = Vec::new();
        for start in 0..self.types.len() {
            if colors[start] != Color::White {
                continue;
            }
            // explicit path: (type index, next adjacency position)
            let mut path: Vec<(usize, usize)> = Vec::with_capacity(DFS_PATH_CAPACITY);
            colors[start] = Color::Gray;
            path.push((start, 0));
            while let Some(top) = path.last_mut() {
                let (node, position) = *top;
                top.1 += 1;
                let Some(&edge) = adjacency[node].get(position) else {
                    colors[node] = Color::Black;
                    path.pop();
                    continue;
                };
                let Some(&target) = self.index.get(&self.edges[edge].to) else {
                    continue;
                };
                match colors[target] {
                    Color::Gray => back_edges.push(edge),
                    Color::Black => {}
                    Color::White if path.len() >= DFS_PATH_CAPACITY => {
                        tracing::warn!(
                            field = %self.edges[edge].field,
                            "ownership path too deep, demoting field"
                        );
                        back_edges.push(edge);
                    }
                    Color::White => {
                        colors[target] = Color::Gray;
                        path.push((target, 0));
                    }
                }
            }
        }

        for edge in back_edges {
            let OwnershipEdge { from, field, .. } = &self.edges[edge];
            let Some(&t) = self.index.get(from) else {
                continue;
            };
            if let Some(def) = self.types[t].fields.iter_mut().find(|f| f.name == *field) {
                if def.pinned {
                    tracing::debug!(type_name = %from, field = %field, "pinned field kept on a cycle");
                    continue;
                }
                def.strength = FieldStrength::Weak;
                tracing::debug!(type_name = %from, field = %field, "back edge demoted to weak");
            }
            self.edges[edge].back_edge = true;
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::sexpr::parse_sexpr;

    fn register(registry: &mut TypeRegistry, source: &str) {
        let items = parse_sexpr(source).unwrap().list_items().unwrap();
        let [Value::Sym(name), specs @ ..] = items.as_slice() else {
            panic!("bad test type {source}");
        };
        let fields = specs.iter().map(FieldSpec::parse).collect::<Result<Vec<_>, _>>().unwrap();
        registry.register(name, fields).unwrap();
    }

    fn strength(registry: &TypeRegistry, ty: &str, field: &str) -> FieldStrength {
        registry.get(ty).unwrap().field(field).unwrap().strength
    }

    #[test]
    fn test_field_spec_parsing() {
        let ok = FieldSpec::parse(&parse_sexpr("(prev DLLNode weak)").unwrap()).unwrap();
        assert_eq!(ok.annotation, Some(FieldStrength::Weak));
        assert_eq!(&*ok.type_name, "DLLNode");
        for bad in ["prev", "(prev)", "(1 int)", "(a int sticky)", "(a int weak extra)"] {
            assert!(FieldSpec::parse(&parse_sexpr(bad).unwrap()).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_doubly_linked_node_links_are_weak() {
        let mut registry = TypeRegistry::new();
        register(&mut registry, "(DLLNode (value int) (next DLLNode) (prev DLLNode))");
        let def = registry.get("DLLNode").unwrap();
        assert!(def.recursive);
        assert!(!def.field("value").unwrap().scannable);
        assert_eq!(strength(&registry, "DLLNode", "prev"), FieldStrength::Weak);
        assert_eq!(strength(&registry, "DLLNode", "value"), FieldStrength::Strong);
        let back: Vec<&str> = registry
            .edges()
            .iter()
            .filter(|e| e.back_edge)
            .map(|e| e.field.as_ref())
            .collect();
        assert_eq!(back, vec!["next", "prev"]);
    }

    #[test]
    fn test_self_references_are_back_edges() {
        let cases = vec![
            ("(Node (value int) (next Node))", vec![("next", FieldStrength::Weak)]),
            (
                "(Tree (left Tree) (right Tree))",
                vec![("left", FieldStrength::Weak), ("right", FieldStrength::Weak)],
            ),
            (
                "(Leafy (label int) (kids Cell) (self Leafy))",
                vec![("kids", FieldStrength::Strong), ("self", FieldStrength::Weak)],
            ),
        ];
        for (source, expected) in cases {
            let mut registry = TypeRegistry::new();
            register(&mut registry, source);
            let def = registry.types()[0].clone();
            for (field, strength_expected) in expected {
                assert_eq!(strength(&registry, &def.name, field), strength_expected, "{source}: {field}");
            }
            // no strong self edge survives
            assert!(
                def.fields.iter().all(|f| f.type_name != def.name || !f.is_traced()),
                "{source} keeps a strong self cycle"
            );
        }
    }

    #[test]
    fn test_every_cycle_gets_a_weak_field() {
        let mut registry = TypeRegistry::new();
        register(&mut registry, "(Parent (child Child))");
        register(&mut registry, "(Child (parent Parent) (sibling Child))");
        register(&mut registry, "(A (b B))");
        register(&mut registry, "(B (c C))");
        register(&mut registry, "(C (a A))");
        assert_eq!(strength(&registry, "Parent", "child"), FieldStrength::Strong);
        assert_eq!(strength(&registry, "Child", "parent"), FieldStrength::Weak);
        assert_eq!(strength(&registry, "Child", "sibling"), FieldStrength::Weak);
        let cycle = [("A", "b"), ("B", "c"), ("C", "a")];
        assert!(
            cycle.iter().any(|(t, f)| strength(&registry, t, f) == FieldStrength::Weak),
            "A -> B -> C -> A has no weak field"
        );
    }

    #[test]
    fn test_pinned_and_untraced_fields() {
        let mut registry = TypeRegistry::new();
        register(&mut registry, "(Ring (next Ring) (back Ring strong) (cache Ring untraced))");
        assert_eq!(strength(&registry, "Ring", "next"), FieldStrength::Weak);
        assert_eq!(strength(&registry, "Ring", "back"), FieldStrength::Strong);
        assert_eq!(strength(&registry, "Ring", "cache"), FieldStrength::Untraced);
        assert!(!registry.get("Ring").unwrap().field("cache").unwrap().is_traced());
        assert!(registry.edges().iter().all(|e| &*e.field != "cache"));
    }

    #[test]
    fn test_redefinition_and_duplicates() {
        let mut registry = TypeRegistry::new();
        register(&mut registry, "(P (a int))");
        register(&mut registry, "(P (a int) (b int))");
        assert_eq!(registry.types().len(), 1);
        assert_eq!(registry.get("P").unwrap().fields.len(), 2);
        let dup = vec![
            FieldSpec::parse(&parse_sexpr("(a int)").unwrap()).unwrap(),
            FieldSpec::parse(&parse_sexpr("(a int)").unwrap()).unwrap(),
        ];
        assert!(registry.register(&Rc::from("Q"), dup).is_err());
    }

    #[test]
    fn test_long_chain_stays_within_path_capacity() {
        let mut registry = TypeRegistry::new();
        let count = DFS_PATH_CAPACITY + 20;
        for i in 0..count {
            register(&mut registry, &format!("(T{i} (next T{}))", (i + 1) % count));
        }
        let weak = registry
            .types()
            .iter()
            .flat_map(|t| t.fields.iter())
            .filter(|f| f.is_weak())
            .count();
        assert!(weak >= 1);
        assert_eq!(registry.edges().len(), count);
    }
}
