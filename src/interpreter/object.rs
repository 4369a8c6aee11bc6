use std::{cell::RefCell, rc::Rc};

use rustc_hash::FxHashMap;

use crate::scheduler::tag::TagId;

use super::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Plain,
    Tag(TagId),
}

/// Prototype-based slot store. Lookups walk the prototypes depth first.
pub struct Object {
    pub name: Option<String>,
    pub kind: ObjectKind,
    protos: Vec<Rc<Object>>,
    slots: RefCell<FxHashMap<String, Value>>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut slots: Vec<_> = self.slots.borrow().keys().cloned().collect();
        slots.sort();
        f.debug_struct("Object")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field(
                "protos",
                &self
                    .protos
                    .iter()
                    .map(|p| p.name.clone())
                    .collect::<Vec<_>>(),
            )
            .field("slots", &slots)
            .finish()
    }
}

impl Object {
    pub fn new(name: Option<&str>, kind: ObjectKind, protos: Vec<Rc<Object>>) -> Rc<Object> {
        Rc::new(Object {
            name: name.map(str::to_string),
            kind,
            protos,
            slots: RefCell::new(FxHashMap::default()),
        })
    }

    /// A fresh object inheriting from `proto`.
    pub fn clone_of(proto: &Rc<Object>) -> Rc<Object> {
        Object::new(None, ObjectKind::Plain, vec![proto.clone()])
    }

    pub fn tag(&self) -> Option<TagId> {
        match self.kind {
            ObjectKind::Tag(id) => Some(id),
            ObjectKind::Plain => None,
        }
    }

    pub fn own_slot(&self, name: &str) -> Option<Value> {
        self.slots.borrow().get(name).cloned()
    }

    pub fn has_own_slot(&self, name: &str) -> bool {
        self.slots.borrow().contains_key(name)
    }

    /// Finds a slot here or in a prototype.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.own_slot(name).or_else(|| {
            self.protos
                .iter()
                .find_map(|proto| proto.lookup(name))
        })
    }

    /// Creates or overwrites a slot on this object.
    pub fn set_slot(&self, name: &str, value: Value) {
        self.slots.borrow_mut().insert(name.to_string(), value);
    }

    /// Writes a slot that must already be reachable; the write always lands on this
    /// object so prototypes are never modified through a child.
    pub fn update_slot(&self, name: &str, value: Value) -> Option<Value> {
        self.lookup(name)?;
        self.set_slot(name, value.clone());
        Some(value)
    }

    pub fn remove_slot(&self, name: &str) -> Option<Value> {
        self.slots.borrow_mut().remove(name)
    }

    pub fn slot_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.slots.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}
