use std::{cell::RefCell, fmt::Debug, rc::Rc};

use rustc_hash::FxHashMap;

use super::Value;

/// A lexical frame of local variables. Frames are shared between the jobs spawned
/// inside them, so every frame sits behind `Rc<RefCell<_>>`.
#[derive(Clone, Default)]
pub struct Scope {
    variables: FxHashMap<String, Value>,
    parent: Option<Rc<RefCell<Scope>>>,
}

impl Scope {
    pub fn boxed(parent: Option<Rc<RefCell<Scope>>>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new(parent)))
    }

    pub fn new(parent: Option<Rc<RefCell<Scope>>>) -> Self {
        Self {
            variables: FxHashMap::default(),
            parent,
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.variables.get(name) {
            Some(value.clone())
        } else if let Some(parent) = &self.parent {
            parent.borrow().get(name)
        } else {
            None
        }
    }

    /// Declares `name` in this frame, shadowing outer frames. Redeclaring in the
    /// same frame overwrites.
    pub fn declare(&mut self, name: String, value: Value) {
        self.variables.insert(name, value);
    }

    /// Updates the innermost frame declaring `name`; `None` if no frame does.
    pub fn assign(&mut self, name: &str, value: &Value) -> Option<Value> {
        if let Some(v) = self.variables.get_mut(name) {
            *v = value.clone();
            Some(v.clone())
        } else if let Some(parent) = &self.parent {
            parent.borrow_mut().assign(name, value)
        } else {
            None
        }
    }
}

impl Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.variables.keys().collect();
        names.sort();
        f.debug_struct(format!("Scope<{:?}>", std::ptr::from_ref(self)).as_str())
            .field("variables", &names)
            .field("parent", &self.parent.as_ref().map(|p| p.as_ptr()))
            .finish()
    }
}
