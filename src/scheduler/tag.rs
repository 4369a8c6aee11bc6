use std::fmt::Display;

use crate::interpreter::Value;

/// Index of a tag in the arena, plus the generation of the slot so that an id
/// outliving a released tag never names the tag reusing its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId {
    index: usize,
    generation: u32,
}

impl Display for TagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.generation {
            0 => write!(f, "tag#{}", self.index),
            generation => write!(f, "tag#{}.{}", self.index, generation),
        }
    }
}

#[derive(Debug)]
struct TagData {
    name: String,
    parent: Option<TagId>,
    frozen: bool,
    blocked: Option<Value>,
    enters: u64,
    leaves: u64,
    generation: u32,
    live: bool,
}

/// Arena of tags. Jobs refer to tags by id; a released tag's slot is reused, and
/// ids of released tags read as tags without state or ancestors.
#[derive(Debug)]
pub struct Tags {
    tags: Vec<TagData>,
    free: Vec<usize>,
}

impl Default for Tags {
    fn default() -> Self {
        Self::new()
    }
}

impl Tags {
    pub const ROOT_NAME: &'static str = "tags";

    pub fn new() -> Self {
        let mut tags = Tags {
            tags: Vec::new(),
            free: Vec::new(),
        };
        tags.insert(Self::ROOT_NAME.to_string(), None);
        tags
    }

    fn insert(&mut self, name: String, parent: Option<TagId>) -> TagId {
        let Some(index) = self.free.pop() else {
            let id = TagId {
                index: self.tags.len(),
                generation: 0,
            };
            self.tags.push(TagData {
                name,
                parent,
                frozen: false,
                blocked: None,
                enters: 0,
                leaves: 0,
                generation: 0,
                live: true,
            });
            return id;
        };
        let data = &mut self.tags[index];
        let generation = data.generation.wrapping_add(1);
        *data = TagData {
            name,
            parent,
            frozen: false,
            blocked: None,
            enters: 0,
            leaves: 0,
            generation,
            live: true,
        };
        TagId { index, generation }
    }

    fn data(&self, id: TagId) -> Option<&TagData> {
        self.tags
            .get(id.index)
            .filter(|data| data.live && data.generation == id.generation)
    }

    fn data_mut(&mut self, id: TagId) -> Option<&mut TagData> {
        self.tags
            .get_mut(id.index)
            .filter(|data| data.live && data.generation == id.generation)
    }

    /// The well-known tag every other tag descends from.
    pub fn root(&self) -> TagId {
        TagId {
            index: 0,
            generation: 0,
        }
    }

    /// Creates a tag under `parent`, or under the root when none is given.
    pub fn create(&mut self, name: &str, parent: Option<TagId>) -> TagId {
        let parent = parent.unwrap_or_else(|| self.root());
        let id = self.insert(name.to_string(), Some(parent));
        tracing::trace!(%id, name, %parent, "created tag");
        id
    }

    /// Frees a tag nothing can name any more. The root is never released.
    pub fn release(&mut self, id: TagId) {
        if id == self.root() {
            return;
        }
        if let Some(data) = self.data_mut(id) {
            data.live = false;
            data.blocked = None;
            self.free.push(id.index);
            tracing::trace!(%id, "released tag");
        }
    }

    pub fn is_live(&self, id: TagId) -> bool {
        self.data(id).is_some()
    }

    /// Number of tags not yet released, the root included.
    pub fn live(&self) -> usize {
        self.tags.len() - self.free.len()
    }

    pub fn name(&self, id: TagId) -> Option<&str> {
        self.data(id).map(|data| data.name.as_str())
    }

    pub fn parent(&self, id: TagId) -> Option<TagId> {
        self.data(id)
            .and_then(|data| data.parent)
            .filter(|parent| self.is_live(*parent))
    }

    fn ancestry(&self, id: TagId) -> impl Iterator<Item = TagId> + '_ {
        std::iter::successors(Some(id), move |current| self.parent(*current))
    }

    /// Whether `id` is `ancestor` or one of its descendants.
    pub fn descends_from(&self, id: TagId, ancestor: TagId) -> bool {
        self.ancestry(id).any(|tag| tag == ancestor)
    }

    /// A tag is frozen when it or any of its ancestors is.
    pub fn is_frozen(&self, id: TagId) -> bool {
        self.ancestry(id)
            .any(|tag| self.data(tag).is_some_and(|data| data.frozen))
    }

    /// The payload of the nearest blocked tag in the ancestry, if any.
    pub fn blocked(&self, id: TagId) -> Option<Value> {
        self.ancestry(id)
            .find_map(|tag| self.data(tag).and_then(|data| data.blocked.clone()))
    }

    pub fn freeze(&mut self, id: TagId) {
        if let Some(data) = self.data_mut(id) {
            data.frozen = true;
        }
    }

    pub fn unfreeze(&mut self, id: TagId) {
        if let Some(data) = self.data_mut(id) {
            data.frozen = false;
        }
    }

    pub fn block(&mut self, id: TagId, payload: Value) {
        if let Some(data) = self.data_mut(id) {
            data.blocked = Some(payload);
        }
    }

    pub fn unblock(&mut self, id: TagId) {
        if let Some(data) = self.data_mut(id) {
            data.blocked = None;
        }
    }

    pub fn record_enter(&mut self, id: TagId) {
        if let Some(data) = self.data_mut(id) {
            data.enters += 1;
        }
    }

    pub fn record_leave(&mut self, id: TagId) {
        if let Some(data) = self.data_mut(id) {
            data.leaves += 1;
        }
    }

    pub fn enters(&self, id: TagId) -> u64 {
        self.data(id).map_or(0, |data| data.enters)
    }

    pub fn leaves(&self, id: TagId) -> u64 {
        self.data(id).map_or(0, |data| data.leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_propagates_freeze_and_block() {
        let mut tags = Tags::new();
        let parent = tags.create("robot", None);
        let child = tags.create("robot.arm", Some(parent));
        let other = tags.create("head", None);

        assert_eq!(tags.parent(parent), Some(tags.root()));
        assert!(tags.descends_from(child, parent));
        assert!(!tags.descends_from(parent, child));

        tags.freeze(parent);
        assert!(tags.is_frozen(child));
        assert!(!tags.is_frozen(other));
        tags.unfreeze(parent);
        assert!(!tags.is_frozen(child));

        tags.block(parent, Value::Float(3.0));
        assert!(matches!(tags.blocked(child), Some(Value::Float(v)) if v == 3.0));
        tags.unblock(parent);
        assert!(tags.blocked(child).is_none());
    }

    #[test]
    fn test_names_and_counters() {
        let mut tags = Tags::new();
        let id = tags.create("a.b", None);
        assert_eq!(tags.name(id), Some("a.b"));
        assert_eq!(tags.name(tags.root()), Some(Tags::ROOT_NAME));
        tags.record_enter(id);
        tags.record_enter(id);
        tags.record_leave(id);
        assert_eq!((tags.enters(id), tags.leaves(id)), (2, 1));
    }

    #[test]
    fn test_released_slot_is_reused_without_aliasing() {
        let mut tags = Tags::new();
        let scope = tags.create("scope", None);
        let child = tags.create("scope.child", Some(scope));
        tags.freeze(scope);
        tags.release(scope);

        assert!(!tags.is_live(scope));
        assert!(!tags.descends_from(child, scope));
        assert!(!tags.is_frozen(child));
        assert_eq!(tags.name(scope), None);

        let reused = tags.create("timeout", None);
        assert_ne!(reused, scope);
        assert!(!tags.is_frozen(reused));
        assert!(!tags.descends_from(reused, scope));
        assert_eq!(tags.name(scope), None);
        assert_eq!(tags.live(), 3);

        tags.release(tags.root());
        assert!(tags.is_live(tags.root()));
    }
}
