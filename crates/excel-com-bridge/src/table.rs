//! Object table mapping wire ids to live COM objects.

use std::collections::HashMap;

use excel_com_protocol::ObjectId;

/// Ids start at 1 and are never reused, so a released id stays unknown for
/// the life of the process.
pub struct ObjectTable<T> {
    entries: HashMap<ObjectId, T>,
    next_id: u64,
}

impl<T> ObjectTable<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn insert(&mut self, object: T) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, object);
        id
    }

    pub fn get(&self, id: ObjectId) -> Result<&T, String> {
        self.entries
            .get(&id)
            .ok_or_else(|| format!("Unknown object handle: {id}"))
    }

    pub fn remove(&mut self, id: ObjectId) -> Result<T, String> {
        self.entries
            .remove(&id)
            .ok_or_else(|| format!("Unknown object handle: {id}"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
