//! Arena-backed LRU list
//!
//! Head is the most recently inserted entry, tail the eviction candidate.
//! Entries live in a bounded slot arena; a slot can be detached from the list
//! and re-attached later without being freed, which the close worker uses to
//! take an entry out while it decides the object's fate.

use crate::error::{CacheError, CacheResult};

/// Index of a slot in the arena
pub(crate) type SlotId = u32;

const NIL: SlotId = u32::MAX;

#[derive(Debug)]
struct Slot<E> {
    value: Option<E>,
    prev: SlotId,
    next: SlotId,
    linked: bool,
}

#[derive(Debug)]
pub(crate) struct LruList<E> {
    slots: Vec<Slot<E>>,
    free: Vec<SlotId>,
    head: SlotId,
    tail: SlotId,
    len: usize,
    limit: usize,
}

impl<E> LruList<E> {
    /// Empty list whose arena holds at most `limit` entries
    pub(crate) fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
            limit,
        }
    }

    /// Linked entries
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Occupied slots, linked or detached
    pub(crate) fn allocated(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Allocate a slot for `value` and link it at the head
    pub(crate) fn insert_head(&mut self, value: E) -> CacheResult<SlotId> {
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id as usize].value = Some(value);
                id
            }
            None if self.slots.len() < self.limit => {
                self.slots.push(Slot {
                    value: Some(value),
                    prev: NIL,
                    next: NIL,
                    linked: false,
                });
                (self.slots.len() - 1) as SlotId
            }
            None => {
                return Err(CacheError::resource_exhausted(format!(
                    "delayed-close entry pool full ({} entries)",
                    self.limit
                )));
            }
        };
        self.attach_head(id);
        Ok(id)
    }

    /// Link an allocated, detached slot at the head
    pub(crate) fn attach_head(&mut self, id: SlotId) {
        let old_head = self.head;
        {
            let slot = &mut self.slots[id as usize];
            debug_assert!(slot.value.is_some() && !slot.linked);
            slot.prev = NIL;
            slot.next = old_head;
            slot.linked = true;
        }
        if old_head == NIL {
            self.tail = id;
        } else {
            self.slots[old_head as usize].prev = id;
        }
        self.head = id;
        self.len += 1;
    }

    /// Unlink a slot, keeping it allocated. Returns false if it was not linked.
    pub(crate) fn detach(&mut self, id: SlotId) -> bool {
        let (prev, next) = match self.slots.get_mut(id as usize) {
            Some(slot) if slot.linked => {
                slot.linked = false;
                (slot.prev, slot.next)
            }
            _ => return false,
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }
        self.len -= 1;
        true
    }

    /// Unlink if needed and free the slot, handing back its value
    pub(crate) fn free(&mut self, id: SlotId) -> Option<E> {
        self.detach(id);
        let value = self.slots.get_mut(id as usize)?.value.take()?;
        self.free.push(id);
        Some(value)
    }

    pub(crate) fn get(&self, id: SlotId) -> Option<&E> {
        self.slots.get(id as usize)?.value.as_ref()
    }

    /// Whether the slot is currently linked
    #[cfg(test)]
    pub(crate) fn is_linked(&self, id: SlotId) -> bool {
        self.slots.get(id as usize).is_some_and(|slot| slot.linked)
    }

    /// Eviction candidate
    pub(crate) fn peek_tail(&self) -> Option<(SlotId, &E)> {
        if self.tail == NIL {
            return None;
        }
        self.get(self.tail).map(|value| (self.tail, value))
    }

    /// Linked entries from tail (oldest) to head (newest)
    pub(crate) fn iter_from_tail(&self) -> TailIter<'_, E> {
        TailIter {
            list: self,
            cursor: self.tail,
        }
    }

    /// Free every linked entry matching `pred`, oldest first
    pub(crate) fn drain_matching(&mut self, mut pred: impl FnMut(&E) -> bool) -> Vec<E> {
        let ids: Vec<SlotId> = self
            .iter_from_tail()
            .filter(|(_, value)| pred(value))
            .map(|(id, _)| id)
            .collect();
        ids.into_iter().filter_map(|id| self.free(id)).collect()
    }
}

pub(crate) struct TailIter<'a, E> {
    list: &'a LruList<E>,
    cursor: SlotId,
}

impl<'a, E> Iterator for TailIter<'a, E> {
    type Item = (SlotId, &'a E);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let id = self.cursor;
        let slot = &self.list.slots[id as usize];
        self.cursor = slot.prev;
        slot.value.as_ref().map(|value| (id, value))
    }
}
