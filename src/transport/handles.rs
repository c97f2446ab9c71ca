use std::fmt::{Debug, Display, Formatter};

/// Identifies a host inside a binding. Host ids are never reused within a binding instance, so a
///  handle to a destroyed host stays invalid.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostHandle(u32);

impl HostHandle {
    pub const fn from_raw(value: u32) -> HostHandle {
        HostHandle(value)
    }
}

impl Debug for HostHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "host#{}", self.0)
    }
}
impl Display for HostHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Identifies a peer of a specific host: the host, the peer's slot inside the host, and the
///  slot's generation at the time the peer was created. Slots are reused after a peer goes away,
///  but with a new generation, so old handles do not resolve to the new peer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerHandle {
    pub host: HostHandle,
    pub slot: u16,
    pub generation: u32,
}

impl Debug for PeerHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}.{}@{}", self.slot, self.generation, self.host.0)
    }
}
impl Display for PeerHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity storage with generation-checked access, used for a host's peers.
pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
}

impl<T> SlotArena<T> {
    pub fn with_capacity(capacity: usize) -> SlotArena<T> {
        assert!(capacity <= u16::MAX as usize + 1, "slot index must fit a u16");

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot { generation: 0, value: None });
        }
        SlotArena { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter()
            .filter(|s| s.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores the value in the first free slot, returning slot index and generation, or `None`
    ///  if all slots are occupied.
    pub fn insert(&mut self, value: T) -> Option<(u16, u32)> {
        let (idx, slot) = self.slots.iter_mut()
            .enumerate()
            .find(|(_, s)| s.value.is_none())?;
        slot.value = Some(value);
        Some((idx as u16, slot.generation))
    }

    pub fn get(&self, slot: u16, generation: u32) -> Option<&T> {
        self.slots.get(slot as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, slot: u16, generation: u32) -> Option<&mut T> {
        self.slots.get_mut(slot as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Removes the value, invalidating the slot's current generation.
    pub fn remove(&mut self, slot: u16, generation: u32) -> Option<T> {
        let s = self.slots.get_mut(slot as usize)?;
        if s.generation != generation {
            return None;
        }
        let result = s.value.take();
        if result.is_some() {
            s.generation = s.generation.wrapping_add(1);
        }
        result
    }

    /// occupied slots as `(slot, generation, value)`
    pub fn iter(&self) -> impl Iterator<Item=(u16, u32, &T)> {
        self.slots.iter()
            .enumerate()
            .filter_map(|(idx, s)| s.value.as_ref().map(|v| (idx as u16, s.generation, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item=(u16, u32, &mut T)> {
        self.slots.iter_mut()
            .enumerate()
            .filter_map(|(idx, s)| {
                let generation = s.generation;
                s.value.as_mut().map(|v| (idx as u16, generation, v))
            })
    }

    pub fn clear(&mut self) {
        for s in self.slots.iter_mut() {
            if s.value.take().is_some() {
                s.generation = s.generation.wrapping_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_until_full() {
        let mut arena = SlotArena::with_capacity(2);
        assert_eq!(arena.insert("a"), Some((0, 0)));
        assert_eq!(arena.insert("b"), Some((1, 0)));
        assert_eq!(arena.insert("c"), None);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_generation_is_rejected() {
        let mut arena = SlotArena::with_capacity(1);
        let (slot, generation) = arena.insert(1).unwrap();
        assert_eq!(arena.remove(slot, generation), Some(1));

        let (new_slot, new_generation) = arena.insert(2).unwrap();
        assert_eq!(new_slot, slot);
        assert_ne!(new_generation, generation);

        assert_eq!(arena.get(slot, generation), None);
        assert_eq!(arena.get_mut(slot, generation), None);
        assert_eq!(arena.remove(slot, generation), None);
        assert_eq!(arena.get(new_slot, new_generation), Some(&2));
    }

    #[test]
    fn test_remove_twice() {
        let mut arena = SlotArena::with_capacity(3);
        let (slot, generation) = arena.insert('x').unwrap();
        assert_eq!(arena.remove(slot, generation), Some('x'));
        assert_eq!(arena.remove(slot, generation), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_out_of_range_slot() {
        let arena = SlotArena::<u8>::with_capacity(1);
        assert_eq!(arena.get(7, 0), None);
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut arena = SlotArena::with_capacity(3);
        let (s0, g0) = arena.insert(10).unwrap();
        arena.insert(11).unwrap();
        arena.insert(12).unwrap();
        arena.remove(s0, g0);

        let values = arena.iter().map(|(_, _, v)| *v).collect::<Vec<_>>();
        assert_eq!(values, vec![11, 12]);
    }

    #[test]
    fn test_clear_invalidates_all() {
        let mut arena = SlotArena::with_capacity(2);
        let (s, g) = arena.insert(1).unwrap();
        arena.clear();
        assert!(arena.is_empty());
        assert_eq!(arena.get(s, g), None);
    }

    #[test]
    fn test_handle_debug() {
        let peer = PeerHandle { host: HostHandle::from_raw(3), slot: 1, generation: 4 };
        assert_eq!(format!("{:?}", peer), "peer#1.4@3");
        assert_eq!(peer.host.to_string(), "host#3");
    }
}
