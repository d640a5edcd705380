//! Identity of the memory blocks tensors live in.
//!
//! Every storage occupies a slot in a thread-local arena for as long as it is alive. A slot is
//! recycled once its storage is dropped, but its generation is bumped first, so a key held past
//! the lifetime of its storage can never be confused with the key of a newer storage.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StorageKey {
    slot: u32,
    generation: u32,
}

#[derive(Default)]
struct Arena {
    generations: Vec<u32>,
    free: Vec<u32>,
    live: usize,
}

thread_local! {
    static ARENA: RefCell<Arena> = RefCell::new(Arena::default());
}

impl StorageKey {
    pub fn is_live(&self) -> bool {
        ARENA
            .try_with(|arena| {
                let arena = arena.borrow();
                arena.generations.get(self.slot as usize) == Some(&self.generation)
            })
            .unwrap_or(false)
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}.{}", self.slot, self.generation)
    }
}

/// Owns one arena slot. The slot is released when the handle is dropped.
#[derive(Debug)]
pub struct StorageHandle {
    key: StorageKey,
}

impl StorageHandle {
    pub fn acquire() -> Self {
        let key = ARENA.with(|arena| {
            let mut arena = arena.borrow_mut();
            arena.live += 1;
            match arena.free.pop() {
                Some(slot) => StorageKey {
                    slot,
                    generation: arena.generations[slot as usize],
                },
                None => {
                    let slot = arena.generations.len() as u32;
                    arena.generations.push(0);
                    StorageKey {
                        slot,
                        generation: 0,
                    }
                }
            }
        });
        StorageHandle { key }
    }

    pub fn key(&self) -> StorageKey {
        self.key
    }
}

impl Drop for StorageHandle {
    fn drop(&mut self) {
        // The arena may already be gone during thread teardown.
        let _ = ARENA.try_with(|arena| {
            let mut arena = arena.borrow_mut();
            let slot = self.key.slot;
            arena.generations[slot as usize] = arena.generations[slot as usize].wrapping_add(1);
            arena.free.push(slot);
            arena.live -= 1;
        });
    }
}

/// Number of storages alive on this thread.
pub fn live_storage_count() -> usize {
    ARENA.with(|arena| arena.borrow().live)
}

#[derive(Debug)]
struct StorageImpl {
    handle: StorageHandle,
    data: RefCell<Vec<f64>>,
}

/// A reference-counted, mutable block of elements.
#[derive(Clone, Debug)]
pub struct Storage(Rc<StorageImpl>);

impl Storage {
    pub fn new(data: Vec<f64>) -> Self {
        Storage(Rc::new(StorageImpl {
            handle: StorageHandle::acquire(),
            data: RefCell::new(data),
        }))
    }

    pub fn zeros(len: usize) -> Self {
        Storage::new(vec![0.0; len])
    }

    pub fn key(&self) -> StorageKey {
        self.0.handle.key()
    }

    pub fn len(&self) -> usize {
        self.0.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> Ref<'_, Vec<f64>> {
        self.0.data.borrow()
    }

    pub fn data_mut(&self) -> RefMut<'_, Vec<f64>> {
        self.0.data.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &Storage) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
