// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A slot arena with generation-checked handles.  Handles to removed entries
//! stay invalid even after their slot is reused.

use std::fmt;
use std::marker::PhantomData;

/// An untyped arena handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Implemented by the typed handles stored in an [`Arena`].
pub trait ArenaKey: Copy {
    fn from_handle(handle: Handle) -> Self;
    fn handle(&self) -> Handle;
}

/// Declare a typed arena handle.
macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::arena::Handle);

        impl $crate::arena::ArenaKey for $name {
            fn from_handle(handle: $crate::arena::Handle) -> Self {
                $name(handle)
            }
            fn handle(&self) -> $crate::arena::Handle {
                self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&format_args!("{:?}", self.0))
            }
        }
    };
}
pub(crate) use arena_key;

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub(crate) struct Arena<K: ArenaKey, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, T> Default for Arena<K, T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }
}

impl<K: ArenaKey, T> Arena<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, value: T) -> K {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation + 1,
                Slot::Occupied { .. } => unreachable!("free slot in use"),
            };
            *slot = Slot::Occupied { generation, value };
            K::from_handle(Handle { index, generation })
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied {
                generation: 0,
                value,
            });
            K::from_handle(Handle {
                index,
                generation: 0,
            })
        }
    }

    pub fn remove(&mut self, key: K) -> Option<T> {
        let h = key.handle();
        let slot = self.slots.get_mut(h.index as usize)?;
        let live = matches!(slot, Slot::Occupied { generation, .. }
            if *generation == h.generation);
        if !live {
            return None;
        }
        let old = std::mem::replace(
            slot,
            Slot::Vacant {
                generation: h.generation,
            },
        );
        self.free.push(h.index);
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn get(&self, key: K) -> Option<&T> {
        let h = key.handle();
        match self.slots.get(h.index as usize)? {
            Slot::Occupied { generation, value }
                if *generation == h.generation =>
            {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let h = key.handle();
        match self.slots.get_mut(h.index as usize)? {
            Slot::Occupied { generation, value }
                if *generation == h.generation =>
            {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    K::from_handle(Handle {
                        index: index as u32,
                        generation: *generation,
                    }),
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}

/// Indexing is for handles the device holds in its own links.  Handles
/// supplied by callers are looked up with [`Arena::get`].
impl<K: ArenaKey, T> std::ops::Index<K> for Arena<K, T> {
    type Output = T;

    fn index(&self, key: K) -> &T {
        self.get(key).expect("stale arena handle")
    }
}

impl<K: ArenaKey, T> std::ops::IndexMut<K> for Arena<K, T> {
    fn index_mut(&mut self, key: K) -> &mut T {
        self.get_mut(key).expect("stale arena handle")
    }
}
