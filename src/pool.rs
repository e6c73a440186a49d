use crate::error::Error;
use std::fmt;
use std::marker::PhantomData;

/// Stable reference into a [`Pool`]. The generation counter catches use of a
/// handle whose slot has been freed and reallocated since.
pub struct Handle<T> {
    index: u32,
    gen: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.gen == other.gen
    }
}
impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.gen.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.gen)
    }
}

/// Fixed-capacity object pool with O(1) alloc/free. Never grows: running dry
/// is an undersized-configuration error, not a cue to allocate.
pub struct Pool<T> {
    what: &'static str,
    slots: Vec<Option<T>>,
    gens: Vec<u32>,
    free: Vec<u32>,
    allocs: u64,
    frees: u64,
}

impl<T> Pool<T> {
    pub fn new(what: &'static str, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        // freeing pops from the back, so low indices go out first
        let free = (0..capacity as u32).rev().collect();
        Pool {
            what,
            slots,
            gens: vec![0; capacity],
            free,
            allocs: 0,
            frees: 0,
        }
    }

    pub fn alloc(&mut self, value: T) -> Result<Handle<T>, Error> {
        let index = self.free.pop().ok_or(Error::PoolExhausted {
            what: self.what,
            capacity: self.slots.len(),
        })?;
        self.slots[index as usize] = Some(value);
        self.allocs += 1;
        Ok(Handle {
            index,
            gen: self.gens[index as usize],
            _marker: PhantomData,
        })
    }

    /// Returns the object, or `None` for a stale handle.
    pub fn free(&mut self, handle: Handle<T>) -> Option<T> {
        let i = handle.index as usize;
        if self.gens.get(i) != Some(&handle.gen) {
            return None;
        }
        let value = self.slots[i].take()?;
        self.gens[i] = self.gens[i].wrapping_add(1);
        self.free.push(handle.index);
        self.frees += 1;
        Some(value)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let i = handle.index as usize;
        if self.gens.get(i) != Some(&handle.gen) {
            return None;
        }
        self.slots[i].as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let i = handle.index as usize;
        if self.gens.get(i) != Some(&handle.gen) {
            return None;
        }
        self.slots[i].as_mut()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn allocs(&self) -> u64 {
        self.allocs
    }

    pub fn frees(&self) -> u64 {
        self.frees
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycle() {
        let mut pool: Pool<u32> = Pool::new("test", 2);
        let a = pool.alloc(10).unwrap();
        let b = pool.alloc(20).unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(matches!(
            pool.alloc(30),
            Err(Error::PoolExhausted { capacity: 2, .. })
        ));
        assert_eq!(pool.free(a), Some(10));
        let c = pool.alloc(30).unwrap();
        assert_eq!(pool.get(c), Some(&30));
        assert_eq!(pool.get(b), Some(&20));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn stale_handle_is_rejected() {
        let mut pool: Pool<u32> = Pool::new("test", 1);
        let a = pool.alloc(1).unwrap();
        pool.free(a);
        let b = pool.alloc(2).unwrap();
        // a points at the same slot but an older generation
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.free(a), None);
        assert_eq!(pool.get(b), Some(&2));
    }

    #[test]
    fn accounting_balances() {
        let mut pool: Pool<()> = Pool::new("test", 8);
        let handles: Vec<_> = (0..8).map(|_| pool.alloc(()).unwrap()).collect();
        for h in handles {
            pool.free(h);
        }
        assert_eq!(pool.allocs(), pool.frees());
        assert_eq!(pool.in_use(), 0);
    }
}
