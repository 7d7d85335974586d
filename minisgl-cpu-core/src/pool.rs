//! Fixed-capacity pools: the KV memory pool (per-token slots) and the
//! request slot pool (per-request indices). Both are flat arrays with a
//! free list; a slot is owned either by exactly one live request or by the
//! cache trie, never both and never neither (`spec.md` §3).

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("requested {requested} slots but only {available} are free")]
    OutOfSlots { requested: usize, available: usize },
    #[error("index {0} is out of bounds for this pool")]
    OutOfBounds(i32),
    #[error("index {0} was already free")]
    DoubleFree(i32),
}

/// Flat array of token slots on accelerator memory. The scheduler never
/// inspects slot contents, only counts and indices.
#[derive(Debug)]
pub struct KvPool {
    capacity: usize,
    free: Vec<i32>,
    in_use: Vec<bool>,
}

impl KvPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: (0..capacity as i32).rev().collect(),
            in_use: vec![false; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_size(&self) -> usize {
        self.free.len()
    }

    pub fn alloc(&mut self, count: usize) -> Result<Vec<i32>, PoolError> {
        if self.free.len() < count {
            return Err(PoolError::OutOfSlots {
                requested: count,
                available: self.free.len(),
            });
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let idx = self.free.pop().expect("checked length above");
            self.in_use[idx as usize] = true;
            out.push(idx);
        }
        Ok(out)
    }

    pub fn free(&mut self, indices: &[i32]) -> Result<(), PoolError> {
        for &idx in indices {
            let slot = self
                .in_use
                .get_mut(idx as usize)
                .ok_or(PoolError::OutOfBounds(idx))?;
            if !*slot {
                return Err(PoolError::DoubleFree(idx));
            }
            *slot = false;
            self.free.push(idx);
        }
        Ok(())
    }
}

/// Fixed array of per-request index slots mapping a request to its
/// token-slot list (the "request slot pool" of `spec.md` §2.2).
#[derive(Debug)]
pub struct ReqSlotPool {
    capacity: usize,
    free: Vec<i32>,
}

impl ReqSlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: (0..capacity as i32).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_size(&self) -> usize {
        self.free.len()
    }

    pub fn allocate(&mut self) -> Option<i32> {
        self.free.pop()
    }

    pub fn release(&mut self, idx: i32) -> Result<(), PoolError> {
        if idx < 0 || idx as usize >= self.capacity {
            return Err(PoolError::OutOfBounds(idx));
        }
        self.free.push(idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_pool_alloc_free_round_trips() {
        let mut pool = KvPool::new(4);
        assert_eq!(pool.available_size(), 4);
        let slots = pool.alloc(3).unwrap();
        assert_eq!(pool.available_size(), 1);
        pool.free(&slots).unwrap();
        assert_eq!(pool.available_size(), 4);
    }

    #[test]
    fn kv_pool_out_of_slots() {
        let mut pool = KvPool::new(2);
        assert!(matches!(
            pool.alloc(3),
            Err(PoolError::OutOfSlots {
                requested: 3,
                available: 2
            })
        ));
    }

    #[test]
    fn req_slot_pool_allocate_release() {
        let mut pool = ReqSlotPool::new(2);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        pool.release(a).unwrap();
        assert_eq!(pool.allocate(), Some(a));
        pool.release(b).unwrap();
    }
}
