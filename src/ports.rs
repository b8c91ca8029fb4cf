//! Port Allocator: disjoint TCP port ranges reserved per worker.

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::{Result, ZergError};

pub struct PortAllocator {
    start: u16,
    end: u16,
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        let free = (start..=end).collect();
        Self {
            start,
            end,
            free: Mutex::new(free),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    /// Returns the lowest unallocated port in range.
    pub fn allocate_one(&self) -> Result<u16> {
        let mut free = self.free.lock().unwrap();
        let port = *free
            .iter()
            .next()
            .ok_or_else(|| ZergError::Port {
                message: "port range exhausted".to_string(),
            })?;
        free.remove(&port);
        Ok(port)
    }

    pub fn release(&self, port: u16) {
        if port >= self.start && port <= self.end {
            self.free.lock().unwrap().insert(port);
        }
    }

    pub fn release_all(&self) {
        let mut free = self.free.lock().unwrap();
        free.clear();
        free.extend(self.start..=self.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocates_lowest_first() {
        let pool = PortAllocator::new(5000, 5002);
        assert_eq!(pool.allocate_one().unwrap(), 5000);
        assert_eq!(pool.allocate_one().unwrap(), 5001);
        assert_eq!(pool.allocate_one().unwrap(), 5002);
        assert!(pool.allocate_one().is_err());
    }

    #[test]
    fn release_returns_port_to_pool() {
        let pool = PortAllocator::new(5000, 5000);
        let p = pool.allocate_one().unwrap();
        pool.release(p);
        assert_eq!(pool.allocate_one().unwrap(), p);
    }

    #[test]
    fn release_all_resets() {
        let pool = PortAllocator::new(5000, 5001);
        pool.allocate_one().unwrap();
        pool.allocate_one().unwrap();
        pool.release_all();
        assert_eq!(pool.allocate_one().unwrap(), 5000);
    }

    #[test]
    fn thread_safe_allocation_is_disjoint() {
        let pool = Arc::new(PortAllocator::new(5000, 5099));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.allocate_one().unwrap())
            })
            .collect();
        let mut ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 10);
    }
}
