//! Per-NUMA buffer pools
//!
//! Fixed-capacity pools of device buffers, one per NUMA domain, allocated
//! once at bring-up. Buffers are addressed by [`BufferHandle`]; the payload
//! memory itself belongs to the embedding driver.
//!
//! # Design
//!
//! - Lock-free free list (`crossbeam::queue::ArrayQueue`)
//! - Exhaustion is an error, never a wait
//! - Frees beyond the allocated count are ignored

use crossbeam::queue::ArrayQueue;
use mqnic_common::{NicError, NicResult, NumaNode};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Buffer address: NUMA domain plus index within that domain's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BufferHandle {
    /// Owning pool
    pub node: NumaNode,
    /// Index in the pool
    pub index: u32,
}

/// Buffer pool of one NUMA domain
pub struct BufferPool {
    node: NumaNode,
    size: usize,
    buffer_size: usize,
    free_list: ArrayQueue<u32>,
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Create new buffer pool with all buffers free
    pub fn new(node: NumaNode, size: usize, buffer_size: usize) -> Self {
        let free_list = ArrayQueue::new(size.max(1));
        for i in 0..size {
            let _ = free_list.push(i as u32);
        }
        Self {
            node,
            size,
            buffer_size,
            free_list,
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocate buffer from pool
    #[inline]
    pub fn alloc(&self) -> Option<BufferHandle> {
        let index = self.free_list.pop()?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(BufferHandle {
            node: self.node,
            index,
        })
    }

    /// Free buffer back to pool
    #[inline]
    pub fn free(&self, handle: BufferHandle) {
        if handle.node != self.node || handle.index as usize >= self.size {
            warn!(node = self.node, ?handle, "Buffer freed to wrong pool");
            return;
        }
        let decremented = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if decremented.is_err() || self.free_list.push(handle.index).is_err() {
            warn!(node = self.node, index = handle.index, "Double free ignored");
        }
    }

    /// Get available count
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Get allocated count
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get pool size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes per buffer
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// One pool per NUMA domain
pub struct BufferPools {
    pools: Vec<BufferPool>,
}

impl BufferPools {
    /// Create `nodes` pools of `per_node` buffers each
    pub fn new(nodes: usize, per_node: usize, buffer_size: usize) -> Self {
        let pools = (0..nodes.max(1))
            .map(|node| BufferPool::new(node as NumaNode, per_node, buffer_size))
            .collect();
        Self { pools }
    }

    /// Pool of `node`
    pub fn pool(&self, node: NumaNode) -> Option<&BufferPool> {
        self.pools.get(node as usize)
    }

    /// Allocate from `node`'s pool
    #[inline]
    pub fn alloc(&self, node: NumaNode) -> NicResult<BufferHandle> {
        self.pool(node)
            .and_then(BufferPool::alloc)
            .ok_or(NicError::PoolExhausted(node))
    }

    /// Return a buffer to the pool it came from
    #[inline]
    pub fn free(&self, handle: BufferHandle) {
        match self.pool(handle.node) {
            Some(pool) => pool.free(handle),
            None => warn!(?handle, "Buffer from unknown NUMA node"),
        }
    }

    /// Buffers in use across all pools
    pub fn allocated(&self) -> usize {
        self.pools.iter().map(BufferPool::allocated).sum()
    }

    /// Iterate pools in node order
    pub fn iter(&self) -> impl Iterator<Item = &BufferPool> {
        self.pools.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_alloc() {
        let pool = BufferPool::new(0, 1024, 2048);

        assert_eq!(pool.available(), 1024);
        assert_eq!(pool.allocated(), 0);

        let buf = pool.alloc().unwrap();
        assert_eq!(buf.node, 0);
        assert_eq!(pool.available(), 1023);
        assert_eq!(pool.allocated(), 1);

        pool.free(buf);
        assert_eq!(pool.available(), 1024);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_buffer_pool_exhaustion() {
        let pools = BufferPools::new(2, 2, 2048);

        let _b1 = pools.alloc(1).unwrap();
        let _b2 = pools.alloc(1).unwrap();
        assert!(matches!(pools.alloc(1), Err(NicError::PoolExhausted(1))));

        // Other node unaffected
        assert!(pools.alloc(0).is_ok());
        assert!(matches!(pools.alloc(7), Err(NicError::PoolExhausted(7))));
    }

    #[test]
    fn test_double_free_ignored() {
        let pool = BufferPool::new(0, 4, 2048);
        let buf = pool.alloc().unwrap();
        pool.free(buf);
        pool.free(buf);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.allocated(), 0);
    }
}
