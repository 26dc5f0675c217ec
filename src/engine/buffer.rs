//! 缓冲池
//!
//! 固定大小的可复用读缓冲。缓冲以句柄形式借出，句柄是
//! 移动语义的唯一所有者：工作协程读满后连同写请求一起
//! 移交给写入协程，由写入协程归还，全程零拷贝

use parking_lot::Mutex;

/// 缓冲句柄
///
/// 同一时刻只有一个持有者；随 WriteRequest 移交给写入协程后
/// 由写入协程调用 put 归还
#[derive(Debug)]
pub struct BufferHandle {
    data: Vec<u8>,
}

impl BufferHandle {
    /// 缓冲容量
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// 可复用缓冲池
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    /// 归还时保留的最大空闲数，超出部分直接释放
    max_retained: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_retained: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_size,
            max_retained: max_retained.max(1),
        }
    }

    /// 单个缓冲的大小
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// 借出一个缓冲，池空时分配新缓冲（压力下允许增长）
    pub fn get(&self) -> BufferHandle {
        let data = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        BufferHandle { data }
    }

    /// 归还缓冲；尺寸不符的句柄直接丢弃
    pub fn put(&self, handle: BufferHandle) {
        if handle.data.len() != self.buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_retained {
            free.push(handle.data);
        }
    }

    /// 当前空闲缓冲数
    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates() {
        let pool = BufferPool::new(1024, 8);
        let handle = pool.get();
        assert_eq!(handle.capacity(), 1024);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_put_recycles() {
        let pool = BufferPool::new(1024, 8);
        let handle = pool.get();
        pool.put(handle);
        assert_eq!(pool.idle_count(), 1);

        // 再次借出应复用同一块内存
        let handle = pool.get();
        assert_eq!(handle.capacity(), 1024);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_retention_cap() {
        let pool = BufferPool::new(64, 2);
        let handles: Vec<_> = (0..4).map(|_| pool.get()).collect();
        for handle in handles {
            pool.put(handle);
        }
        // 超出保留上限的缓冲被释放
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_write_then_read() {
        let pool = BufferPool::new(16, 4);
        let mut handle = pool.get();
        handle.as_mut_slice()[..4].copy_from_slice(b"abcd");
        assert_eq!(&handle.as_slice()[..4], b"abcd");
    }
}
