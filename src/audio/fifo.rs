//! Lock-free 单生产者单消费者 FIFO
//!
//! 模拟 PDM/PCM 外设的接收 FIFO：
//! - 生产者：抽取器（feeder 线程）按自己的节奏推入样本
//! - 消费者：streaming arbiter 在服务周期内非阻塞地取出样本
//!
//! 深度固定，满时新样本被丢弃（硬件 FIFO 溢出语义），不会覆盖未读数据

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// SPSC 无锁 FIFO
///
/// - `head`（写位置）和 `tail`（读位置）各自独占一个 cache line
/// - 位置单调递增，通过 mask 取下标，`head - tail` 即水位
pub struct SpscFifo<T: Copy + Default> {
    slots: Box<[UnsafeCell<T>]>,
    depth: usize,
    mask: usize,

    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Copy + Default + Send> Send for SpscFifo<T> {}
unsafe impl<T: Copy + Default + Send> Sync for SpscFifo<T> {}

impl<T: Copy + Default> SpscFifo<T> {
    /// 创建指定深度的 FIFO
    ///
    /// depth 必须是 2 的幂
    pub fn new(depth: usize) -> Self {
        assert!(depth.is_power_of_two(), "fifo depth must be power of two");

        let slots: Vec<UnsafeCell<T>> = (0..depth).map(|_| UnsafeCell::new(T::default())).collect();

        Self {
            slots: slots.into_boxed_slice(),
            depth,
            mask: depth - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// 创建至少能容纳 `min_depth` 个元素的 FIFO（向上取整到 2 的幂）
    pub fn with_min_depth(min_depth: usize) -> Self {
        Self::new(min_depth.max(1).next_power_of_two())
    }

    /// 推入样本（生产者调用）
    ///
    /// 返回实际推入的数量，剩余部分被丢弃
    #[inline]
    pub fn push(&self, data: &[T]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let level = head.wrapping_sub(tail);
        debug_assert!(level <= self.depth, "fifo invariant violated: level > depth");

        let n = data.len().min(self.depth - level);
        for (i, &value) in data[..n].iter().enumerate() {
            let idx = head.wrapping_add(i) & self.mask;
            unsafe {
                *self.slots[idx].get() = value;
            }
        }

        self.head.store(head.wrapping_add(n), Ordering::Release);
        n
    }

    /// 取出样本到 `dest`（消费者调用）
    ///
    /// 返回 `min(dest.len(), 当前水位)`，绝不等待更多数据
    #[inline]
    pub fn pop_into(&self, dest: &mut [T]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        let n = dest.len().min(head.wrapping_sub(tail));
        for (i, slot) in dest[..n].iter_mut().enumerate() {
            let idx = tail.wrapping_add(i) & self.mask;
            *slot = unsafe { *self.slots[idx].get() };
        }

        self.tail.store(tail.wrapping_add(n), Ordering::Release);
        n
    }

    /// 当前水位
    #[inline]
    pub fn level(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.level() == 0
    }

    /// 丢弃所有未读样本（消费者调用）
    pub fn discard(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_basic() {
        let fifo = SpscFifo::<u16>::new(16);

        assert_eq!(fifo.push(&[1, 2, 3, 4]), 4);
        assert_eq!(fifo.level(), 4);

        let mut out = [0u16; 4];
        assert_eq!(fifo.pop_into(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_fifo_pop_never_exceeds_level() {
        let fifo = SpscFifo::<u16>::new(16);
        fifo.push(&[7, 8, 9]);

        // 请求比水位多：只返回已排队的
        let mut out = [0u16; 10];
        assert_eq!(fifo.pop_into(&mut out), 3);
        assert_eq!(&out[..3], &[7, 8, 9]);
        assert_eq!(out[3], 0);
    }

    #[test]
    fn test_fifo_wrap() {
        let fifo = SpscFifo::<u16>::new(4);
        assert_eq!(fifo.push(&[1, 2, 3, 4]), 4);

        let mut half = [0u16; 2];
        assert_eq!(fifo.pop_into(&mut half), 2);
        assert_eq!(half, [1, 2]);

        // 环绕写入
        assert_eq!(fifo.push(&[5, 6]), 2);

        let mut all = [0u16; 4];
        assert_eq!(fifo.pop_into(&mut all), 4);
        assert_eq!(all, [3, 4, 5, 6]);
    }

    #[test]
    fn test_fifo_overflow_drops_new_words() {
        let fifo = SpscFifo::<u16>::new(4);
        assert_eq!(fifo.push(&[1, 2, 3]), 3);
        // 只剩 1 个空位
        assert_eq!(fifo.push(&[4, 5, 6]), 1);
        assert_eq!(fifo.level(), 4);

        let mut out = [0u16; 4];
        fifo.pop_into(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_fifo_discard() {
        let fifo = SpscFifo::<u16>::with_min_depth(100);
        assert_eq!(fifo.depth(), 128);

        fifo.push(&[1; 50]);
        fifo.discard();
        assert_eq!(fifo.level(), 0);

        // discard 之后仍可正常使用
        fifo.push(&[2, 3]);
        let mut out = [0u16; 2];
        assert_eq!(fifo.pop_into(&mut out), 2);
        assert_eq!(out, [2, 3]);
    }

    #[test]
    fn test_cache_padded_alignment() {
        assert!(std::mem::align_of::<CachePadded<AtomicUsize>>() >= 64);
    }
}
