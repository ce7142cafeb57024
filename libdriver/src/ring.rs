//! 环形队列
//!
//! 中断处理器与阻塞调用者之间传递缓冲区下标的单生产者/单消费者队列。

use core::sync::atomic::{fence, AtomicUsize, Ordering};

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// 正常入队
    Stored,
    /// 写指针追上了读指针，条目仍然写入
    Collision,
}

/// 单生产者/单消费者环形队列
///
/// 深度为 `capacity + 2`：流通中的条目数永远小于深度，`read == write` 只表示空。
/// 生产者只写 `write`，消费者只写 `read`，索引更新无需加锁。
pub struct SpscRing {
    slots: Box<[AtomicUsize]>,
    /// 读指针（消费者独占）
    read: AtomicUsize,
    /// 写指针（生产者独占）
    write: AtomicUsize,
    collisions: AtomicUsize,
}

impl SpscRing {
    /// 创建空队列，`capacity` 为流通中的条目总数
    pub fn new(capacity: usize) -> Self {
        let depth = capacity + 2;
        Self {
            slots: (0..depth).map(|_| AtomicUsize::new(0)).collect(),
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            collisions: AtomicUsize::new(0),
        }
    }

    /// 创建并预先放入条目
    pub fn with_entries(capacity: usize, entries: impl IntoIterator<Item = usize>) -> Self {
        let ring = Self::new(capacity);
        let mut write = 0;
        for entry in entries.into_iter().take(capacity) {
            ring.slots[write].store(entry, Ordering::Relaxed);
            write += 1;
        }
        ring.write.store(write, Ordering::Release);
        ring
    }

    /// 队列深度
    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// 可容纳的条目数
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 2
    }

    /// 入队（仅生产者调用）
    pub fn push(&self, entry: usize) -> PushOutcome {
        let write = self.write.load(Ordering::Relaxed);
        let next = (write + 1) % self.depth();

        let outcome = if next == self.read.load(Ordering::Acquire) {
            self.collisions.fetch_add(1, Ordering::Relaxed);
            PushOutcome::Collision
        } else {
            PushOutcome::Stored
        };

        self.slots[write].store(entry, Ordering::Relaxed);

        // 条目写入对消费者可见之后才更新写指针
        fence(Ordering::Release);
        self.write.store(next, Ordering::Relaxed);

        outcome
    }

    /// 查看队头（仅消费者调用）
    pub fn peek(&self) -> Option<usize> {
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Relaxed) {
            return None;
        }

        // 看到写指针之后再读取条目
        fence(Ordering::Acquire);
        Some(self.slots[read].load(Ordering::Relaxed))
    }

    /// 出队（仅消费者调用）
    pub fn pop(&self) -> Option<usize> {
        let entry = self.peek()?;
        let read = self.read.load(Ordering::Relaxed);
        self.read.store((read + 1) % self.depth(), Ordering::Release);
        Some(entry)
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read.load(Ordering::Acquire) == self.write.load(Ordering::Acquire)
    }

    /// 当前条目数
    pub fn len(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        (write + self.depth() - read) % self.depth()
    }

    /// 读指针
    #[inline]
    pub fn read_index(&self) -> usize {
        self.read.load(Ordering::Acquire)
    }

    /// 写指针
    #[inline]
    pub fn write_index(&self) -> usize {
        self.write.load(Ordering::Acquire)
    }

    /// 累计指针冲突次数
    #[inline]
    pub fn collisions(&self) -> usize {
        self.collisions.load(Ordering::Relaxed)
    }

    /// 当前队列内容（从队头到队尾），仅用于诊断
    pub fn snapshot(&self) -> Vec<usize> {
        let mut read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        let mut entries = Vec::with_capacity(self.len());
        while read != write {
            entries.push(self.slots[read].load(Ordering::Relaxed));
            read = (read + 1) % self.depth();
        }
        entries
    }
}
