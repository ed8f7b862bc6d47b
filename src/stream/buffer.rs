//! 定长样本缓冲区
//!
//! 启动时一次性分配，生命周期内不再分配；可选 mlock 防止 page fault

use std::ops::{Deref, DerefMut};

/// Ping/Pong 标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTag {
    A,
    B,
}

impl BufferTag {
    /// 交替：A → B → A
    #[inline]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// 定长 PCM word 缓冲区
pub struct SampleBuffer {
    words: Box<[u16]>,
    memory_locked: bool,
}

impl SampleBuffer {
    /// 分配全零缓冲区
    pub fn zeroed(capacity_words: usize) -> Self {
        Self {
            words: vec![0u16; capacity_words].into_boxed_slice(),
            memory_locked: false,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// 清零整个缓冲区
    #[inline]
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 服务周期回调内的 page fault 会直接导致丢包。失败时只记录日志
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }

        let ptr = self.words.as_ptr() as *const libc::c_void;
        let len = std::mem::size_of_val(&*self.words);

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked = true;
            log::debug!("Sample buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock sample buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    pub fn unlock_memory(&mut self) {
        if !self.memory_locked {
            return;
        }

        let ptr = self.words.as_ptr() as *const libc::c_void;
        let len = std::mem::size_of_val(&*self.words);

        unsafe {
            libc::munlock(ptr, len);
        }

        self.memory_locked = false;
        log::debug!("Sample buffer memory unlocked");
    }

    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked
    }
}

impl Deref for SampleBuffer {
    type Target = [u16];

    fn deref(&self) -> &[u16] {
        &self.words
    }
}

impl DerefMut for SampleBuffer {
    fn deref_mut(&mut self) -> &mut [u16] {
        &mut self.words
    }
}

impl Drop for SampleBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// 把 PCM word 切片视为字节切片（小端目标上即 USB 线上格式）
#[inline]
pub fn words_as_bytes(words: &[u16]) -> &[u8] {
    // u16 → u8 对齐要求只会变宽松，长度按字节数计算
    unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, std::mem::size_of_val(words)) }
}
