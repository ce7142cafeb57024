//! 调用者内存
//!
//! 记录中的数据指针指向调用者的地址空间，驱动只通过 [`CallerMemory`] 访问它。

use crate::error::{PgpError, PgpResult};

/// 调用者地址空间
pub trait CallerMemory {
    /// 从 `addr` 读取 `dst.len()` 字节
    fn read(&self, addr: u64, dst: &mut [u8]) -> PgpResult<()>;

    /// 向 `addr` 写入 `src`
    fn write(&self, addr: u64, src: &[u8]) -> PgpResult<()>;
}

/// 当前进程的地址空间
///
/// 数据指针就是本进程内的普通指针。
#[derive(Debug)]
pub struct LocalMemory(());

impl LocalMemory {
    /// # 安全性
    /// 之后经由它访问的每个数据指针都必须指向当前进程内有效、长度足够的内存。
    pub unsafe fn new() -> Self {
        Self(())
    }

    /// 切片的地址，用于填写记录中的数据指针
    pub fn address_of<T>(data: &[T]) -> u64 {
        data.as_ptr() as usize as u64
    }

    fn pointer(addr: u64) -> PgpResult<*mut u8> {
        match usize::try_from(addr) {
            Ok(ptr) if ptr != 0 => Ok(ptr as *mut u8),
            _ => Err(PgpError::Fault(addr)),
        }
    }
}

impl CallerMemory for LocalMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> PgpResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let src = Self::pointer(addr)?;
        unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn write(&self, addr: u64, src: &[u8]) -> PgpResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let dst = Self::pointer(addr)?;
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_through_local_pointers() {
        let memory = unsafe { LocalMemory::new() };
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];

        memory.read(LocalMemory::address_of(&src), &mut dst).unwrap();
        assert_eq!(dst, src);

        memory.write(LocalMemory::address_of(&dst), &[9, 9]).unwrap();
        assert_eq!(dst, [9, 9, 3, 4]);
    }

    #[test]
    fn null_pointer_faults() {
        let memory = unsafe { LocalMemory::new() };
        let mut dst = [0u8; 4];
        assert_eq!(memory.read(0, &mut dst), Err(PgpError::Fault(0)));
        assert_eq!(memory.write(0, &[1]), Err(PgpError::Fault(0)));
        // 空拷贝不访问指针
        assert_eq!(memory.write(0, &[]), Ok(()));
    }
}
