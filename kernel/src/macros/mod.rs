/// 内核不变量被破坏：记录错误日志后直接 panic
///
/// 只用于逻辑错误（重复映射、重复释放、引用计数下溢等），
/// 资源不足之类的可恢复错误应当以 [`MmError`](crate::MmError) 返回
macro_rules! kernel_bug {
    ($($arg:tt)*) => {{
        error!($($arg)*);
        panic!($($arg)*)
    }};
}
