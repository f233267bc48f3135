/// 内存管理使用的文件接口
///
/// 文件引用的复制与释放由 `Arc<dyn File>` 的 clone 与 drop 完成
pub trait File: Send + Sync {
    fn readable(&self) -> bool;
    fn writable(&self) -> bool;
    fn name(&self) -> &str;
    /// 从 `offset` 处读取数据，最多将 `buf` 填满，返回实际读取的字节数
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;
    /// 将 `buf` 写入到 `offset` 处，返回实际写入的字节数
    fn write_at(&self, _offset: usize, _buf: &[u8]) -> usize {
        panic!("{} not implement write_at", self.name());
    }
}
