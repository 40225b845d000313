use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// 传输层连接抽象
///
/// 统一封装原始 TCP、TLS 与 mux 子流，转发器与处理器只依赖这个 trait
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 类型擦除后的连接
pub type BoxedTransport = Pin<Box<dyn Transport>>;

/// 将任意连接装箱
pub fn boxed<T: Transport>(io: T) -> BoxedTransport {
    Box::pin(io)
}
