/// 握手协议
///
/// 在 TLS（或明文）连接建立后、多路复用会话开始前，双方交换一次
/// 请求/响应，格式为 2 字节大端长度前缀 + JSON 消息体。
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// 协议类型标签，不匹配即失败，不做协商
pub const PROTOCOL_TYPE: &str = "tls-mux/1";

/// 长度字段为 u16，消息体最大 65535 字节
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// 握手消息（请求和响应使用同一结构）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// 协议类型标签
    #[serde(rename = "type")]
    pub msg_type: String,
    /// 发送方的 peer 名称
    #[serde(rename = "peer_name")]
    pub peer_name: String,
    /// 发送方希望接收方为发送方打开的子流提供的服务（无则为空）
    #[serde(default)]
    pub service: String,
}

impl Message {
    /// 创建当前协议版本的消息
    pub fn new(peer_name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            msg_type: PROTOCOL_TYPE.to_string(),
            peer_name: peer_name.into(),
            service: service.into(),
        }
    }

    /// 序列化为消息体，超长时在写出任何字节前失败
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)
            .map_err(|e| TunnelError::protocol(format!("failed to encode message: {}", e)))?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(TunnelError::MessageTooLong { len: body.len() });
        }
        Ok(body)
    }

    /// 从消息体解析并校验协议类型
    pub fn decode(body: &[u8]) -> Result<Self> {
        let msg: Message = serde_json::from_slice(body)
            .map_err(|e| TunnelError::protocol(format!("malformed message: {}", e)))?;
        if msg.msg_type != PROTOCOL_TYPE {
            return Err(TunnelError::protocol(format!(
                "unsupported protocol type {:?}",
                msg.msg_type
            )));
        }
        Ok(msg)
    }
}

/// 写出一帧：2 字节大端长度 + 消息体
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(body.len())
        .map_err(|_| TunnelError::MessageTooLong { len: body.len() })?;

    // 合并成一次写入，避免长度和消息体被拆成两个 TLS 记录
    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取一帧消息体
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// 发送一条握手消息
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = msg.encode()?;
    write_frame(writer, &body).await
}

/// 接收一条握手消息
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader).await?;
    Message::decode(&body)
}

/// 客户端握手：发送请求，等待并校验响应
pub async fn client_handshake<S>(stream: &mut S, request: &Message) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, request).await?;
    let reply = read_message(stream).await?;
    debug!(
        "Handshake reply from peer '{}' (service: {:?})",
        reply.peer_name, reply.service
    );
    Ok(reply)
}

/// 服务端握手：读取请求，由 `respond` 决定响应内容
pub async fn server_handshake<S, F>(stream: &mut S, respond: F) -> Result<(Message, Message)>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&Message) -> Message,
{
    let request = read_message(stream).await?;
    let reply = respond(&request);
    write_message(stream, &reply).await?;
    Ok((request, reply))
}
