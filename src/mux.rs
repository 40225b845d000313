/// 多路复用会话
///
/// 一个 `Session` 对应一条已认证的传输连接，其上承载任意多个双向子流。
/// yamux 的 `Connection` 只能由单一任务轮询，因此由驱动任务独占：
/// 入站子流放入有界队列供 `accept` 取用，出站请求经通道交给驱动任务创建。
///
/// yamux 不提供单独的 GoAway 帧，`go_away` 在本端实现：之后到达的入站子流直接复位。
use crate::config::MuxConfig;
use crate::error::{Result, TunnelError};
use crate::transport::BoxedTransport;
use futures::future::poll_fn;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yamux::{Connection, ConnectionError, Mode};

/// yamux 每个子流的默认接收窗口
const STREAM_WINDOW: usize = 256 * 1024;

/// yamux 默认的连接级接收窗口
const DEFAULT_CONNECTION_WINDOW: usize = 1024 * 1024 * 1024;

/// 排队等待驱动任务处理的出站请求上限
const OPEN_QUEUE: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type OpenReply = oneshot::Sender<std::result::Result<yamux::Stream, ConnectionError>>;

/// 由 `MuxConfig` 构建 yamux 配置
///
/// yamux 在设置时断言连接窗口不小于 256 KiB × 子流数，
/// 这里先放开窗口再设置子流数，避免中间状态触发断言。
pub fn yamux_config(config: &MuxConfig) -> yamux::Config {
    let window = config
        .receive_window
        .unwrap_or(DEFAULT_CONNECTION_WINDOW)
        .max(STREAM_WINDOW.saturating_mul(config.max_streams));

    let mut cfg = yamux::Config::default();
    cfg.set_max_connection_receive_window(None);
    cfg.set_max_num_streams(config.max_streams);
    cfg.set_max_connection_receive_window(Some(window));
    cfg
}

/// 多路复用会话句柄
pub struct Session {
    id: u64,
    open_tx: mpsc::Sender<OpenReply>,
    inbound: Mutex<mpsc::Receiver<yamux::Stream>>,
    closed: CancellationToken,
    going_away: Arc<AtomicBool>,
    streams: Arc<AtomicUsize>,
    open_timeout: Duration,
}

impl Session {
    /// 在已认证的连接上创建会话并启动驱动任务
    ///
    /// 参数在此时冻结，之后的配置重载不影响已存在的会话
    pub fn new(io: BoxedTransport, config: &MuxConfig, mode: Mode) -> Arc<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(io.compat(), yamux_config(config), mode);

        let (open_tx, open_rx) = mpsc::channel(OPEN_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.accept_backlog.max(1));
        let closed = CancellationToken::new();
        let going_away = Arc::new(AtomicBool::new(false));

        let session = Arc::new(Self {
            id,
            open_tx,
            inbound: Mutex::new(inbound_rx),
            closed: closed.clone(),
            going_away: going_away.clone(),
            streams: Arc::new(AtomicUsize::new(0)),
            open_timeout: config.open_timeout(),
        });

        let driver = Driver {
            id,
            conn,
            open_rx,
            inbound_tx,
            closed,
            going_away,
            close_timeout: config.close_timeout(),
        };
        tokio::spawn(driver.run());

        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 接受下一个入站子流；会话关闭后返回 `SessionClosed`
    pub async fn accept(&self) -> Result<MuxStream> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            stream = inbound.recv() => match stream {
                Some(stream) => Ok(MuxStream::new(stream, self.streams.clone())),
                None => Err(TunnelError::SessionClosed),
            },
            _ = self.closed.cancelled() => Err(TunnelError::SessionClosed),
        }
    }

    /// 打开一个出站子流，受创建会话时冻结的打开超时约束
    pub async fn open(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx
            .send(reply_tx)
            .await
            .map_err(|_| TunnelError::SessionClosed)?;

        let stream = tokio::time::timeout(self.open_timeout, reply_rx)
            .await
            .map_err(|_| TunnelError::timeout(self.open_timeout))?
            .map_err(|_| TunnelError::SessionClosed)??;
        Ok(MuxStream::new(stream, self.streams.clone()))
    }

    /// 底层连接关闭后永久为真
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 不再接受对端打开的新子流；已有子流与本端 `open` 不受影响
    pub fn go_away(&self) {
        if !self.going_away.swap(true, Ordering::AcqRel) {
            debug!("Session {} is going away", self.id);
        }
    }

    pub fn is_going_away(&self) -> bool {
        self.going_away.load(Ordering::Acquire)
    }

    /// 关闭会话（幂等）
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// 等待会话关闭
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// 当前存活的子流数
    pub fn num_streams(&self) -> usize {
        self.streams.load(Ordering::Relaxed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// 驱动任务的一次事件
enum Event {
    Inbound(Option<std::result::Result<yamux::Stream, ConnectionError>>),
    Outbound(std::result::Result<yamux::Stream, ConnectionError>),
}

struct Driver {
    id: u64,
    conn: Connection<Compat<BoxedTransport>>,
    open_rx: mpsc::Receiver<OpenReply>,
    inbound_tx: mpsc::Sender<yamux::Stream>,
    closed: CancellationToken,
    going_away: Arc<AtomicBool>,
    close_timeout: Duration,
}

impl Driver {
    async fn run(mut self) {
        debug!("Session {} driver started", self.id);
        let mut waiting: VecDeque<OpenReply> = VecDeque::new();
        let mut requests_open = true;

        loop {
            // 丢弃已超时放弃的请求，避免为其创建子流
            while waiting.front().is_some_and(|w| w.is_closed()) {
                waiting.pop_front();
            }
            let want_outbound = !waiting.is_empty();
            let conn = &mut self.conn;

            let event = tokio::select! {
                _ = self.closed.cancelled() => break,
                request = self.open_rx.recv(), if requests_open => {
                    match request {
                        Some(reply) => waiting.push_back(reply),
                        None => requests_open = false,
                    }
                    continue;
                }
                event = poll_fn(|cx| poll_connection(conn, want_outbound, cx)) => event,
            };

            match event {
                Event::Outbound(result) => {
                    if let Some(reply) = waiting.pop_front() {
                        let _ = reply.send(result);
                    }
                }
                Event::Inbound(Some(Ok(stream))) if self.going_away.load(Ordering::Acquire) => {
                    debug!("Session {} is going away, refusing stream {}", self.id, stream.id());
                }
                Event::Inbound(Some(Ok(stream))) => {
                    if let Err(e) = self.inbound_tx.try_send(stream) {
                        match e {
                            mpsc::error::TrySendError::Full(_) => {
                                warn!("Session {} accept backlog full, dropping stream", self.id)
                            }
                            mpsc::error::TrySendError::Closed(_) => {
                                debug!("Session {} has no acceptor, dropping stream", self.id)
                            }
                        }
                    }
                }
                Event::Inbound(Some(Err(e))) => {
                    if is_closed_error(&e) {
                        debug!("Session {} closed: {}", self.id, e);
                    } else {
                        warn!("Session {} failed: {}", self.id, e);
                    }
                    break;
                }
                Event::Inbound(None) => {
                    debug!("Session {} closed by peer", self.id);
                    break;
                }
            }
        }

        self.closed.cancel();
        drop(waiting);

        let conn = &mut self.conn;
        match tokio::time::timeout(self.close_timeout, poll_fn(|cx| conn.poll_close(cx))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Session {} close error: {}", self.id, e),
            Err(_) => debug!("Session {} close timed out", self.id),
        }
        info!("Session {} ended", self.id);
    }
}

/// 同时推进出站创建与入站轮询；只要有出站请求在等待就优先尝试创建
fn poll_connection(
    conn: &mut Connection<Compat<BoxedTransport>>,
    want_outbound: bool,
    cx: &mut Context<'_>,
) -> Poll<Event> {
    if want_outbound {
        if let Poll::Ready(result) = conn.poll_new_outbound(cx) {
            return Poll::Ready(Event::Outbound(result));
        }
    }
    conn.poll_next_inbound(cx).map(Event::Inbound)
}

fn is_closed_error(e: &ConnectionError) -> bool {
    match e {
        ConnectionError::Closed => true,
        ConnectionError::Io(io) => matches!(
            io.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionAborted
        ),
        _ => false,
    }
}

/// 会话中的一个子流
pub struct MuxStream {
    id: String,
    inner: Compat<yamux::Stream>,
    live: Arc<AtomicUsize>,
}

impl MuxStream {
    fn new(stream: yamux::Stream, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::Relaxed);
        Self {
            id: stream.id().to_string(),
            inner: stream.compat(),
            live,
        }
    }

    /// 诊断用的子流编号
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
