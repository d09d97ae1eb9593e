use crate::error::{
    ACCEPT, BIND, HANDSHAKE, READ, SHUTDOWN, WRITE, already_started, cancelled_error,
    channel_not_found,
    map_frame_error, map_io_error, timeout_error,
};
use crate::util::TcpSocketConfig;
use aim_core::{
    DEFAULT_MAX_FRAME_LENGTH, ErrorKind, Frame, FrameCodec, InnerHandshake, OpCode,
    ServiceInstance, TransportError, TransportServer,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 服务端连接策略。时长均以毫秒配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TcpServerOptions {
    /// 接入后等待首帧（握手）的时限。
    pub handshake_timeout_ms: u64,
    /// 入站连接允许的最长静默时间，超过即断开。
    pub read_wait_ms: u64,
    /// 单次写入的时限。
    pub write_wait_ms: u64,
    pub max_frame_length: usize,
    pub socket: TcpSocketConfig,
}

impl Default for TcpServerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            read_wait_ms: 180_000,
            write_wait_ms: 10_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            socket: TcpSocketConfig::default(),
        }
    }
}

impl TcpServerOptions {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }
}

/// 入站数据帧的业务回调。
///
/// - **契约 (What)**：同一连接上的帧按到达顺序逐个回调，回调返回前不会读取该连接的下一帧；
///   控制帧（ping/pong/close）由服务器自行处理，不会出现在这里。
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn receive(&self, channel_id: &str, payload: Bytes);

    /// 连接断开后回调，默认忽略。
    async fn disconnected(&self, _channel_id: &str) {}
}

/// 首帧鉴权：把握手帧转换为频道 ID。
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self, peer: SocketAddr, handshake: Frame) -> Result<String, TransportError>;
}

/// 默认接入策略：首帧必须是 [`InnerHandshake`]，频道 ID 即对端声明的实例 ID。
#[derive(Clone, Copy, Debug, Default)]
pub struct HandshakeAcceptor;

#[async_trait]
impl Acceptor for HandshakeAcceptor {
    async fn accept(&self, _peer: SocketAddr, handshake: Frame) -> Result<String, TransportError> {
        if handshake.op_code() != OpCode::Binary {
            return Err(TransportError::new(
                ErrorKind::Handshake,
                HANDSHAKE.code,
                format!("expected binary handshake frame, got {:?}", handshake.op_code()),
            ));
        }
        InnerHandshake::decode(handshake.payload())
            .map(|hs| hs.service_id)
            .map_err(|err| {
                TransportError::new(ErrorKind::Handshake, HANDSHAKE.code, "invalid inner handshake")
                    .with_source(err)
            })
    }
}

/// 一条已握手的入站连接。
struct Channel {
    id: String,
    peer: SocketAddr,
    writer: AsyncMutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
    write_wait: Duration,
    cancel: CancellationToken,
}

impl Channel {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.write_wait, writer.send(frame)).await {
            Ok(result) => result.map_err(|err| map_frame_error(WRITE, err)),
            Err(_) => Err(timeout_error(WRITE)),
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.get_mut().shutdown().await {
            trace!(channel = %self.id, error = %err, "tcp half-close failed");
        }
    }
}

/// [`TcpServer`] 的建造器。
///
/// - `options`：替换默认的 [`TcpServerOptions`]；
/// - `acceptor`：替换默认的 [`HandshakeAcceptor`]；
/// - `bind` / `from_listener`：完成构建，二者只差在监听器由谁创建。
pub struct TcpServerBuilder {
    service: ServiceInstance,
    listener: Arc<dyn MessageListener>,
    options: TcpServerOptions,
    acceptor: Arc<dyn Acceptor>,
}

impl TcpServerBuilder {
    pub fn options(mut self, options: TcpServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn acceptor(mut self, acceptor: Arc<dyn Acceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    pub async fn bind(self, listen: &str) -> Result<TcpServer, TransportError> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|err| map_io_error(BIND, err))?;
        self.from_listener(listener)
    }

    pub fn from_listener(self, listener: TcpListener) -> Result<TcpServer, TransportError> {
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        Ok(TcpServer {
            inner: Arc::new(Inner {
                service: self.service,
                options: self.options,
                local_addr,
                listener: Mutex::new(Some(listener)),
                channels: DashMap::new(),
                message_listener: self.listener,
                acceptor: self.acceptor,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }
}

/// 基于 Tokio 的 TCP 传输服务器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为容器提供 [`TransportServer`] 的具体实现：接受入站连接、以握手声明的 ID 登记频道、
///   把数据帧交给业务回调，并支持按频道 ID 推送。
///
/// ## 逻辑 (How)
/// - `start`：取出监听器进入接入循环，每条连接由 [`TaskTracker`] 跟踪的独立任务服务；
/// - 连接任务：握手 → 登记频道（同 ID 的旧连接被取消）→ 读循环（ping 回 pong、close 断开、
///   静默超过 `read_wait` 断开）→ 仅当登记的仍是自己时注销频道；
/// - `shutdown`：取消共享令牌，关闭跟踪器并在期限内等待全部连接任务退出。
///
/// ## 契约 (What)
/// - `start` 只能调用一次，再次调用返回 `aim.transport.tcp.already_started`；
/// - 频道表中同一 ID 至多一条连接。
///
/// ## 风险提示 (Trade-offs)
/// - 业务回调在读循环内同步等待，慢回调会阻塞该连接的后续读取，但不影响其它连接。
pub struct TcpServer {
    inner: Arc<Inner>,
}

struct Inner {
    service: ServiceInstance,
    options: TcpServerOptions,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    channels: DashMap<String, Arc<Channel>>,
    message_listener: Arc<dyn MessageListener>,
    acceptor: Arc<dyn Acceptor>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TcpServer {
    pub fn builder(service: ServiceInstance, listener: Arc<dyn MessageListener>) -> TcpServerBuilder {
        TcpServerBuilder {
            service,
            listener,
            options: TcpServerOptions::default(),
            acceptor: Arc::new(HandshakeAcceptor),
        }
    }

    /// 监听器实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn options(&self) -> &TcpServerOptions {
        &self.inner.options
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_connected(&self, channel_id: &str) -> bool {
        self.inner.channels.contains_key(channel_id)
    }

    /// 已登记频道 ID，按字典序排列。
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

impl Inner {
    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = self.options.socket.apply(&stream) {
            warn!(%peer, error = %err, "failed to configure accepted socket");
            return;
        }
        let codec = FrameCodec::new(self.options.max_frame_length);
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, codec);

        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            first = tokio::time::timeout(self.options.handshake_timeout(), reader.next()) => first,
        };
        let handshake = match first {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                warn!(%peer, error = %map_frame_error(HANDSHAKE, err), "handshake frame rejected");
                return;
            }
            Ok(None) => {
                debug!(%peer, "peer closed before handshake");
                return;
            }
            Err(_) => {
                warn!(%peer, error = %timeout_error(HANDSHAKE), "handshake not received in time");
                return;
            }
        };
        let channel_id = match self.acceptor.accept(peer, handshake).await {
            Ok(id) => id,
            Err(err) => {
                warn!(%peer, error = %err, "handshake refused");
                return;
            }
        };

        let channel = Arc::new(Channel {
            id: channel_id,
            peer,
            writer: AsyncMutex::new(FramedWrite::new(write, codec)),
            write_wait: self.options.write_wait(),
            cancel: self.shutdown.child_token(),
        });
        if let Some(previous) = self
            .channels
            .insert(channel.id.clone(), Arc::clone(&channel))
        {
            info!(
                channel = %channel.id,
                previous = %previous.peer,
                "channel re-registered, closing previous connection"
            );
            previous.cancel.cancel();
        }
        info!(channel = %channel.id, %peer, "channel accepted");

        self.read_loop(&channel, reader).await;

        self.channels
            .remove_if(&channel.id, |_, current| Arc::ptr_eq(current, &channel));
        channel.close().await;
        self.message_listener.disconnected(&channel.id).await;
        info!(channel = %channel.id, %peer, "channel closed");
    }

    async fn read_loop(&self, channel: &Channel, mut reader: FramedRead<OwnedReadHalf, FrameCodec>) {
        let read_wait = self.options.read_wait();
        let idle = tokio::time::sleep(read_wait);
        tokio::pin!(idle);
        loop {
            tokio::select! {
                _ = channel.cancel.cancelled() => {
                    trace!(channel = %channel.id, "read loop cancelled");
                    return;
                }
                _ = &mut idle => {
                    warn!(channel = %channel.id, error = %timeout_error(READ), "channel idle for too long");
                    return;
                }
                next = reader.next() => {
                    let frame = match next {
                        Some(Ok(frame)) => frame,
                        Some(Err(err)) => {
                            warn!(channel = %channel.id, error = %map_frame_error(READ, err), "read failed");
                            return;
                        }
                        None => {
                            debug!(channel = %channel.id, "peer closed connection");
                            return;
                        }
                    };
                    idle.as_mut().reset(Instant::now() + read_wait);
                    let op_code = frame.op_code();
                    if op_code.is_data() {
                        self.message_listener
                            .receive(&channel.id, frame.into_payload())
                            .await;
                        continue;
                    }
                    match op_code {
                        OpCode::Ping => {
                            if let Err(err) = channel.send(Frame::pong()).await {
                                warn!(channel = %channel.id, error = %err, "pong failed");
                                return;
                            }
                        }
                        OpCode::Close => {
                            debug!(channel = %channel.id, "close frame received");
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TransportServer for TcpServer {
    fn service(&self) -> &ServiceInstance {
        &self.inner.service
    }

    async fn start(&self) -> Result<(), TransportError> {
        let listener = self.inner.listener.lock().take().ok_or_else(already_started)?;
        info!(
            service = %self.inner.service.id(),
            addr = %self.inner.local_addr,
            "tcp server started"
        );
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let inner = Arc::clone(&self.inner);
                        self.inner.tracker.spawn(inner.serve_connection(stream, peer));
                    }
                    Err(err) => {
                        warn!(error = %map_io_error(ACCEPT, err), "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        info!(service = %self.inner.service.id(), "tcp server accept loop stopped");
        Ok(())
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), TransportError> {
        self.inner.shutdown.cancel();
        self.inner.listener.lock().take();
        self.inner.tracker.close();
        match tokio::time::timeout(deadline, self.inner.tracker.wait()).await {
            Ok(()) => {
                info!(service = %self.inner.service.id(), "tcp server stopped");
                Ok(())
            }
            Err(_) => Err(timeout_error(SHUTDOWN)),
        }
    }

    async fn push(&self, channel_id: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(cancelled_error(WRITE));
        }
        let channel = self
            .inner
            .channels
            .get(channel_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| channel_not_found(channel_id))?;
        channel.send(Frame::binary(payload)).await
    }
}
