use crate::error::{CONNECT, HANDSHAKE, map_frame_error};
use crate::util::{TcpSocketConfig, run_with_timeout};
use aim_core::{BoxedStream, Dialer, DialerContext, FrameCodec, InnerHandshake, TransportError};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Encoder;
use tracing::debug;

/// 服务间链路的身份声明拨号器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 出站连接建立后，对端服务需要知道“是谁连进来了”，才能把该连接登记为以拨号方实例 ID 命名的频道，
///   之后的推送（`push(instance_id, ..)`）才有落点。
///
/// ## 逻辑 (How)
/// - 在 `ctx.timeout` 内完成 `connect`，应用套接字选项，再写入一帧 [`InnerHandshake`]；
/// - 两个阶段共享同一个截止时间，剩余时间不足时写握手同样以超时失败。
///
/// ## 契约 (What)
/// - 返回的流已完成握手，读写均未被缓冲层截留任何字节。
#[derive(Clone, Debug)]
pub struct TcpDialer {
    service_id: String,
    socket_config: TcpSocketConfig,
}

impl TcpDialer {
    /// `service_id` 为本地实例 ID，会写入握手帧。
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            socket_config: TcpSocketConfig::default(),
        }
    }

    pub fn with_socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.socket_config = config;
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> Result<BoxedStream, TransportError> {
        let deadline = Instant::now() + ctx.timeout;
        let mut stream =
            run_with_timeout(CONNECT, ctx.timeout, TcpStream::connect(ctx.address.as_str()))
                .await?;
        self.socket_config.apply(&stream)?;

        let mut buf = BytesMut::new();
        FrameCodec::default()
            .encode(InnerHandshake::new(self.service_id.clone()).into_frame(), &mut buf)
            .map_err(|err| map_frame_error(HANDSHAKE, err))?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        run_with_timeout(HANDSHAKE, remaining, stream.write_all(&buf)).await?;

        debug!(
            peer = %ctx.id,
            address = %ctx.address,
            local = %self.service_id,
            "inner handshake sent"
        );
        Ok(Box::new(stream))
    }
}
