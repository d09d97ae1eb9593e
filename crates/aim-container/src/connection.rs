use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aim_core::{
    BoxedStream, ErrorKind, Frame, FrameCodec, FrameError, ServiceInstance, TransportError,
};
use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::options::ContainerOptions;

const WRITE_FAILED: &str = "aim.container.connection.write_failed";
const WRITE_TIMEOUT: &str = "aim.container.connection.write_timeout";
const CLOSED: &str = "aim.container.connection.closed";

/// 分发循环持有的读半部。
pub(crate) type FrameReader = FramedRead<ReadHalf<BoxedStream>, FrameCodec>;

/// 到某个依赖实例的出站连接。
///
/// # 教案式注释
/// - **意图 (Why)**：读半部由该连接唯一的分发循环独占，写半部放在异步互斥锁后，
///   业务线程可以并发调用 [`ConnectionHandle::send`]；注册表只持有 `Arc` 用于查找；
/// - **契约 (What)**：
///   - 每次写入受 `write_wait` 约束，超时返回 [`ErrorKind::Timeout`]；
///   - [`ConnectionHandle::close`] 只生效一次：取消分发循环、尽力发送 close 帧并半关闭写端；
///   - 关闭后 `send` 返回 [`ErrorKind::Closed`]。
pub struct ConnectionHandle {
    instance: Arc<ServiceInstance>,
    writer: AsyncMutex<FramedWrite<WriteHalf<BoxedStream>, FrameCodec>>,
    write_wait: Duration,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionHandle {
    /// 拆分已握手的流，返回句柄与交给分发循环的读半部。
    pub(crate) fn open(
        instance: Arc<ServiceInstance>,
        stream: BoxedStream,
        options: &ContainerOptions,
        cancel: CancellationToken,
    ) -> (Arc<Self>, FrameReader) {
        let codec = FrameCodec::new(options.max_frame_length);
        let (read, write) = tokio::io::split(stream);
        let handle = Arc::new(Self {
            instance,
            writer: AsyncMutex::new(FramedWrite::new(write, codec)),
            write_wait: options.write_wait(),
            cancel,
            closed: AtomicBool::new(false),
        });
        (handle, FramedRead::new(read, codec))
    }

    pub fn id(&self) -> &str {
        self.instance.id()
    }

    pub fn service_name(&self) -> &str {
        self.instance.name()
    }

    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 以 `Binary` 帧发送一条已编码的报文。
    pub async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.send_frame(Frame::binary(payload)).await
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::new(
                ErrorKind::Closed,
                CLOSED,
                format!("connection to `{}` is closed", self.id()),
            ));
        }
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.write_wait, writer.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(map_write_error(self.id(), err)),
            Err(_) => Err(TransportError::new(
                ErrorKind::Timeout,
                WRITE_TIMEOUT,
                format!("write to `{}` timed out", self.id()),
            )),
        }
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 关闭连接；返回 `false` 表示此前已关闭。
    pub(crate) async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Ok(Err(err)) = tokio::time::timeout(self.write_wait, writer.send(Frame::close())).await
        {
            trace!(instance = %self.id(), error = %err, "close frame not delivered");
        }
        if let Err(err) = writer.get_mut().shutdown().await {
            trace!(instance = %self.id(), error = %err, "half-close failed");
        }
        true
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("instance", &self.instance)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn map_write_error(id: &str, err: FrameError) -> TransportError {
    let kind = match &err {
        FrameError::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe => ErrorKind::Closed,
        FrameError::Io(_) => ErrorKind::Io,
        FrameError::TooLarge { .. } | FrameError::UnknownOpCode(_) => ErrorKind::Protocol,
    };
    TransportError::new(kind, WRITE_FAILED, format!("write to `{id}` failed")).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use aim_core::OpCode;

    #[tokio::test]
    async fn send_writes_binary_frames_and_close_happens_once() {
        let (local, remote) = tokio::io::duplex(4096);
        let instance = Arc::new(ServiceInstance::new("chat-01", "chat", "127.0.0.1", 1));
        let (handle, _reader) = ConnectionHandle::open(
            instance,
            Box::new(local),
            &ContainerOptions::default(),
            CancellationToken::new(),
        );
        let mut peer = FramedRead::new(remote, FrameCodec::default());

        handle
            .send(Bytes::from_static(b"payload"))
            .await
            .expect("写入应成功");
        let frame = peer.next().await.expect("对端应收到帧").expect("帧合法");
        assert_eq!(frame.op_code(), OpCode::Binary);
        assert_eq!(frame.payload().as_ref(), b"payload");

        assert!(handle.close().await);
        assert!(!handle.close().await, "重复关闭必须是空操作");
        assert!(handle.cancellation().is_cancelled());

        let close = peer.next().await.expect("应收到 close 帧").expect("帧合法");
        assert_eq!(close.op_code(), OpCode::Close);
        assert!(peer.next().await.is_none(), "半关闭后对端读到 EOF");

        let err = handle
            .send(Bytes::from_static(b"late"))
            .await
            .expect_err("关闭后不可再写");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
