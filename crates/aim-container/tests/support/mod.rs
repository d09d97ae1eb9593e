//! 容器集成测试共用的协作者桩。
#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use aim_core::{
    BoxedStream, Dialer, DialerContext, ErrorKind, FrameCodec, ServiceInstance, TransportError,
    TransportServer,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// 拨号器桩：每次拨号创建一对内存管道，把对端交给测试。
pub struct MemoryDialer {
    peers: mpsc::UnboundedSender<(String, Framed<DuplexStream, FrameCodec>)>,
    refused: Mutex<HashSet<String>>,
    dialed: Mutex<Vec<String>>,
}

impl MemoryDialer {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(String, Framed<DuplexStream, FrameCodec>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                peers: tx,
                refused: Mutex::default(),
                dialed: Mutex::default(),
            }),
            rx,
        )
    }

    pub fn refuse(&self, id: &str) {
        self.refused.lock().insert(id.to_owned());
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> Result<BoxedStream, TransportError> {
        self.dialed.lock().push(ctx.id.clone());
        if self.refused.lock().contains(&ctx.id) {
            return Err(TransportError::new(
                ErrorKind::Io,
                "test.dial_refused",
                format!("dial to {} refused", ctx.address),
            ));
        }
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let _ = self
            .peers
            .send((ctx.id.clone(), Framed::new(remote, FrameCodec::default())));
        Ok(Box::new(local))
    }
}

/// 传输服务器桩：记录每次推送，可令指定频道推送失败。
pub struct RecordingServer {
    service: ServiceInstance,
    pushes: Mutex<Vec<(String, Bytes)>>,
    failing: Mutex<HashSet<String>>,
    stop: CancellationToken,
    started: Mutex<bool>,
}

impl RecordingServer {
    pub fn new(service: ServiceInstance) -> Arc<Self> {
        Arc::new(Self {
            service,
            pushes: Mutex::default(),
            failing: Mutex::default(),
            stop: CancellationToken::new(),
            started: Mutex::new(false),
        })
    }

    pub fn fail_channel(&self, channel: &str) {
        self.failing.lock().insert(channel.to_owned());
    }

    pub fn pushes(&self) -> Vec<(String, Bytes)> {
        self.pushes.lock().clone()
    }

    pub fn pushed_channels(&self) -> Vec<String> {
        self.pushes.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn is_started(&self) -> bool {
        *self.started.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[async_trait]
impl TransportServer for RecordingServer {
    fn service(&self) -> &ServiceInstance {
        &self.service
    }

    async fn start(&self) -> Result<(), TransportError> {
        *self.started.lock() = true;
        self.stop.cancelled().await;
        Ok(())
    }

    async fn shutdown(&self, _deadline: Duration) -> Result<(), TransportError> {
        self.stop.cancel();
        Ok(())
    }

    async fn push(&self, channel_id: &str, payload: Bytes) -> Result<(), TransportError> {
        self.pushes.lock().push((channel_id.to_owned(), payload));
        if self.failing.lock().contains(channel_id) {
            return Err(TransportError::new(
                ErrorKind::ChannelNotFound,
                "test.push_failed",
                format!("channel {channel_id} rejected push"),
            ));
        }
        Ok(())
    }
}

/// 轮询直到条件成立；超时即测试失败。
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "等待条件超时：{what}");
}

/// 在后台运行容器直到显式关闭。
pub fn spawn_until_shutdown(
    container: &aim_container::Container,
) -> tokio::task::JoinHandle<Result<(), aim_container::ContainerError>> {
    let running = container.clone();
    tokio::spawn(async move { running.start_until(std::future::pending::<()>()).await })
}

pub fn instance(id: &str, service: &str) -> ServiceInstance {
    ServiceInstance::new(id, service, "10.0.0.1", 7000)
}

/// 等待 `future` 完成，避免测试在异常时永久挂起。
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("操作未在期限内完成"))
}
