use std::sync::Arc;

use aim_core::{Frame, FrameError, OpCode, RoutedPacket, TransportError};
use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionHandle, FrameReader};
use crate::container::Container;
use crate::registry::ClientRegistry;

/// 分发循环的退出原因。
#[derive(Debug)]
enum LoopExit {
    Cancelled,
    Idle,
    Eof,
    ReadFailed(FrameError),
    HeartbeatFailed(TransportError),
}

/// 单条出站连接的入站分发循环。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 下游服务通过这条连接把发往本地频道的报文送回来，每条连接有且只有一个读者，保证到达顺序即处理顺序。
///
/// ## 逻辑 (How)
/// - `select!` 在取消、静默超时、心跳与下一帧之间等待；帧读取由 `FramedRead` 缓冲，分支切换不会丢字节；
/// - 心跳到期发送 ping；收到任意帧都会重置静默计时；
/// - 非 `Binary` 帧直接丢弃；报文解码失败只记录日志，连接保持；解码成功交给本地投递。
///
/// ## 契约 (What)
/// - 退出时仅当注册表中登记的仍是本句柄才移除，然后关闭连接；整个清理只在此处发生一次。
pub(crate) async fn run(
    container: Container,
    registry: Arc<ClientRegistry>,
    handle: Arc<ConnectionHandle>,
    mut reader: FrameReader,
) {
    let options = container.options().clone();
    let read_wait = options.read_wait();
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + options.heartbeat(), options.heartbeat());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(read_wait);
    tokio::pin!(idle);

    let exit = loop {
        tokio::select! {
            _ = handle.cancellation().cancelled() => break LoopExit::Cancelled,
            _ = &mut idle => break LoopExit::Idle,
            _ = heartbeat.tick() => {
                trace!(instance = %handle.id(), "heartbeat ping");
                if let Err(err) = handle.send_frame(Frame::ping()).await {
                    break LoopExit::HeartbeatFailed(err);
                }
            }
            next = reader.next() => {
                let frame = match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => break LoopExit::ReadFailed(err),
                    None => break LoopExit::Eof,
                };
                idle.as_mut().reset(Instant::now() + read_wait);
                if frame.op_code() == OpCode::Binary {
                    dispatch_frame(&container, &handle, frame).await;
                } else {
                    trace!(instance = %handle.id(), op_code = ?frame.op_code(), "control frame dropped");
                }
            }
        }
    };

    registry.remove_handle(&handle);
    handle.close().await;
    match exit {
        LoopExit::Cancelled => debug!(instance = %handle.id(), "read loop cancelled"),
        LoopExit::Eof => info!(
            service = %registry.service(),
            instance = %handle.id(),
            "connection closed by peer"
        ),
        LoopExit::Idle => warn!(
            service = %registry.service(),
            instance = %handle.id(),
            read_wait = ?read_wait,
            "connection idle, dropped"
        ),
        LoopExit::ReadFailed(err) => warn!(
            service = %registry.service(),
            instance = %handle.id(),
            error = %err,
            "read failed, connection dropped"
        ),
        LoopExit::HeartbeatFailed(err) => warn!(
            service = %registry.service(),
            instance = %handle.id(),
            error = %err,
            "heartbeat failed, connection dropped"
        ),
    }
}

async fn dispatch_frame(container: &Container, handle: &ConnectionHandle, frame: Frame) {
    let packet = match RoutedPacket::decode(frame.payload()) {
        Ok(packet) => packet,
        Err(err) => {
            warn!(instance = %handle.id(), error = %err, "undecodable packet discarded");
            return;
        }
    };
    trace!(instance = %handle.id(), header = %packet.header, "inbound packet");
    if let Err(err) = container.deliver_locally(packet).await {
        warn!(instance = %handle.id(), error = %err, code = err.code(), "local delivery rejected");
    }
}
