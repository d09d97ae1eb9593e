//! 出站转发与入站本地投递。
//!
//! # 教案式注释
//! - **意图 (Why)**：业务逻辑只说“把这条报文交给 chat 服务”，由容器挑选已就绪的实例；
//!   下游处理完毕后把结果推回发起方，发起方再扇出到本地频道；
//! - **逻辑 (How)**：
//!   - `forward`：校验 → 写入回程地址 `dest.server` → 仅在 `Adult` 实例中选择 → 查表 → 编码发送；
//!   - `push`：目的实例已知，经本地传输服务器按频道推送（对端以身份握手接入，频道 ID 即实例 ID）；
//!   - `deliver_locally`：确认目的是本地服务 → 拆出目的频道 → 去掉路由元数据后逐个推送；
//! - **契约 (What)**：容器不重试；单个频道推送失败不影响其余频道。

use std::sync::Arc;

use aim_core::{
    Header, KEY_SERVICE_STATE, META_DEST_CHANNELS, META_DEST_SERVER, Readiness, RoutedPacket,
    TransportServer,
};
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::container::{Container, LifecycleState};
use crate::error::{ContainerError, DeliveryError, RoutingError};
use crate::selector::Selector;

/// 一次本地投递的结果。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl Container {
    /// 用当前选择器把报文转发给 `service` 的某个就绪实例。
    pub async fn forward(&self, service: &str, packet: RoutedPacket) -> Result<(), ContainerError> {
        let selector = self.inner.selector.load_full();
        self.forward_with_selector(service, packet, &**selector)
            .await
    }

    pub async fn forward_with_selector(
        &self,
        service: &str,
        mut packet: RoutedPacket,
        selector: &dyn Selector,
    ) -> Result<(), ContainerError> {
        if packet.command().is_empty() {
            return Err(ContainerError::Validation { field: "command" });
        }
        if packet.channel_id().is_empty() {
            return Err(ContainerError::Validation {
                field: "channel_id",
            });
        }
        let server = self.local_server("forward")?;
        packet.set_meta(META_DEST_SERVER, server.service_id());

        let handle = self.lookup(service, &packet.header, selector)?;
        debug!(
            service,
            instance = %handle.id(),
            command = %packet.command(),
            channel = %packet.channel_id(),
            "forward packet"
        );
        handle.send(packet.encode()?).await?;
        Ok(())
    }

    /// 在 `service` 的就绪实例中为 `header` 选出一条连接。
    pub fn lookup(
        &self,
        service: &str,
        header: &Header,
        selector: &dyn Selector,
    ) -> Result<Arc<ConnectionHandle>, ContainerError> {
        let registry = self.registry(service).ok_or_else(|| RoutingError::NotFound {
            service: service.to_owned(),
        })?;
        let candidates = registry.services(KEY_SERVICE_STATE, Readiness::Adult.as_str());
        let id = selector
            .lookup(header, &candidates)
            .ok_or_else(|| RoutingError::NoReadyInstance {
                service: service.to_owned(),
            })?;
        registry.get(id).ok_or_else(|| {
            RoutingError::ConnectionMissing {
                service: service.to_owned(),
                id: id.to_owned(),
            }
            .into()
        })
    }

    /// 把报文直接推送给已知的实例。
    pub async fn push(&self, instance_id: &str, mut packet: RoutedPacket) -> Result<(), ContainerError> {
        let server = self.local_server("push")?;
        packet.set_meta(META_DEST_SERVER, instance_id);
        debug!(
            instance = instance_id,
            command = %packet.command(),
            channel = %packet.channel_id(),
            "push packet"
        );
        server.push(instance_id, packet.encode()?).await?;
        Ok(())
    }

    /// 把下游送回的报文投递到本地频道。
    pub async fn deliver_locally(
        &self,
        mut packet: RoutedPacket,
    ) -> Result<DeliveryReport, ContainerError> {
        let server = self.local_server("deliver_locally")?;
        let local = server.service_id();
        let destination = packet.get_str_meta(META_DEST_SERVER);
        if destination != Some(local) {
            let err = DeliveryError::DestinationMismatch {
                expected: destination.map(str::to_owned),
                local: local.to_owned(),
            };
            warn!(command = %packet.command(), error = %err, "stale route, packet dropped");
            return Err(err.into());
        }

        let channels: Vec<String> = packet
            .get_str_meta(META_DEST_CHANNELS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|channel| !channel.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        if channels.is_empty() {
            return Err(DeliveryError::MissingChannels.into());
        }

        packet.remove_meta(META_DEST_SERVER);
        packet.remove_meta(META_DEST_CHANNELS);
        let payload = packet.encode()?;
        debug!(command = %packet.command(), channels = ?channels, "deliver locally");

        let mut report = DeliveryReport::default();
        for channel in channels {
            match server.push(&channel, payload.clone()).await {
                Ok(()) => report.delivered.push(channel),
                Err(err) => {
                    warn!(channel = %channel, error = %err, "local push failed");
                    report.failed.push(channel);
                }
            }
        }
        Ok(report)
    }

    fn local_server(
        &self,
        operation: &'static str,
    ) -> Result<Arc<dyn TransportServer>, ContainerError> {
        self.server()
            .ok_or_else(|| ContainerError::LifecycleViolation {
                operation,
                expected: LifecycleState::Initialized.as_str(),
                actual: self.state().as_str(),
            })
    }
}
