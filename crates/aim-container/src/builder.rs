//! 发现驱动的建链流程。
//!
//! # 教案式注释
//! - **意图 (Why)**：依赖服务的成员变化以回调形式异步到达，建链需要把“新实例”转换为已握手、
//!   已登记、已有分发循环服务的连接；
//! - **逻辑 (How)**：
//!   1. `connect_to_service` 先订阅成员变化，再做一次即时查询；即时查询得到的实例视为稳定成员，
//!      直接标记为 `Adult`；
//!   2. 回调中的新实例先标记为 `Young` 并安排晋升，再交给 `build_client`；
//!   3. `build_client` 在进程级建链锁内完成“查重 → 协议检查 → 拨号握手 → 登记 → 启动分发循环”；
//! - **契约 (What)**：同一实例至多一条连接；建链失败或发现已连接时取消刚安排的晋升计时器。

use std::sync::Arc;

use aim_core::{DialerContext, Protocol, ServiceInstance, SubscribeCallback};
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::container::{Container, LifecycleState};
use crate::dispatch;
use crate::error::ContainerError;
use crate::registry::ClientRegistry;
use crate::warmup;

impl Container {
    pub(crate) async fn connect_to_service(&self, service: &str) -> Result<(), ContainerError> {
        let naming = self.naming().ok_or_else(|| ContainerError::Configuration {
            reason: "naming is not configured".into(),
        })?;
        let registry = self.registry(service).ok_or_else(|| ContainerError::Configuration {
            reason: format!("`{service}` is not a declared dependency"),
        })?;

        let weak = self.downgrade();
        let watched = service.to_owned();
        let callback: SubscribeCallback = Arc::new(move |instances: Vec<ServiceInstance>| {
            let Some(container) = Container::upgrade(&weak) else {
                return;
            };
            let service = watched.clone();
            let worker = container.clone();
            container.spawn_cancellable(async move {
                worker.on_membership_change(&service, instances).await;
            });
        });
        naming.subscribe(service, callback).await?;
        debug!(service, "subscribed to membership changes");

        let initial = naming.find(service, &[]).await?;
        info!(service, count = initial.len(), "initial lookup");
        for instance in initial {
            let instance = Arc::new(instance);
            instance.mark_adult();
            if let Err(err) = self.build_client(&registry, instance).await {
                warn!(service, error = %err, code = err.code(), "failed to connect discovered instance");
            }
        }
        Ok(())
    }

    async fn on_membership_change(&self, service: &str, instances: Vec<ServiceInstance>) {
        if self.state() != LifecycleState::Started {
            return;
        }
        let Some(registry) = self.registry(service) else {
            return;
        };
        debug!(service, count = instances.len(), "membership changed");
        for instance in instances {
            if registry.contains(instance.id()) {
                continue;
            }
            let instance = Arc::new(instance);
            instance.mark_young();
            warmup::arm_promotion(
                &instance,
                self.inner.options.warmup_delay(),
                self.inner.shutdown.clone(),
                &self.inner.tracker,
                &tokio::runtime::Handle::current(),
            );
            match self.build_client(&registry, Arc::clone(&instance)).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    instance.cancel_promotion();
                }
                Err(err) => {
                    instance.cancel_promotion();
                    warn!(
                        service,
                        instance = %instance.id(),
                        error = %err,
                        code = err.code(),
                        "failed to connect discovered instance"
                    );
                }
            }
        }
    }

    /// 为 `instance` 建立连接并登记；已登记时返回 `Ok(None)`。
    pub(crate) async fn build_client(
        &self,
        registry: &Arc<ClientRegistry>,
        instance: Arc<ServiceInstance>,
    ) -> Result<Option<Arc<ConnectionHandle>>, ContainerError> {
        let _guard = self.inner.build_lock.lock().await;
        if registry.contains(instance.id()) {
            return Ok(None);
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(ContainerError::LifecycleViolation {
                operation: "build_client",
                expected: LifecycleState::Started.as_str(),
                actual: self.state().as_str(),
            });
        }
        if instance.protocol() != Protocol::Tcp {
            return Err(ContainerError::ProtocolMismatch {
                id: instance.id().to_owned(),
                protocol: instance.protocol(),
            });
        }
        let dialer = self.dialer().ok_or(ContainerError::DialerMissing)?;

        let options = &self.inner.options;
        let ctx = DialerContext {
            id: instance.id().to_owned(),
            name: instance.name().to_owned(),
            address: instance.dial_address(),
            timeout: options.dial_timeout(),
        };
        let stream = dialer
            .dial_and_handshake(&ctx)
            .await
            .map_err(|source| ContainerError::Connect {
                id: ctx.id.clone(),
                address: ctx.address.clone(),
                source,
            })?;

        let (handle, reader) = ConnectionHandle::open(
            instance,
            stream,
            options,
            self.inner.shutdown.child_token(),
        );
        if !registry.add(Arc::clone(&handle)) {
            handle.close().await;
            return Ok(None);
        }
        self.spawn_tracked(dispatch::run(
            self.clone(),
            Arc::clone(registry),
            Arc::clone(&handle),
            reader,
        ));
        info!(
            service = %registry.service(),
            instance = %handle.id(),
            address = %ctx.address,
            readiness = %handle.instance().readiness(),
            "connected to instance"
        );
        Ok(Some(handle))
    }
}
