//! # Container：网格容器的生命周期编排
//!
//! ## 核心意图（Why）
//! - 每个业务进程显式构造一个 [`Container`]，以克隆句柄的方式注入需要它的协作者（不使用进程级全局变量）；
//! - 容器拥有依赖服务的连接表、当前选择器、依赖集合与单调推进的生命周期状态。
//!
//! ## 行为契约（What）
//! - 状态只能按 `Uninitialized → Initialized → Started → Closed` 推进，每次迁移都是 CAS；
//!   在错误状态下调用返回 [`ContainerError::LifecycleViolation`]，状态不变；
//! - 后台任务（传输服务循环、发现订阅、预热计时器、分发循环）全部登记在同一个 [`TaskTracker`] 上，
//!   并共享同一个关闭令牌，`shutdown` 可以取消并在期限内等待它们退出。
//!
//! ## 风险提示（Trade-offs）
//! - 建链由一把进程级异步锁串行化，依赖很多且频繁抖动时会成为瓶颈；注册表本身的
//!   插入即检查语义在没有这把锁时也能维持“每实例至多一条连接”。

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use aim_core::{Dialer, Naming, TransportServer};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::error::ContainerError;
use crate::options::ContainerOptions;
use crate::registry::ClientRegistry;
use crate::selector::{HashSelector, Selector};
use crate::signal;

/// 容器生命周期状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initialized = 1,
    Started = 2,
    Closed = 3,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Started => "started",
            LifecycleState::Closed => "closed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Initialized,
            2 => LifecycleState::Started,
            _ => LifecycleState::Closed,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务网格容器。克隆得到的是同一容器的另一个句柄。
#[derive(Clone)]
pub struct Container {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    state: AtomicU8,
    pub(crate) options: ContainerOptions,
    server: OnceLock<Arc<dyn TransportServer>>,
    dependencies: OnceLock<Vec<String>>,
    pub(crate) registries: DashMap<String, Arc<ClientRegistry>>,
    naming: RwLock<Option<Arc<dyn Naming>>>,
    dialer: RwLock<Option<Arc<dyn Dialer>>>,
    pub(crate) selector: ArcSwap<Box<dyn Selector>>,
    pub(crate) build_lock: AsyncMutex<()>,
    /// 取消全部后台任务。
    pub(crate) shutdown: CancellationToken,
    /// `shutdown` 完成后触发，唤醒阻塞在 `start_until` 上的调用方。
    closed: CancellationToken,
    pub(crate) tracker: TaskTracker,
    runtime: OnceLock<Handle>,
    registered: AtomicBool,
}

impl Default for Container {
    fn default() -> Self {
        Self::new(ContainerOptions::default())
    }
}

impl Container {
    pub fn new(options: ContainerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(LifecycleState::Uninitialized as u8),
                options,
                server: OnceLock::new(),
                dependencies: OnceLock::new(),
                registries: DashMap::new(),
                naming: RwLock::new(None),
                dialer: RwLock::new(None),
                selector: ArcSwap::from_pointee(Box::new(HashSelector)),
                build_lock: AsyncMutex::new(()),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
                tracker: TaskTracker::new(),
                runtime: OnceLock::new(),
                registered: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.inner.options
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// 本地传输服务器；`init` 之前为 `None`。
    pub fn server(&self) -> Option<Arc<dyn TransportServer>> {
        self.inner.server.get().cloned()
    }

    /// 本地服务实例 ID；`init` 之前为 `None`。
    pub fn service_id(&self) -> Option<&str> {
        self.inner.server.get().map(|server| server.service_id())
    }

    pub fn dependencies(&self) -> &[String] {
        self.inner
            .dependencies
            .get()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn registry(&self, service: &str) -> Option<Arc<ClientRegistry>> {
        self.inner
            .registries
            .get(service)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn set_naming(&self, naming: Arc<dyn Naming>) {
        *self.inner.naming.write() = Some(naming);
    }

    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.inner.dialer.write() = Some(dialer);
    }

    /// 替换默认选择器，运行期间调用同样生效。
    pub fn set_selector(&self, selector: impl Selector) {
        self.inner.selector.store(Arc::new(Box::new(selector)));
    }

    pub(crate) fn naming(&self) -> Option<Arc<dyn Naming>> {
        self.inner.naming.read().clone()
    }

    pub(crate) fn dialer(&self) -> Option<Arc<dyn Dialer>> {
        self.inner.dialer.read().clone()
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// 在 `start` 捕获的运行时上启动受跟踪任务，发现回调可能来自运行时之外的线程；
    /// 任务需自行观察关闭令牌。
    pub(crate) fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.inner.runtime.get() {
            Some(runtime) => {
                self.inner.tracker.spawn_on(task, runtime);
            }
            None => {
                self.inner.tracker.spawn(task);
            }
        }
    }

    /// 与 [`Container::spawn_tracked`] 相同，但关闭令牌触发时直接丢弃任务。
    pub(crate) fn spawn_cancellable<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.inner.shutdown.clone();
        self.spawn_tracked(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = task => {}
            }
        });
    }

    fn transition(
        &self,
        operation: &'static str,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), ContainerError> {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| ContainerError::LifecycleViolation {
                operation,
                expected: from.as_str(),
                actual: LifecycleState::from_u8(actual).as_str(),
            })
    }

    /// 记录本地传输服务器与依赖服务集合，为每个依赖分配空的连接表。
    pub fn init<I, S>(
        &self,
        server: Arc<dyn TransportServer>,
        dependencies: I,
    ) -> Result<(), ContainerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transition("init", LifecycleState::Uninitialized, LifecycleState::Initialized)?;

        let mut seen = HashSet::new();
        let dependencies: Vec<String> = dependencies
            .into_iter()
            .map(Into::into)
            .filter(|name| seen.insert(name.clone()))
            .collect();
        for name in &dependencies {
            self.inner
                .registries
                .insert(name.clone(), Arc::new(ClientRegistry::new(name.clone())));
        }
        info!(
            service = %server.service_id(),
            dependencies = ?dependencies,
            "container initialized"
        );
        let _ = self.inner.server.set(server);
        let _ = self.inner.dependencies.set(dependencies);
        Ok(())
    }

    /// 启动容器并阻塞到收到进程终止信号，随后执行 [`Container::shutdown`]。
    pub async fn start(&self) -> Result<(), ContainerError> {
        self.start_until(signal::termination()).await
    }

    /// 启动容器并阻塞到 `stop` 完成，随后执行 [`Container::shutdown`]。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：依次启动传输服务循环、每个依赖一个发现订阅任务、按需自注册，
    ///   然后等待 `stop` 或其它句柄发起的关闭；
    /// - **契约 (What)**：未配置命名服务返回 [`ContainerError::Configuration`]；
    ///   不在 `Initialized` 状态返回 [`ContainerError::LifecycleViolation`]；
    ///   自注册失败只记录日志；若关闭已由其它句柄完成，返回 `Ok(())`。
    pub async fn start_until<F>(&self, stop: F) -> Result<(), ContainerError>
    where
        F: Future<Output = ()>,
    {
        let naming = self.naming().ok_or_else(|| ContainerError::Configuration {
            reason: "naming is not configured".into(),
        })?;
        self.transition("start", LifecycleState::Initialized, LifecycleState::Started)?;
        let server = self.server().ok_or_else(|| ContainerError::Configuration {
            reason: "transport server is not configured".into(),
        })?;
        let _ = self.inner.runtime.set(Handle::current());

        let serving = Arc::clone(&server);
        self.spawn_tracked(async move {
            if let Err(err) = serving.start().await {
                error!(error = %err, code = err.code(), "transport server stopped with error");
            }
        });

        for name in self.dependencies().to_vec() {
            let container = self.clone();
            self.spawn_cancellable(async move {
                if let Err(err) = container.connect_to_service(&name).await {
                    warn!(service = %name, error = %err, code = err.code(), "failed to watch dependency");
                }
            });
        }

        if !server.public_address().is_empty() && server.public_port() != 0 {
            match naming.register(server.service()).await {
                Ok(()) => {
                    self.inner.registered.store(true, Ordering::Release);
                    info!(
                        service = %server.service_id(),
                        address = %server.public_address(),
                        port = server.public_port(),
                        "registered with naming"
                    );
                }
                Err(err) => warn!(service = %server.service_id(), error = %err, "self registration failed"),
            }
        }
        info!(service = %server.service_id(), "container started");

        tokio::select! {
            _ = stop => {
                info!(service = %server.service_id(), "termination requested");
                match self.shutdown().await {
                    Err(ContainerError::LifecycleViolation { .. })
                        if self.state() == LifecycleState::Closed => Ok(()),
                    other => other,
                }
            }
            _ = self.inner.closed.cancelled() => Ok(()),
        }
    }

    /// 关闭容器。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：按顺序 (a) 在期限内停止传输服务器；(b) 从命名服务注销自身；
    ///   (c) 退订全部依赖；(d) 取消后台任务并在期限内等待其退出；
    /// - **契约 (What)**：仅 `Started` 状态可调用，之后的调用返回 [`ContainerError::LifecycleViolation`]；
    ///   每一步的失败只记录日志，不会中断后续步骤。
    pub async fn shutdown(&self) -> Result<(), ContainerError> {
        self.transition("shutdown", LifecycleState::Started, LifecycleState::Closed)?;
        let deadline = self.inner.options.shutdown_timeout();
        let server = self.server();
        let service_id = self.service_id().unwrap_or_default().to_owned();
        info!(service = %service_id, "container shutting down");

        if let Some(server) = &server {
            match tokio::time::timeout(deadline, server.shutdown(deadline)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(service = %service_id, error = %err, "transport shutdown failed"),
                Err(_) => warn!(service = %service_id, ?deadline, "transport shutdown timed out"),
            }
        }

        if let Some(naming) = self.naming() {
            if self.inner.registered.swap(false, Ordering::AcqRel)
                && let Err(err) = naming.deregister(&service_id).await
            {
                warn!(service = %service_id, error = %err, "deregistration failed");
            }
            for name in self.dependencies() {
                if let Err(err) = naming.unsubscribe(name).await {
                    warn!(service = %service_id, dependency = %name, error = %err, "unsubscribe failed");
                }
            }
        }

        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(deadline, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                service = %service_id,
                pending = self.inner.tracker.len(),
                "background tasks still running after shutdown deadline"
            );
        }

        self.inner.closed.cancel();
        info!(service = %service_id, "container closed");
        Ok(())
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("state", &self.state())
            .field("service", &self.service_id())
            .field("dependencies", &self.dependencies())
            .finish_non_exhaustive()
    }
}
