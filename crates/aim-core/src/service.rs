//! 服务实例模型与就绪状态机。
//!
//! # 教案式注释
//! - **意图 (Why)**：新发现的实例需要一段预热期后才接收路由流量。就绪状态由发现回调与晋升计时器两个任务修改，
//!   因此放在单个原子字段中，以 CAS 完成 `Young -> Adult`，杜绝读写撕裂；
//! - **逻辑 (How)**：每个实例记录持有一个可选的 [`AbortHandle`]，代表尚未触发的晋升计时器；
//!   记录从注册表移除时取消它，重连总是创建新记录，晋升永远不会落到无关的记录上；
//! - **契约 (What)**：[`ServiceInstance::metadata_matches`] 对键 [`KEY_SERVICE_STATE`] 读取原子就绪字段，
//!   其余键查询不可变元数据映射。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::task::AbortHandle;

/// 就绪状态的元数据键。
pub const KEY_SERVICE_STATE: &str = "service_state";

/// 实例对外声明的传输协议。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Ws,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Ws => "websocket",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "ws" | "websocket" => Ok(Protocol::Ws),
            other => Err(format!("unknown protocol `{other}`")),
        }
    }
}

/// 预热状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Readiness {
    /// 刚被发现，尚在预热期，不参与路由选择。
    Young = 1,
    /// 已稳定，可接收路由流量。
    Adult = 2,
}

impl Readiness {
    pub fn as_str(self) -> &'static str {
        match self {
            Readiness::Young => "young",
            Readiness::Adult => "adult",
        }
    }

    fn from_u8(value: u8) -> Self {
        if value == Readiness::Adult as u8 {
            Readiness::Adult
        } else {
            Readiness::Young
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个正在运行的服务部署。
pub struct ServiceInstance {
    id: String,
    name: String,
    address: String,
    port: u16,
    protocol: Protocol,
    tags: Vec<String>,
    meta: BTreeMap<String, String>,
    readiness: AtomicU8,
    promotion: Mutex<Option<AbortHandle>>,
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            protocol: Protocol::Tcp,
            tags: Vec::new(),
            meta: BTreeMap::new(),
            readiness: AtomicU8::new(Readiness::Young as u8),
            promotion: Mutex::new(None),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    /// `address:port`，供拨号器直接使用。
    pub fn dial_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn readiness(&self) -> Readiness {
        Readiness::from_u8(self.readiness.load(Ordering::Acquire))
    }

    pub fn is_adult(&self) -> bool {
        self.readiness() == Readiness::Adult
    }

    pub fn mark_young(&self) {
        self.readiness.store(Readiness::Young as u8, Ordering::Release);
    }

    pub fn mark_adult(&self) {
        self.readiness.store(Readiness::Adult as u8, Ordering::Release);
    }

    /// `Young -> Adult` 的 CAS；已是 `Adult` 时返回 `false`。
    pub fn promote(&self) -> bool {
        self.readiness
            .compare_exchange(
                Readiness::Young as u8,
                Readiness::Adult as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn metadata_matches(&self, key: &str, value: &str) -> bool {
        if key == KEY_SERVICE_STATE {
            return self.readiness().as_str() == value;
        }
        self.meta.get(key).is_some_and(|v| v == value)
    }

    /// 是否同时携带全部给定标签。
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag))
    }

    /// 记录晋升计时器；若已有计时器则先取消旧的。
    pub fn arm_promotion(&self, handle: AbortHandle) {
        if let Some(previous) = self.promotion.lock().replace(handle) {
            previous.abort();
        }
    }

    /// 取消尚未触发的晋升计时器，返回是否确实取消了一个计时器。
    pub fn cancel_promotion(&self) -> bool {
        match self.promotion.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// 计时器触发后清理槽位，不调用 `abort`。
    pub fn clear_promotion(&self) {
        self.promotion.lock().take();
    }

    pub fn has_pending_promotion(&self) -> bool {
        self.promotion.lock().is_some()
    }
}

/// 克隆得到一份新记录：身份、元数据与当前就绪状态被复制，晋升计时器不随之复制。
impl Clone for ServiceInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            protocol: self.protocol,
            tags: self.tags.clone(),
            meta: self.meta.clone(),
            readiness: AtomicU8::new(self.readiness.load(Ordering::Acquire)),
            promotion: Mutex::new(None),
        }
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.dial_address())
            .field("protocol", &self.protocol)
            .field("tags", &self.tags)
            .field("readiness", &self.readiness())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn promote_is_a_one_way_cas() {
        let instance = ServiceInstance::new("chat-01", "chat", "127.0.0.1", 8000);
        assert_eq!(instance.readiness(), Readiness::Young);
        assert!(instance.metadata_matches(KEY_SERVICE_STATE, "young"));

        assert!(instance.promote());
        assert!(!instance.promote(), "第二次晋升必须失败");
        assert!(instance.metadata_matches(KEY_SERVICE_STATE, "adult"));
        assert_eq!(instance.dial_address(), "127.0.0.1:8000");
    }

    #[test]
    fn metadata_and_tags_are_queried_from_the_record() {
        let instance = ServiceInstance::new("gw-01", "gateway", "10.0.0.1", 8000)
            .with_tags(["zone-a", "edge"])
            .with_meta("zone", "a");
        assert!(instance.metadata_matches("zone", "a"));
        assert!(!instance.metadata_matches("zone", "b"));
        assert!(instance.has_tags(&["edge".to_owned()]));
        assert!(!instance.has_tags(&["core".to_owned()]));
        assert_eq!("ws".parse::<Protocol>(), Ok(Protocol::Ws));
    }

    #[tokio::test]
    async fn cancel_promotion_aborts_the_armed_timer() {
        let instance = ServiceInstance::new("chat-01", "chat", "127.0.0.1", 8000);
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        instance.arm_promotion(task.abort_handle());
        assert!(instance.has_pending_promotion());

        let cloned = instance.clone();
        assert!(!cloned.has_pending_promotion(), "克隆不应复制计时器");

        assert!(instance.cancel_promotion());
        assert!(!instance.cancel_promotion());
        let joined = task.await;
        assert!(joined.is_err_and(|err| err.is_cancelled()));
    }
}
