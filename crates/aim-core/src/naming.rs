use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::contract::{Naming, SubscribeCallback};
use crate::error::NamingError;
use crate::service::ServiceInstance;

#[derive(Default)]
struct State {
    /// 按注册顺序保存的实例。
    services: Vec<ServiceInstance>,
    /// 服务名 → 各会话的订阅回调，按订阅先后排列。
    subscribers: HashMap<String, Vec<(u64, SubscribeCallback)>>,
}

#[derive(Default)]
struct Shared {
    state: RwLock<State>,
    next_session: AtomicU64,
}

/// 进程内命名服务，供单机部署、演示与测试使用。
///
/// # 教案式注释
/// - **意图 (Why)**：容器只依赖 [`Naming`] 接口；在没有 Consul 之类后端的环境中，
///   多个容器经由 [`InMemoryNaming::session`] 取得同一注册表上的独立句柄，互相发现；
/// - **逻辑 (How)**：注册表与订阅者保存在一把读写锁内；订阅按 `(会话, 服务名)` 记录；
///   `register`/`deregister` 修改完成并释放锁后，以该服务的最新实例列表依次调用所有会话的回调；
/// - **契约 (What)**：同一会话对同一服务名只保留最后一次 `subscribe` 的回调，`unsubscribe` 只移除本会话的订阅；
///   重复注册同一 ID 会替换旧记录；注销不存在的 ID 返回 [`NamingError::NotFound`]。
pub struct InMemoryNaming {
    shared: Arc<Shared>,
    session: u64,
}

impl Default for InMemoryNaming {
    fn default() -> Self {
        Self::from_shared(Arc::default())
    }
}

impl InMemoryNaming {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一注册表上的另一个句柄，拥有独立的订阅集合。
    ///
    /// - **契约 (What)**：实例的注册与查询在所有会话间共享；每个容器应持有自己的会话，
    ///   以免退订时移除其他容器对同名服务的订阅。
    pub fn session(&self) -> Self {
        Self::from_shared(Arc::clone(&self.shared))
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        let session = shared.next_session.fetch_add(1, Ordering::Relaxed);
        Self { shared, session }
    }

    /// 所有会话当前持有的订阅总数。
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .state
            .read()
            .subscribers
            .values()
            .map(Vec::len)
            .sum()
    }

    fn snapshot(state: &State, name: &str) -> Vec<ServiceInstance> {
        state
            .services
            .iter()
            .filter(|service| service.name() == name)
            .cloned()
            .collect()
    }

    fn notify(&self, name: &str) {
        let (callbacks, services) = {
            let state = self.shared.state.read();
            let callbacks: Vec<SubscribeCallback> = state
                .subscribers
                .get(name)
                .map(|entries| entries.iter().map(|(_, callback)| Arc::clone(callback)).collect())
                .unwrap_or_default();
            (callbacks, Self::snapshot(&state, name))
        };
        if callbacks.is_empty() {
            return;
        }
        debug!(
            service = name,
            count = services.len(),
            subscribers = callbacks.len(),
            "notify naming subscribers"
        );
        for callback in callbacks {
            callback(services.clone());
        }
    }
}

#[async_trait]
impl Naming for InMemoryNaming {
    async fn find(&self, name: &str, tags: &[String]) -> Result<Vec<ServiceInstance>, NamingError> {
        let state = self.shared.state.read();
        Ok(state
            .services
            .iter()
            .filter(|service| service.name() == name && service.has_tags(tags))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, name: &str, callback: SubscribeCallback) -> Result<(), NamingError> {
        let mut state = self.shared.state.write();
        let entries = state.subscribers.entry(name.to_owned()).or_default();
        match entries.iter_mut().find(|(session, _)| *session == self.session) {
            Some((_, existing)) => *existing = callback,
            None => entries.push((self.session, callback)),
        }
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) -> Result<(), NamingError> {
        let mut state = self.shared.state.write();
        if let Some(entries) = state.subscribers.get_mut(name) {
            entries.retain(|(session, _)| *session != self.session);
            if entries.is_empty() {
                state.subscribers.remove(name);
            }
        }
        Ok(())
    }

    async fn register(&self, service: &ServiceInstance) -> Result<(), NamingError> {
        {
            let mut state = self.shared.state.write();
            state.services.retain(|existing| existing.id() != service.id());
            state.services.push(service.clone());
        }
        self.notify(service.name());
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), NamingError> {
        let name = {
            let mut state = self.shared.state.write();
            let index = state
                .services
                .iter()
                .position(|existing| existing.id() == id)
                .ok_or_else(|| NamingError::NotFound { id: id.to_owned() })?;
            state.services.remove(index).name().to_owned()
        };
        self.notify(&name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn register_and_deregister_notify_subscribers_with_current_members() {
        let naming = InMemoryNaming::new();
        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
        let sink = Arc::clone(&seen);
        naming
            .subscribe(
                "chat",
                Arc::new(move |services: Vec<ServiceInstance>| {
                    sink.lock()
                        .push(services.iter().map(|s| s.id().to_owned()).collect());
                }),
            )
            .await
            .expect("订阅不应失败");

        let chat = ServiceInstance::new("chat-01", "chat", "127.0.0.1", 8001);
        let gateway = ServiceInstance::new("gw-01", "gateway", "127.0.0.1", 8000);
        naming.register(&chat).await.expect("register chat");
        naming.register(&gateway).await.expect("register gateway");
        naming.deregister("chat-01").await.expect("deregister chat");

        assert_eq!(
            *seen.lock(),
            vec![vec!["chat-01".to_owned()], Vec::<String>::new()],
            "只通知被订阅的服务名，且携带变更后的完整成员"
        );
        assert!(matches!(
            naming.deregister("chat-01").await,
            Err(NamingError::NotFound { .. })
        ));
    }

    fn recorder(seen: &Arc<Mutex<Vec<usize>>>) -> SubscribeCallback {
        let sink = Arc::clone(seen);
        Arc::new(move |services: Vec<ServiceInstance>| sink.lock().push(services.len()))
    }

    #[tokio::test]
    async fn sessions_keep_their_own_subscriptions_to_a_shared_registry() {
        let gateway = InMemoryNaming::new();
        let relay = gateway.session();
        let first: Arc<Mutex<Vec<usize>>> = Arc::default();
        let second: Arc<Mutex<Vec<usize>>> = Arc::default();
        gateway.subscribe("chat", recorder(&first)).await.expect("订阅");
        relay.subscribe("chat", recorder(&second)).await.expect("订阅");
        assert_eq!(gateway.subscriber_count(), 2);

        relay
            .register(&ServiceInstance::new("chat-01", "chat", "h", 1))
            .await
            .expect("register");
        assert_eq!(*first.lock(), vec![1], "另一会话的注册同样通知");
        assert_eq!(*second.lock(), vec![1]);

        gateway.unsubscribe("chat").await.expect("退订");
        assert_eq!(relay.subscriber_count(), 1, "只移除本会话的订阅");
        gateway.deregister("chat-01").await.expect("deregister");
        assert_eq!(*first.lock(), vec![1]);
        assert_eq!(*second.lock(), vec![1, 0]);

        let replaced: Arc<Mutex<Vec<usize>>> = Arc::default();
        relay.subscribe("chat", recorder(&replaced)).await.expect("重复订阅");
        assert_eq!(relay.subscriber_count(), 1, "同一会话重复订阅替换旧回调");
        assert_eq!(relay.find("chat", &[]).await.expect("find").len(), 0);
    }

    #[tokio::test]
    async fn find_filters_by_name_and_tags() {
        let naming = InMemoryNaming::new();
        naming
            .register(&ServiceInstance::new("a", "chat", "h", 1).with_tags(["blue"]))
            .await
            .expect("register a");
        naming
            .register(&ServiceInstance::new("b", "chat", "h", 2))
            .await
            .expect("register b");

        let all = naming.find("chat", &[]).await.expect("find");
        assert_eq!(all.len(), 2);
        let blue = naming.find("chat", &["blue".to_owned()]).await.expect("find");
        assert_eq!(blue.len(), 1);
        assert_eq!(blue[0].id(), "a");

        naming.unsubscribe("chat").await.expect("幂等退订");
        assert_eq!(naming.subscriber_count(), 0);
    }
}
