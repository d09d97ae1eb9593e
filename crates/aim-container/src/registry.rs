//! # ClientRegistry：单个依赖服务的连接表
//!
//! ## 核心意图（Why）
//! - 每个依赖服务一张 `DashMap`，实例 ID → 连接句柄；路由查找与建链并发进行，读路径不经过建链锁；
//!
//! ## 行为契约（What）
//! - `add`：插入即检查，ID 已存在时不覆盖并返回 `false`，保证同一实例至多一条连接；
//! - `remove` / `remove_handle`：幂等，移除时一并取消该实例尚未触发的晋升计时器；
//! - `services`：按元数据过滤并按 ID 升序返回，作为选择器的候选顺序。
//!
//! ## 风险提示（Trade-offs）
//! - `services` 每次分配新向量；候选集通常只有个位数到几十个实例，换取选择器输入的确定顺序。

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::connection::ConnectionHandle;

#[derive(Debug)]
pub struct ClientRegistry {
    service: String,
    clients: DashMap<String, Arc<ConnectionHandle>>,
}

impl ClientRegistry {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            clients: DashMap::new(),
        }
    }

    /// 所属依赖服务名。
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn add(&self, handle: Arc<ConnectionHandle>) -> bool {
        match self.clients.entry(handle.id().to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnectionHandle>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.clients.remove(id)?;
        handle.instance().cancel_promotion();
        Some(handle)
    }

    /// 仅当表中登记的正是 `handle` 时移除，避免误删同 ID 的新连接。
    pub fn remove_handle(&self, handle: &Arc<ConnectionHandle>) -> bool {
        let removed = self
            .clients
            .remove_if(handle.id(), |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        if removed {
            handle.instance().cancel_promotion();
        }
        removed
    }

    pub fn services(&self, meta_key: &str, meta_value: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .iter()
            .filter(|entry| entry.value().instance().metadata_matches(meta_key, meta_value))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
