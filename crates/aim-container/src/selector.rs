//! 路由选择策略。
//!
//! # 教案式注释
//! - **意图 (Why)**：同一会话频道的流量应粘滞到同一下游实例，避免会话状态在实例间来回迁移；
//! - **逻辑 (How)**：默认策略对 `channel_id` 计算 CRC-32/IEEE，对候选数量取模后索引候选列表；
//! - **契约 (What)**：候选列表与路由键固定时结果确定；列表为空时返回 `None`；
//! - **风险 (Trade-offs)**：候选集合变化时频道可能被映射到其它实例，不提供一致性哈希式的最小迁移保证。

use aim_core::Header;

/// 从候选实例 ID 中挑选一个。
pub trait Selector: Send + Sync + 'static {
    fn lookup<'a>(&self, header: &Header, candidates: &'a [String]) -> Option<&'a str>;
}

/// CRC-32/IEEE 校验和。
pub fn hash_code(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// 按频道 ID 哈希取模的默认选择器。
#[derive(Clone, Copy, Debug, Default)]
pub struct HashSelector;

impl Selector for HashSelector {
    fn lookup<'a>(&self, header: &Header, candidates: &'a [String]) -> Option<&'a str> {
        if candidates.is_empty() {
            return None;
        }
        let index = hash_code(&header.channel_id) as usize % candidates.len();
        candidates.get(index).map(String::as_str)
    }
}
