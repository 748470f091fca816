//! 用户限速与设备数限制
//!
//! 每个节点一个 `Limiter`，记录该节点用户的限速、设备数限制和在线 IP。
//! 所有状态放在同一把读写锁后面，读取方只会看到更新前或更新后的完整状态。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use common::protocol::user::{OnlineUser, UserInfo};
use tokio::time::Instant;
use tracing::{debug, info};

use super::core::user_tag;
use super::speed_limiter::SpeedLimiter;

/// 在线 IP 超过该时长未出现则视为离线
pub const ONLINE_TTL: Duration = Duration::from_secs(5 * 60);

/// 合并两个独立配置的上限，0 表示不限制
///
/// 任一方为 0 时取另一方；都不为 0 时取较小（更严格）的值。
pub fn resolve_limit<T: Copy + Ord + Default>(a: T, b: T) -> T {
    let zero = T::default();
    if a == zero {
        b
    } else if b == zero {
        a
    } else {
        a.min(b)
    }
}

/// 合并节点默认限速与用户限速（Mbps）
pub fn resolve_speed_limit(node: u64, user: u64) -> u64 {
    resolve_limit(node, user)
}

#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    #[error("未知用户: {0}")]
    UnknownUser(String),

    #[error("用户 #{uid} 超过设备数限制 {limit}")]
    DeviceLimit { uid: i64, limit: u32 },
}

/// 节点级默认限制
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitDefaults {
    pub speed_limit: u64,
    pub device_limit: u32,
}

struct UserLimit {
    uid: i64,
    device_limit: u32,
    bucket: Option<Arc<SpeedLimiter>>,
}

#[derive(Default)]
struct LimiterState {
    users: HashMap<String, UserLimit>,
    online: HashMap<String, HashMap<String, Instant>>,
    alive: HashMap<i64, u32>,
}

pub struct Limiter {
    tag: String,
    defaults: LimitDefaults,
    state: RwLock<LimiterState>,
}

impl Limiter {
    pub fn new(tag: impl Into<String>, defaults: LimitDefaults) -> Self {
        Self {
            tag: tag.into(),
            defaults,
            state: RwLock::new(LimiterState::default()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn user_limit(&self, user: &UserInfo) -> UserLimit {
        let speed = resolve_speed_limit(self.defaults.speed_limit, user.speed_limit);
        UserLimit {
            uid: user.id,
            device_limit: resolve_limit(self.defaults.device_limit, user.device_limit),
            bucket: (speed > 0).then(|| SpeedLimiter::from_mbps(speed)),
        }
    }

    /// 增量更新用户：先删除后添加
    pub fn update_users(&self, added: &[UserInfo], deleted: &[UserInfo]) {
        let added: Vec<(String, UserLimit)> = added
            .iter()
            .map(|u| (user_tag(&self.tag, &u.uuid), self.user_limit(u)))
            .collect();

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        for user in deleted {
            let tag = user_tag(&self.tag, &user.uuid);
            state.users.remove(&tag);
            state.online.remove(&tag);
        }
        for (tag, limit) in added {
            state.users.insert(tag, limit);
        }
        debug!("[{}] 限制器用户数: {}", self.tag, state.users.len());
    }

    /// 更新其他节点上报的在线设备数
    pub fn set_alive(&self, alive: HashMap<i64, u32>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.alive = alive;
    }

    pub fn user_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .users
            .len()
    }

    /// 连接建立时检查设备数限制并记录在线 IP
    ///
    /// 返回用户的限速器；不限速时返回 `None`。
    pub fn check_limit(
        &self,
        user_tag: &str,
        ip: &str,
    ) -> Result<Option<Arc<SpeedLimiter>>, LimitError> {
        let now = Instant::now();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let LimiterState {
            users,
            online,
            alive,
        } = &mut *state;

        let user = users
            .get(user_tag)
            .ok_or_else(|| LimitError::UnknownUser(user_tag.to_string()))?;

        let ips = online.entry(user_tag.to_string()).or_default();
        ips.retain(|_, seen| now.duration_since(*seen) < ONLINE_TTL);

        if user.device_limit > 0 && !ips.contains_key(ip) {
            let elsewhere = alive.get(&user.uid).copied().unwrap_or(0);
            if elsewhere + ips.len() as u32 >= user.device_limit {
                return Err(LimitError::DeviceLimit {
                    uid: user.uid,
                    limit: user.device_limit,
                });
            }
        }

        ips.insert(ip.to_string(), now);
        Ok(user.bucket.clone())
    }

    /// 当前在线设备快照（复制，不是实时视图）
    pub fn online_devices(&self) -> Vec<OnlineUser> {
        let now = Instant::now();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let LimiterState { users, online, .. } = &mut *state;

        let mut devices = Vec::new();
        online.retain(|tag, ips| {
            ips.retain(|_, seen| now.duration_since(*seen) < ONLINE_TTL);
            match users.get(tag) {
                Some(user) if !ips.is_empty() => {
                    devices.extend(ips.keys().map(|ip| OnlineUser {
                        uid: user.uid,
                        ip: ip.clone(),
                    }));
                    true
                }
                _ => false,
            }
        });
        devices.sort();
        devices
    }
}

/// 以节点标签为键的限制器注册表
#[derive(Default)]
pub struct LimiterRegistry {
    limiters: RwLock<HashMap<String, Arc<Limiter>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为节点注册限制器，同名限制器会被替换
    pub fn add(
        &self,
        tag: &str,
        users: &[UserInfo],
        alive: HashMap<i64, u32>,
        defaults: LimitDefaults,
    ) -> Arc<Limiter> {
        let limiter = Arc::new(Limiter::new(tag, defaults));
        limiter.update_users(users, &[]);
        limiter.set_alive(alive);

        self.limiters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.to_string(), limiter.clone());
        info!("[{}] 限制器已注册: {} 个用户", tag, users.len());
        limiter
    }

    pub fn get(&self, tag: &str) -> Option<Arc<Limiter>> {
        self.limiters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .cloned()
    }

    pub fn delete(&self, tag: &str) {
        self.limiters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tag);
    }

    pub fn len(&self) -> usize {
        self.limiters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
