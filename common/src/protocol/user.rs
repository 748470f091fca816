//! 用户列表与流量/在线上报类型

use serde::{Deserialize, Serialize};

/// 面板下发的单个用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub uuid: String,
    /// 用户限速（Mbps），0 表示不限速
    #[serde(default)]
    pub speed_limit: u64,
    /// 用户设备数限制，0 表示不限制
    #[serde(default)]
    pub device_limit: u32,
}

impl UserInfo {
    /// 对账使用的唯一键：限速变更视为删除旧用户 + 新增新用户
    pub fn reconcile_key(&self) -> (&str, u64) {
        (self.uuid.as_str(), self.speed_limit)
    }
}

/// 用户列表响应体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserListBody {
    #[serde(default)]
    pub users: Option<Vec<UserInfo>>,
}

/// 其他节点上报的在线设备数：uid -> 设备数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliveMap {
    #[serde(default)]
    pub alive: std::collections::HashMap<i64, u32>,
}

/// 单个用户的流量记录（字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTraffic {
    pub uid: i64,
    pub upload: u64,
    pub download: u64,
}

impl UserTraffic {
    pub fn total(&self) -> u64 {
        self.upload + self.download
    }
}

/// 流量上报请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTrafficRequest {
    pub traffic: Vec<UserTraffic>,
}

/// 在线设备：(用户 ID, 来源 IP)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OnlineUser {
    pub uid: i64,
    pub ip: String,
}

/// 在线设备上报请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUserRequest {
    pub users: Vec<OnlineUser>,
}
