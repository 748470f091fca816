//! 主机状态上报类型

use serde::{Deserialize, Serialize};

/// 采集到的主机状态
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeStatus {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub uptime: u64,
}

/// 主机状态上报请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusRequest {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    /// 毫秒时间戳
    pub updated_at: i64,
}
