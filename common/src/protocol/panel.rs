//! 面板接口 trait
//!
//! 由 HTTP 客户端实现，Controller 只依赖此 trait，
//! 便于在测试中替换为内存实现。

use std::collections::HashMap;

use async_trait::async_trait;

use super::server::ServerConfigResponse;
use super::status::NodeStatus;
use super::user::{OnlineUser, UserInfo, UserTraffic};
use crate::PanelError;

/// 单个节点会话访问面板的接口
#[async_trait]
pub trait PanelApi: Send + Sync {
    /// 面板地址，用于生成节点标签
    fn api_host(&self) -> &str;

    /// 获取用户列表
    ///
    /// 返回 `Ok(None)` 表示面板回复 304（未变更）；
    /// `Ok(Some(vec![]))` 表示面板确实没有用户。
    async fn get_user_list(&self) -> Result<Option<Vec<UserInfo>>, PanelError>;

    /// 丢弃用户列表的条件请求缓存，下次拉取返回完整列表
    fn invalidate_user_cache(&self) {}

    /// 获取其他节点上报的在线设备数（uid -> 设备数）
    async fn get_user_alive(&self) -> Result<HashMap<i64, u32>, PanelError>;

    /// 上报用户流量
    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<(), PanelError>;

    /// 上报在线设备
    async fn report_online_users(&self, users: &[OnlineUser]) -> Result<(), PanelError>;

    /// 上报主机状态
    async fn report_node_status(&self, status: &NodeStatus) -> Result<(), PanelError>;
}

/// 服务端配置变更检测
#[async_trait]
pub trait ServerConfigApi: Send + Sync {
    /// 拉取服务端配置
    ///
    /// 返回 `Ok(None)` 表示与上次拉取相比未发生变化。
    async fn fetch_server_config(&self) -> Result<Option<ServerConfigResponse>, PanelError>;
}
