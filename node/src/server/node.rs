//! 节点集合：按服务端配置为每个启用的协议创建一个 Controller

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use common::protocol::server::{NodeInfo, ServerData};
use common::PanelApi;

use super::config::Config;
use super::controller::Controller;
use super::core::Core;
use super::panel::PanelClient;

pub struct Node {
    controllers: Vec<Controller>,
    total: usize,
    disabled: usize,
}

impl Node {
    /// 为每个启用的协议构建 Controller
    ///
    /// 已禁用的条目被跳过；不支持的协议类型只影响该条目本身，记录日志后跳过。
    pub fn new<F>(core: Arc<Core>, server_id: i64, data: &ServerData, make_api: F) -> Result<Self>
    where
        F: Fn(&NodeInfo) -> Result<Arc<dyn PanelApi>>,
    {
        let protocols = data.protocols.as_deref().unwrap_or_default();
        let mut controllers = Vec::new();
        let mut disabled = 0;

        for protocol in protocols {
            if !protocol.enable {
                disabled += 1;
                continue;
            }
            let info = match NodeInfo::from_protocol(server_id, data, protocol) {
                Ok(info) => info,
                Err(e) => {
                    warn!("跳过端口 {} 上的节点: {}", protocol.port, e);
                    continue;
                }
            };
            let api = make_api(&info)
                .with_context(|| format!("创建 {} 节点的面板客户端失败", info.kind))?;
            controllers.push(Controller::new(core.clone(), api, info));
        }

        Ok(Self {
            controllers,
            total: protocols.len(),
            disabled,
        })
    }

    /// 使用 HTTP 面板客户端构建节点集合
    pub fn from_panel(core: Arc<Core>, config: &Config, data: &ServerData) -> Result<Self> {
        Self::new(core, config.api.server_id, data, |info| {
            let client = PanelClient::new(&config.api, &info.protocol.protocol_type)?;
            Ok(Arc::new(client) as Arc<dyn PanelApi>)
        })
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// 面板下发的协议总数
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn disabled(&self) -> usize {
        self.disabled
    }

    /// 依次启动所有节点，遇到第一个失败即停止，并关闭已启动的节点
    pub async fn start(&mut self) -> Result<()> {
        for i in 0..self.controllers.len() {
            if let Err(e) = self.controllers[i].start().await {
                let tag = self.controllers[i].tag().to_string();
                for started in self.controllers[..i].iter_mut().rev() {
                    if let Err(close_err) = started.close().await {
                        error!("回滚时关闭节点 {} 失败: {:#}", started.tag(), close_err);
                    }
                }
                return Err(e).with_context(|| format!("启动节点 {} 失败", tag));
            }
        }
        info!("已启动 {} 个节点", self.controllers.len());
        Ok(())
    }

    /// 关闭所有节点，任一失败时汇总返回错误
    pub async fn close(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for controller in &mut self.controllers {
            if let Err(e) = controller.close().await {
                error!("关闭节点 {} 失败: {:#}", controller.tag(), e);
                failures.push(format!("{}: {:#}", controller.tag(), e));
            }
        }
        if !failures.is_empty() {
            bail!("{} 个节点关闭失败: {}", failures.len(), failures.join("; "));
        }
        Ok(())
    }
}
