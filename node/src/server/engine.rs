//! 代理引擎接口
//!
//! Core 通过 `ProxyEngine` 增删监听器与用户，接口为同步调用，
//! 以监听器标签为键，对同一标签的重复增删是幂等的。
//! `LocalEngine` 是进程内的监听器/用户注册表，传输层实现挂接在它上面。

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, info};

use super::listener::{ListenerConfig, UserBinding};
use super::traffic::TrafficRegistry;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("监听器不存在: {0}")]
    ListenerNotFound(String),

    #[error("端口 {port} 已被监听器 {tag} 占用")]
    PortInUse { port: u16, tag: String },

    #[error("引擎已关闭")]
    Closed,
}

/// 代理引擎接口
pub trait ProxyEngine: Send + Sync {
    /// 注册监听器；同标签重复注册时替换配置并保留已有用户
    fn add_listener(&self, config: ListenerConfig) -> Result<(), EngineError>;

    /// 注销监听器；标签不存在时视为成功
    fn remove_listener(&self, tag: &str) -> Result<(), EngineError>;

    /// 向监听器添加用户，返回添加数量
    fn add_users(&self, tag: &str, users: &[UserBinding]) -> Result<usize, EngineError>;

    /// 从监听器移除用户；不存在的用户被忽略
    fn remove_users(&self, tag: &str, user_tags: &[String]) -> Result<(), EngineError>;

    /// 关闭引擎，之后的调用均返回 `EngineError::Closed`
    fn close(&self) -> Result<(), EngineError>;
}

struct ListenerEntry {
    config: ListenerConfig,
    users: HashMap<String, UserBinding>,
}

#[derive(Default)]
struct EngineState {
    closed: bool,
    listeners: HashMap<String, ListenerEntry>,
}

/// 进程内引擎注册表
pub struct LocalEngine {
    traffic: TrafficRegistry,
    state: RwLock<EngineState>,
}

impl LocalEngine {
    pub fn new(traffic: TrafficRegistry) -> Self {
        Self {
            traffic,
            state: RwLock::new(EngineState::default()),
        }
    }

    pub fn listener(&self, tag: &str) -> Option<ListenerConfig> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.listeners.get(tag).map(|l| l.config.clone())
    }

    pub fn listener_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.listeners.len()
    }

    pub fn user_tags(&self, tag: &str) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut tags: Vec<String> = state
            .listeners
            .get(tag)
            .map(|l| l.users.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }

    /// 按客户端出示的密钥查找用户标签
    pub fn authenticate(&self, tag: &str, secret: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.listeners.get(tag).and_then(|l| {
            l.users
                .values()
                .find(|u| u.credential.secret() == secret)
                .map(|u| u.user_tag.clone())
        })
    }

    /// 数据面记账
    pub fn account(&self, tag: &str, user_tag: &str, upload: u64, download: u64) {
        let counter = self.traffic.counter(tag);
        let storage = counter.get(user_tag);
        storage.add_upload(upload);
        storage.add_download(download);
    }
}

impl ProxyEngine for LocalEngine {
    fn add_listener(&self, config: ListenerConfig) -> Result<(), EngineError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(EngineError::Closed);
        }

        if let Some((tag, _)) = state
            .listeners
            .iter()
            .find(|(tag, l)| l.config.port == config.port && **tag != config.tag)
        {
            return Err(EngineError::PortInUse {
                port: config.port,
                tag: tag.clone(),
            });
        }

        let tag = config.tag.clone();
        match state.listeners.get_mut(&tag) {
            Some(entry) => entry.config = config,
            None => {
                info!("监听器 {} 已注册: {}:{}", tag, config.listen, config.port);
                state.listeners.insert(
                    tag,
                    ListenerEntry {
                        config,
                        users: HashMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn remove_listener(&self, tag: &str) -> Result<(), EngineError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(EngineError::Closed);
        }
        if state.listeners.remove(tag).is_some() {
            info!("监听器 {} 已注销", tag);
        }
        Ok(())
    }

    fn add_users(&self, tag: &str, users: &[UserBinding]) -> Result<usize, EngineError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(EngineError::Closed);
        }
        let entry = state
            .listeners
            .get_mut(tag)
            .ok_or_else(|| EngineError::ListenerNotFound(tag.to_string()))?;

        for user in users {
            entry.users.insert(user.user_tag.clone(), user.clone());
        }
        debug!("[{}] 当前用户数: {}", tag, entry.users.len());
        Ok(users.len())
    }

    fn remove_users(&self, tag: &str, user_tags: &[String]) -> Result<(), EngineError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(EngineError::Closed);
        }
        let entry = state
            .listeners
            .get_mut(tag)
            .ok_or_else(|| EngineError::ListenerNotFound(tag.to_string()))?;

        for user_tag in user_tags {
            entry.users.remove(user_tag);
        }
        debug!("[{}] 当前用户数: {}", tag, entry.users.len());
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.listeners.clear();
        Ok(())
    }
}
