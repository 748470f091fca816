//! 节点本地配置模块
//!
//! 本地配置只包含访问面板所需的信息与少量节点级默认值，
//! 协议、端口、用户等均由面板下发。

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "/etc/panel-node/config.toml";

/// 节点配置
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    pub api: ApiConfig,

    #[serde(default)]
    pub cert: CertConfig,

    #[serde(default)]
    pub limit: LimitConfig,
}

/// 日志配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    /// 日志级别（RUST_LOG 优先）
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 日志目录，未设置时输出到控制台
    #[serde(default)]
    pub output: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
        }
    }
}

/// 面板 API 配置
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ApiConfig {
    /// 面板地址（例如 https://panel.example.com）
    pub api_host: String,

    /// 服务器 ID
    pub server_id: i64,

    /// 通信密钥
    pub secret_key: String,

    /// 请求超时（秒），0 使用默认值
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        if self.timeout == 0 {
            Duration::from_secs(default_api_timeout())
        } else {
            Duration::from_secs(self.timeout)
        }
    }
}

/// 证书配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CertConfig {
    /// 证书与 ACME 账户数据目录
    #[serde(default = "default_cert_dir")]
    pub dir: PathBuf,

    /// ACME 账户邮箱
    #[serde(default = "default_cert_email")]
    pub email: String,

    /// lego 可执行文件路径
    #[serde(default = "default_lego_path")]
    pub lego_path: String,

    /// 单次申请/续期超时（秒）
    #[serde(default = "default_cert_timeout")]
    pub timeout: u64,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            dir: default_cert_dir(),
            email: default_cert_email(),
            lego_path: default_lego_path(),
            timeout: default_cert_timeout(),
        }
    }
}

/// 节点级限制默认值，0 表示不限制
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct LimitConfig {
    /// 节点限速（Mbps）
    #[serde(default)]
    pub speed_limit: u64,

    /// 节点设备数限制
    #[serde(default)]
    pub device_limit: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/etc/panel-node")
}

fn default_cert_email() -> String {
    "node@panel.local".to_string()
}

fn default_lego_path() -> String {
    "lego".to_string()
}

fn default_cert_timeout() -> u64 {
    180
}

impl Config {
    /// 从 TOML 文件加载并校验配置
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.api_host.trim().is_empty() {
            return Err(anyhow!("api.api_host 不能为空"));
        }
        if self.api.secret_key.is_empty() {
            return Err(anyhow!("api.secret_key 不能为空"));
        }
        if self.api.server_id <= 0 {
            return Err(anyhow!("api.server_id 必须为正数: {}", self.api.server_id));
        }
        Ok(())
    }

    /// 面板地址（去掉末尾的 /）
    pub fn api_host(&self) -> &str {
        self.api.api_host.trim_end_matches('/')
    }
}
