//! 服务端配置相关类型
//!
//! 面板通过 `/v2/server/{id}` 下发整台服务器的配置，
//! 其中 `protocols` 列表的每一项对应一个节点（监听端点）。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::PanelError;

/// 面板未下发或下发非正数时使用的默认推送/拉取间隔（秒）
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// 服务端配置响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigResponse {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    pub data: Option<ServerData>,
}

/// 服务端配置主体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerData {
    /// 流量上报阈值（KB）
    pub traffic_report_threshold: i64,
    /// 流量上报间隔（秒）
    pub push_interval: i64,
    /// 用户列表拉取间隔（秒）
    pub pull_interval: i64,
    pub protocols: Option<Vec<Protocol>>,
    /// 面板侧配置的协议总数（包含已禁用的）
    pub total: i64,
}

impl ServerData {
    pub fn push_interval_secs(&self) -> u64 {
        normalize_interval(self.push_interval)
    }

    pub fn pull_interval_secs(&self) -> u64 {
        normalize_interval(self.pull_interval)
    }
}

fn normalize_interval(value: i64) -> u64 {
    if value <= 0 {
        DEFAULT_INTERVAL_SECS
    } else {
        value as u64
    }
}

/// 单个协议端点的描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Protocol {
    #[serde(rename = "type")]
    pub protocol_type: String,
    pub port: u16,
    pub enable: bool,
    pub security: String,
    pub sni: String,
    pub allow_insecure: bool,
    pub fingerprint: String,
    pub reality_server_addr: String,
    pub reality_server_port: u16,
    pub reality_private_key: String,
    pub reality_public_key: String,
    pub reality_short_id: String,
    pub transport: String,
    pub host: String,
    pub path: String,
    pub service_name: String,
    pub cipher: String,
    pub server_key: String,
    pub flow: String,
    pub hop_ports: String,
    pub hop_interval: i64,
    pub obfs_password: String,
    pub disable_sni: bool,
    pub reduce_rtt: bool,
    pub udp_relay_mode: String,
    pub congestion_controller: String,
    pub multiplex: String,
    pub padding_scheme: String,
    pub up_mbps: u64,
    pub down_mbps: u64,
    pub obfs: String,
    pub obfs_host: String,
    pub obfs_path: String,
    pub xhttp_mode: String,
    pub xhttp_extra: String,
    pub encryption: String,
    pub encryption_mode: String,
    pub encryption_rtt: String,
    pub encryption_ticket: String,
    pub encryption_server_padding: String,
    pub encryption_private_key: String,
    pub encryption_client_padding: String,
    pub encryption_password: String,
    pub cert_mode: String,
    pub cert_dns_provider: String,
    /// `KEY=VALUE` 形式、按行分隔的 DNS 服务商凭据
    pub cert_dns_env: String,
}

/// 支持的协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Hysteria2,
    Tuic,
    AnyTls,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Vless => "vless",
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Trojan => "trojan",
            ProtocolKind::Shadowsocks => "shadowsocks",
            ProtocolKind::Hysteria2 => "hysteria2",
            ProtocolKind::Tuic => "tuic",
            ProtocolKind::AnyTls => "anytls",
        }
    }

    /// 该协议在给定 security 配置下是否需要 TLS 证书
    ///
    /// tuic 与 hysteria2 基于 QUIC，始终需要证书；shadowsocks 从不需要。
    pub fn requires_tls(&self, security: &str) -> bool {
        match self {
            ProtocolKind::Tuic | ProtocolKind::Hysteria2 => true,
            ProtocolKind::Shadowsocks => false,
            _ => security == "tls",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vless" => Ok(ProtocolKind::Vless),
            "vmess" => Ok(ProtocolKind::Vmess),
            "trojan" => Ok(ProtocolKind::Trojan),
            "shadowsocks" => Ok(ProtocolKind::Shadowsocks),
            "hysteria" | "hysteria2" => Ok(ProtocolKind::Hysteria2),
            "tuic" => Ok(ProtocolKind::Tuic),
            "anytls" => Ok(ProtocolKind::AnyTls),
            _ => Err(PanelError::UnsupportedProtocol(s.to_string())),
        }
    }
}

/// 一个节点（监听端点）的完整信息
///
/// 在一个 Controller 生命周期内不可变，重载时整体替换。
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: i64,
    pub kind: ProtocolKind,
    pub push_interval: u64,
    pub pull_interval: u64,
    /// 流量上报阈值（KB），0 表示有流量即上报
    pub traffic_report_threshold: u64,
    pub protocol: Protocol,
}

impl NodeInfo {
    /// 由服务端配置中的一项协议构建节点信息
    pub fn from_protocol(
        server_id: i64,
        data: &ServerData,
        protocol: &Protocol,
    ) -> Result<Self, PanelError> {
        let kind = protocol.protocol_type.parse::<ProtocolKind>()?;
        Ok(Self {
            id: server_id,
            kind,
            push_interval: data.push_interval_secs(),
            pull_interval: data.pull_interval_secs(),
            traffic_report_threshold: data.traffic_report_threshold.max(0) as u64,
            protocol: protocol.clone(),
        })
    }

    /// 是否需要 TLS 证书
    pub fn requires_tls(&self) -> bool {
        self.kind.requires_tls(&self.protocol.security)
    }
}
