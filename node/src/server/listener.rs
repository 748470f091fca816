//! 监听器与用户凭据构建
//!
//! 根据面板下发的协议描述生成引擎可用的监听器配置，
//! 每种协议一个构建函数，由 `build_listener` 统一分发。

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;

use common::protocol::server::{NodeInfo, Protocol, ProtocolKind};
use common::protocol::user::UserInfo;

use super::core::user_tag;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("{kind} 不支持传输方式: {transport}")]
    UnsupportedTransport { kind: ProtocolKind, transport: String },

    #[error("vless 不支持加密方式: {0}")]
    UnsupportedEncryption(String),

    #[error("用户 {uuid} 的 uuid 长度不足 {len}，无法生成 {cipher} 密钥")]
    KeyTooShort {
        uuid: String,
        cipher: String,
        len: usize,
    },
}

/// 证书文件路径: `{dir}/{type}{id}.cer` 与 `{dir}/{type}{id}.key`
pub fn cert_paths(cert_dir: &Path, kind: ProtocolKind, id: i64) -> (PathBuf, PathBuf) {
    (
        cert_dir.join(format!("{}{}.cer", kind, id)),
        cert_dir.join(format!("{}{}.key", kind, id)),
    )
}

/// 引擎可用的监听器配置
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenerConfig {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub kind: ProtocolKind,
    pub transport: Transport,
    pub security: Security,
    pub settings: ProtocolSettings,
    /// 开启 http/tls 目标嗅探
    pub sniffing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "network", rename_all = "lowercase")]
pub enum Transport {
    Tcp { header: Option<HttpHeader> },
    Ws { host: String, path: String },
    Grpc { service_name: String },
    HttpUpgrade { host: String, path: String },
    SplitHttp { host: String, path: String, mode: String },
    Hysteria2,
    Tuic,
}

/// tcp 伪装 HTTP 头
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpHeader {
    pub path: String,
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Security {
    None,
    Tls {
        cert_file: PathBuf,
        key_file: PathBuf,
    },
    Reality {
        dest: String,
        server_names: Vec<String>,
        private_key: String,
        short_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolSettings {
    Vless {
        decryption: String,
    },
    Vmess,
    Trojan,
    Shadowsocks {
        cipher: String,
        /// 2022 系列加密的服务端密钥
        server_key: Option<String>,
        /// 默认用户凭据
        default_password: String,
        networks: Vec<Network>,
        iv_check: bool,
    },
    Hysteria2 {
        up_mbps: u64,
        down_mbps: u64,
        ignore_client_bandwidth: bool,
        obfs: Option<Hysteria2Obfs>,
    },
    Tuic {
        congestion_control: String,
        zero_rtt_handshake: bool,
    },
    AnyTls {
        padding_scheme: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hysteria2Obfs {
    pub kind: String,
    pub password: String,
}

/// 构建节点的监听器配置
pub fn build_listener(
    info: &NodeInfo,
    tag: &str,
    cert_dir: &Path,
) -> Result<ListenerConfig, BuildError> {
    let p = &info.protocol;
    let (transport, settings) = match info.kind {
        ProtocolKind::Vless => build_vless(p)?,
        ProtocolKind::Vmess => build_vmess(p)?,
        ProtocolKind::Trojan => build_trojan(p)?,
        ProtocolKind::Shadowsocks => build_shadowsocks(p),
        ProtocolKind::Hysteria2 => build_hysteria2(p),
        ProtocolKind::Tuic => build_tuic(p),
        ProtocolKind::AnyTls => build_anytls(p),
    };

    Ok(ListenerConfig {
        tag: tag.to_string(),
        listen: "0.0.0.0".to_string(),
        port: p.port,
        kind: info.kind,
        transport,
        security: build_security(info, cert_dir),
        settings,
        sniffing: vec!["http".to_string(), "tls".to_string()],
    })
}

fn build_security(info: &NodeInfo, cert_dir: &Path) -> Security {
    let p = &info.protocol;
    if info.requires_tls() {
        return match p.cert_mode.as_str() {
            "none" | "" => Security::None,
            _ => {
                let (cert_file, key_file) = cert_paths(cert_dir, info.kind, info.id);
                Security::Tls {
                    cert_file,
                    key_file,
                }
            }
        };
    }

    if p.security == "reality" {
        let addr = if p.reality_server_addr.is_empty() {
            &p.sni
        } else {
            &p.reality_server_addr
        };
        return Security::Reality {
            dest: format!("{}:{}", addr, p.reality_server_port),
            server_names: vec![p.sni.clone()],
            private_key: p.reality_private_key.clone(),
            short_ids: vec![p.reality_short_id.clone()],
        };
    }

    Security::None
}

/// vless/vmess 共用的传输方式
fn build_stream_transport(kind: ProtocolKind, p: &Protocol) -> Result<Transport, BuildError> {
    match p.transport.as_str() {
        "tcp" => Ok(Transport::Tcp { header: None }),
        "ws" | "websocket" => Ok(Transport::Ws {
            host: p.host.clone(),
            path: p.path.clone(),
        }),
        "grpc" => Ok(Transport::Grpc {
            service_name: p.service_name.clone(),
        }),
        "httpupgrade" => Ok(Transport::HttpUpgrade {
            host: p.host.clone(),
            path: p.path.clone(),
        }),
        "splithttp" | "xhttp" => Ok(Transport::SplitHttp {
            host: p.host.clone(),
            path: p.path.clone(),
            mode: p.xhttp_mode.clone(),
        }),
        other => Err(BuildError::UnsupportedTransport {
            kind,
            transport: other.to_string(),
        }),
    }
}

fn build_vless(p: &Protocol) -> Result<(Transport, ProtocolSettings), BuildError> {
    let decryption = match p.encryption.as_str() {
        "" | "none" => "none".to_string(),
        "mlkem768x25519plus" => {
            let mut parts = vec![
                "mlkem768x25519plus".to_string(),
                p.encryption_mode.clone(),
                format!("{}s", p.encryption_ticket),
            ];
            if !p.encryption_server_padding.is_empty() {
                parts.push(p.encryption_server_padding.clone());
            }
            parts.push(p.encryption_private_key.clone());
            parts.join(".")
        }
        other => return Err(BuildError::UnsupportedEncryption(other.to_string())),
    };

    let transport = build_stream_transport(ProtocolKind::Vless, p)?;
    Ok((transport, ProtocolSettings::Vless { decryption }))
}

fn build_vmess(p: &Protocol) -> Result<(Transport, ProtocolSettings), BuildError> {
    let transport = build_stream_transport(ProtocolKind::Vmess, p)?;
    Ok((transport, ProtocolSettings::Vmess))
}

fn build_trojan(p: &Protocol) -> Result<(Transport, ProtocolSettings), BuildError> {
    let transport = match p.transport.as_str() {
        "tcp" => Transport::Tcp { header: None },
        "ws" | "websocket" => Transport::Ws {
            host: p.host.clone(),
            path: p.path.clone(),
        },
        "grpc" => Transport::Grpc {
            service_name: p.service_name.clone(),
        },
        other => {
            return Err(BuildError::UnsupportedTransport {
                kind: ProtocolKind::Trojan,
                transport: other.to_string(),
            })
        }
    };
    Ok((transport, ProtocolSettings::Trojan))
}

fn is_ss2022(cipher: &str) -> bool {
    cipher.contains("2022")
}

fn build_shadowsocks(p: &Protocol) -> (Transport, ProtocolSettings) {
    let random: [u8; 32] = rand::random();
    let mut default_password: String = random.iter().map(|b| format!("{:02x}", b)).collect();
    let mut cipher = p.cipher.clone();
    let mut server_key = None;

    if !p.server_key.is_empty() && is_ss2022(&p.cipher) {
        server_key = Some(BASE64.encode(p.server_key.as_bytes()));
        default_password = BASE64.encode(default_password.as_bytes());
        // 2022 系列由服务端统一指定加密方式
        cipher.clear();
    }

    let mut networks = vec![Network::Tcp, Network::Udp];
    let mut transport = Transport::Tcp { header: None };

    if p.obfs == "http" {
        if !p.obfs_path.is_empty() || !p.obfs_host.is_empty() {
            networks = vec![Network::Tcp];
        }
        let path = if p.obfs_path.is_empty() {
            "/".to_string()
        } else {
            p.obfs_path.clone()
        };
        let host = (!p.obfs_host.is_empty()).then(|| p.obfs_host.clone());
        transport = Transport::Tcp {
            header: Some(HttpHeader { path, host }),
        };
    }

    (
        transport,
        ProtocolSettings::Shadowsocks {
            cipher,
            server_key,
            default_password,
            networks,
            iv_check: true,
        },
    )
}

fn build_hysteria2(p: &Protocol) -> (Transport, ProtocolSettings) {
    let obfs = match p.obfs.as_str() {
        "" | "none" => None,
        kind => Some(Hysteria2Obfs {
            kind: kind.to_string(),
            password: p.obfs_password.clone(),
        }),
    };
    (
        Transport::Hysteria2,
        ProtocolSettings::Hysteria2 {
            up_mbps: p.up_mbps,
            down_mbps: p.down_mbps,
            ignore_client_bandwidth: p.up_mbps == 0 && p.down_mbps == 0,
            obfs,
        },
    )
}

fn build_tuic(p: &Protocol) -> (Transport, ProtocolSettings) {
    (
        Transport::Tuic,
        ProtocolSettings::Tuic {
            congestion_control: p.congestion_controller.clone(),
            zero_rtt_handshake: p.reduce_rtt,
        },
    )
}

fn build_anytls(p: &Protocol) -> (Transport, ProtocolSettings) {
    let padding_scheme = if p.padding_scheme.is_empty() {
        Vec::new()
    } else {
        p.padding_scheme.split('\n').map(str::to_string).collect()
    };
    (
        Transport::Tcp { header: None },
        ProtocolSettings::AnyTls { padding_scheme },
    )
}

/// 用户在引擎中的凭据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credential {
    Vless { id: String, flow: String },
    Vmess { id: String },
    /// trojan / hysteria2 / anytls
    Password { password: String },
    Tuic { uuid: String, password: String },
    Shadowsocks { cipher: String, password: String },
    Shadowsocks2022 { key: String },
}

impl Credential {
    /// 客户端握手时出示的密钥
    pub fn secret(&self) -> &str {
        match self {
            Credential::Vless { id, .. } | Credential::Vmess { id } => id,
            Credential::Password { password }
            | Credential::Tuic { password, .. }
            | Credential::Shadowsocks { password, .. } => password,
            Credential::Shadowsocks2022 { key } => key,
        }
    }
}

/// 绑定到监听器上的用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserBinding {
    pub user_tag: String,
    pub uid: i64,
    pub credential: Credential,
}

fn ss2022_key_len(cipher: &str) -> usize {
    match cipher {
        "2022-blake3-aes-128-gcm" => 16,
        _ => 32,
    }
}

fn build_credential(kind: ProtocolKind, p: &Protocol, user: &UserInfo) -> Result<Credential, BuildError> {
    let uuid = user.uuid.clone();
    let credential = match kind {
        ProtocolKind::Vless => Credential::Vless {
            id: uuid,
            flow: p.flow.clone(),
        },
        ProtocolKind::Vmess => Credential::Vmess { id: uuid },
        ProtocolKind::Trojan | ProtocolKind::Hysteria2 | ProtocolKind::AnyTls => {
            Credential::Password { password: uuid }
        }
        ProtocolKind::Tuic => Credential::Tuic {
            password: uuid.clone(),
            uuid,
        },
        ProtocolKind::Shadowsocks if is_ss2022(&p.cipher) => {
            let len = ss2022_key_len(&p.cipher);
            let raw = user.uuid.get(..len).ok_or_else(|| BuildError::KeyTooShort {
                uuid: user.uuid.clone(),
                cipher: p.cipher.clone(),
                len,
            })?;
            Credential::Shadowsocks2022 {
                key: BASE64.encode(raw.as_bytes()),
            }
        }
        ProtocolKind::Shadowsocks => Credential::Shadowsocks {
            cipher: p.cipher.clone(),
            password: uuid,
        },
    };
    Ok(credential)
}

/// 为一组用户生成引擎凭据
pub fn build_users(
    info: &NodeInfo,
    tag: &str,
    users: &[UserInfo],
) -> Result<Vec<UserBinding>, BuildError> {
    users
        .iter()
        .map(|user| {
            Ok(UserBinding {
                user_tag: user_tag(tag, &user.uuid),
                uid: user.id,
                credential: build_credential(info.kind, &info.protocol, user)?,
            })
        })
        .collect()
}
