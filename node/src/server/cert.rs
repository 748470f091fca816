//! 节点 TLS 证书管理
//!
//! 按节点的证书模式决定证书来源：
//! - `none` / 空 / `file`：证书由外部提供，不做任何处理
//! - `self`：本地生成 30 年有效期的自签名证书，不续期
//! - `http` / `dns`：通过 ACME 客户端申请，每日检查，剩余有效期不足 30 天时续期

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{CertificateParams, DnType, KeyPair};
use time::OffsetDateTime;
use tracing::{debug, info};

use common::protocol::server::{NodeInfo, Protocol};

use super::config::CertConfig;
use super::listener::cert_paths;

/// 剩余有效期不超过该天数时续期
pub const RENEW_BEFORE_DAYS: i64 = 30;

/// 自签名证书有效期（年）
const SELF_SIGNED_YEARS: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("不支持的证书模式: {0}")]
    UnsupportedMode(String),

    #[error("读写证书文件 {path} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("生成自签名证书失败: {0}")]
    Generate(String),

    #[error("解析证书失败: {0}")]
    Parse(String),

    #[error("ACME 客户端执行失败: {0}")]
    Client(String),

    #[error("ACME 请求超时 ({0:?})")]
    Timeout(Duration),
}

fn io_error(path: &Path, source: std::io::Error) -> CertError {
    CertError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// 证书模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertMode {
    None,
    File,
    SelfSigned,
    Http,
    Dns {
        provider: String,
        env: Vec<(String, String)>,
    },
}

impl CertMode {
    pub fn from_protocol(p: &Protocol) -> Result<Self, CertError> {
        match p.cert_mode.as_str() {
            "none" | "" => Ok(CertMode::None),
            "file" => Ok(CertMode::File),
            "self" => Ok(CertMode::SelfSigned),
            "http" => Ok(CertMode::Http),
            "dns" => Ok(CertMode::Dns {
                provider: p.cert_dns_provider.clone(),
                env: parse_dns_env(&p.cert_dns_env),
            }),
            other => Err(CertError::UnsupportedMode(other.to_string())),
        }
    }

    /// 是否通过 ACME 申请（需要定期续期）
    pub fn is_acme(&self) -> bool {
        matches!(self, CertMode::Http | CertMode::Dns { .. })
    }
}

/// 解析按行分隔的 `KEY=VALUE`，忽略格式不正确的行
pub fn parse_dns_env(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// PEM 格式的证书与私钥
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPair {
    pub cert: String,
    pub key: String,
}

/// 外部证书签发客户端
#[async_trait]
pub trait CertClient: Send + Sync {
    async fn obtain(&self, domain: &str) -> Result<CertPair, CertError>;

    async fn renew(&self, domain: &str, existing: &str) -> Result<CertPair, CertError>;
}

/// ACME 验证方式
#[derive(Debug, Clone)]
enum Challenge {
    Http,
    Dns {
        provider: String,
        env: Vec<(String, String)>,
    },
}

/// 调用 lego 命令行完成 ACME 申请与续期
///
/// 账户数据保存在 `{cert.dir}/acme`，按邮箱区分。
pub struct LegoClient {
    lego_path: String,
    data_dir: PathBuf,
    email: String,
    challenge: Challenge,
    timeout: Duration,
}

impl LegoClient {
    pub fn new(config: &CertConfig, mode: &CertMode) -> Result<Self, CertError> {
        let challenge = match mode {
            CertMode::Http => Challenge::Http,
            CertMode::Dns { provider, env } => Challenge::Dns {
                provider: provider.clone(),
                env: env.clone(),
            },
            other => return Err(CertError::UnsupportedMode(format!("{:?}", other))),
        };
        Ok(Self {
            lego_path: config.lego_path.clone(),
            data_dir: config.dir.join("acme"),
            email: config.email.clone(),
            challenge,
            timeout: Duration::from_secs(config.timeout),
        })
    }

    fn args(&self, domain: &str) -> Vec<String> {
        let mut args = vec![
            "--accept-tos".to_string(),
            "--email".to_string(),
            self.email.clone(),
            "--path".to_string(),
            self.data_dir.display().to_string(),
            "--domains".to_string(),
            domain.to_string(),
        ];
        match &self.challenge {
            Challenge::Http => {
                args.push("--http".to_string());
                args.push("--http.port".to_string());
                args.push(":80".to_string());
            }
            Challenge::Dns { provider, .. } => {
                args.push("--dns".to_string());
                args.push(provider.clone());
            }
        }
        args
    }

    async fn run(&self, domain: &str, action: &[&str]) -> Result<CertPair, CertError> {
        let mut cmd = tokio::process::Command::new(&self.lego_path);
        cmd.args(self.args(domain)).args(action).kill_on_drop(true);
        if let Challenge::Dns { env, .. } = &self.challenge {
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        debug!("执行 lego {:?} 申请 {} 的证书", action, domain);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CertError::Timeout(self.timeout))?
            .map_err(|e| CertError::Client(format!("无法启动 {}: {}", self.lego_path, e)))?;

        if !output.status.success() {
            return Err(CertError::Client(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let dir = self.data_dir.join("certificates");
        let cert_path = dir.join(format!("{}.crt", domain));
        let key_path = dir.join(format!("{}.key", domain));
        let cert = tokio::fs::read_to_string(&cert_path)
            .await
            .map_err(|e| io_error(&cert_path, e))?;
        let key = tokio::fs::read_to_string(&key_path)
            .await
            .map_err(|e| io_error(&key_path, e))?;
        Ok(CertPair { cert, key })
    }
}

#[async_trait]
impl CertClient for LegoClient {
    async fn obtain(&self, domain: &str) -> Result<CertPair, CertError> {
        self.run(domain, &["run"]).await
    }

    /// lego 从自己的存储目录读取现有证书
    async fn renew(&self, domain: &str, _existing: &str) -> Result<CertPair, CertError> {
        let days = RENEW_BEFORE_DAYS.to_string();
        self.run(domain, &["renew", "--days", &days]).await
    }
}

/// 证书剩余有效期是否已进入续期窗口
pub fn needs_renewal(not_after: OffsetDateTime, now: OffsetDateTime) -> bool {
    (not_after - now).whole_days() <= RENEW_BEFORE_DAYS
}

/// 读取 PEM 证书的到期时间
pub fn read_not_after(pem: &str) -> Result<OffsetDateTime, CertError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| CertError::Parse(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CertError::Parse(e.to_string()))?;
    Ok(cert.validity().not_after.to_datetime())
}

/// 生成自签名证书，SNI 同时作为 CN 与 SAN
pub fn generate_self_signed(domain: &str) -> Result<CertPair, CertError> {
    let key_pair = KeyPair::generate().map_err(|e| CertError::Generate(e.to_string()))?;
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| CertError::Generate(e.to_string()))?;
    params.distinguished_name.push(DnType::CommonName, domain);

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365 * SELF_SIGNED_YEARS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generate(e.to_string()))?;
    Ok(CertPair {
        cert: cert.pem(),
        key: key_pair.serialize_pem(),
    })
}

/// 单个节点的证书管理
pub struct CertManager {
    mode: CertMode,
    domain: String,
    cert_file: PathBuf,
    key_file: PathBuf,
    client: Option<Arc<dyn CertClient>>,
}

impl CertManager {
    pub fn new(info: &NodeInfo, config: &CertConfig) -> Result<Self, CertError> {
        let mode = CertMode::from_protocol(&info.protocol)?;
        let client: Option<Arc<dyn CertClient>> = if mode.is_acme() {
            Some(Arc::new(LegoClient::new(config, &mode)?))
        } else {
            None
        };
        let (cert_file, key_file) = cert_paths(&config.dir, info.kind, info.id);
        Ok(Self {
            mode,
            domain: info.protocol.sni.clone(),
            cert_file,
            key_file,
            client,
        })
    }

    pub fn with_client(
        mode: CertMode,
        domain: impl Into<String>,
        cert_file: PathBuf,
        key_file: PathBuf,
        client: Option<Arc<dyn CertClient>>,
    ) -> Self {
        Self {
            mode,
            domain: domain.into(),
            cert_file,
            key_file,
            client,
        }
    }

    /// 是否需要每日续期检查
    pub fn needs_renewal_task(&self) -> bool {
        self.mode.is_acme()
    }

    fn pair_exists(&self) -> bool {
        self.cert_file.exists() && self.key_file.exists()
    }

    fn acme_client(&self) -> Result<&Arc<dyn CertClient>, CertError> {
        self.client
            .as_ref()
            .ok_or_else(|| CertError::Client("未配置证书客户端".to_string()))
    }

    async fn write_pair(&self, pair: &CertPair) -> Result<(), CertError> {
        for (path, content) in [(&self.cert_file, &pair.cert), (&self.key_file, &pair.key)] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, e))?;
            }
            tokio::fs::write(path, content)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        Ok(())
    }

    /// 确保证书可用，节点启动时同步调用
    pub async fn ensure(&self) -> Result<(), CertError> {
        match &self.mode {
            CertMode::None | CertMode::File => Ok(()),
            _ if self.pair_exists() => {
                debug!("证书已存在: {}", self.cert_file.display());
                Ok(())
            }
            CertMode::SelfSigned => {
                let pair = generate_self_signed(&self.domain)?;
                self.write_pair(&pair).await?;
                info!("已为 {} 生成自签名证书: {}", self.domain, self.cert_file.display());
                Ok(())
            }
            CertMode::Http | CertMode::Dns { .. } => {
                let pair = self.acme_client()?.obtain(&self.domain).await?;
                self.write_pair(&pair).await?;
                info!("已为 {} 申请证书: {}", self.domain, self.cert_file.display());
                Ok(())
            }
        }
    }

    /// 检查到期时间，进入续期窗口时续期，返回是否发生了续期
    pub async fn renew_if_due(&self) -> Result<bool, CertError> {
        if !self.mode.is_acme() {
            return Ok(false);
        }

        let existing = tokio::fs::read_to_string(&self.cert_file)
            .await
            .map_err(|e| io_error(&self.cert_file, e))?;
        let not_after = read_not_after(&existing)?;
        if !needs_renewal(not_after, OffsetDateTime::now_utc()) {
            debug!("{} 的证书有效期至 {}，无需续期", self.domain, not_after);
            return Ok(false);
        }

        let pair = self.acme_client()?.renew(&self.domain, &existing).await?;
        self.write_pair(&pair).await?;
        info!("{} 的证书已续期", self.domain);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCertClient {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CertClient for FakeCertClient {
        async fn obtain(&self, domain: &str) -> Result<CertPair, CertError> {
            self.calls.lock().unwrap().push(format!("obtain {}", domain));
            Ok(CertPair {
                cert: "obtained-cert".to_string(),
                key: "obtained-key".to_string(),
            })
        }

        async fn renew(&self, domain: &str, existing: &str) -> Result<CertPair, CertError> {
            assert!(existing.contains("BEGIN CERTIFICATE"));
            self.calls.lock().unwrap().push(format!("renew {}", domain));
            Ok(CertPair {
                cert: "renewed-cert".to_string(),
                key: "renewed-key".to_string(),
            })
        }
    }

    fn cert_valid_for(days: i64) -> CertPair {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["node.example.com".to_string()]).unwrap();
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(60);
        params.not_after = now + time::Duration::days(days) + time::Duration::hours(1);
        let cert = params.self_signed(&key_pair).unwrap();
        CertPair {
            cert: cert.pem(),
            key: key_pair.serialize_pem(),
        }
    }

    fn manager(dir: &Path, mode: CertMode, client: Option<Arc<FakeCertClient>>) -> CertManager {
        CertManager::with_client(
            mode,
            "node.example.com",
            dir.join("trojan1.cer"),
            dir.join("trojan1.key"),
            client.map(|c| c as Arc<dyn CertClient>),
        )
    }

    #[test]
    fn test_needs_renewal_window() {
        let now = OffsetDateTime::now_utc();
        assert!(needs_renewal(now + time::Duration::days(20), now));
        assert!(needs_renewal(now + time::Duration::days(30), now));
        assert!(!needs_renewal(now + time::Duration::days(40), now));
    }

    #[test]
    fn test_read_not_after() {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["node.example.com".to_string()]).unwrap();
        params.not_after = rcgen::date_time_ymd(2040, 1, 2);
        let pem = params.self_signed(&key_pair).unwrap().pem();

        let not_after = read_not_after(&pem).unwrap();
        assert_eq!(not_after, rcgen::date_time_ymd(2040, 1, 2));

        assert!(matches!(
            read_not_after("not a certificate"),
            Err(CertError::Parse(_))
        ));
    }

    #[test]
    fn test_cert_mode_parse() {
        let mut p = Protocol::default();
        assert_eq!(CertMode::from_protocol(&p).unwrap(), CertMode::None);

        p.cert_mode = "dns".to_string();
        p.cert_dns_provider = "cloudflare".to_string();
        p.cert_dns_env = "CF_API_TOKEN=abc=def\ninvalid\n\nCF_ZONE = z".to_string();
        assert_eq!(
            CertMode::from_protocol(&p).unwrap(),
            CertMode::Dns {
                provider: "cloudflare".to_string(),
                env: vec![
                    ("CF_API_TOKEN".to_string(), "abc=def".to_string()),
                    ("CF_ZONE".to_string(), " z".to_string()),
                ],
            }
        );

        p.cert_mode = "acme".to_string();
        assert!(matches!(
            CertMode::from_protocol(&p),
            Err(CertError::UnsupportedMode(_))
        ));
    }

    #[test]
    fn test_lego_args() {
        let config = CertConfig {
            dir: PathBuf::from("/etc/panel-node"),
            email: "ops@example.com".to_string(),
            lego_path: "lego".to_string(),
            timeout: 120,
        };
        let client = LegoClient::new(&config, &CertMode::Http).unwrap();
        let args = client.args("node.example.com");
        assert_eq!(
            args,
            vec![
                "--accept-tos",
                "--email",
                "ops@example.com",
                "--path",
                "/etc/panel-node/acme",
                "--domains",
                "node.example.com",
                "--http",
                "--http.port",
                ":80",
            ]
        );

        assert!(LegoClient::new(&config, &CertMode::SelfSigned).is_err());
    }

    #[tokio::test]
    async fn test_external_modes_are_inert() {
        let dir = tempfile::tempdir().unwrap();
        for mode in [CertMode::None, CertMode::File] {
            let m = manager(dir.path(), mode, None);
            m.ensure().await.unwrap();
            assert!(!m.renew_if_due().await.unwrap());
            assert!(!m.needs_renewal_task());
        }
        assert!(!dir.path().join("trojan1.cer").exists());
    }

    #[tokio::test]
    async fn test_self_signed_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), CertMode::SelfSigned, None);
        m.ensure().await.unwrap();

        let cert = std::fs::read_to_string(dir.path().join("trojan1.cer")).unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        let not_after = read_not_after(&cert).unwrap();
        assert!((not_after - OffsetDateTime::now_utc()).whole_days() > 365 * 29);

        // 已存在时不重新生成
        m.ensure().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("trojan1.cer")).unwrap(),
            cert
        );
        assert!(!m.needs_renewal_task());
    }

    #[tokio::test]
    async fn test_acme_obtain_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeCertClient::default());
        let m = manager(dir.path(), CertMode::Http, Some(client.clone()));

        m.ensure().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("trojan1.key")).unwrap(),
            "obtained-key"
        );
        // 已存在时不再申请
        m.ensure().await.unwrap();
        assert_eq!(*client.calls.lock().unwrap(), vec!["obtain node.example.com"]);
    }

    #[tokio::test]
    async fn test_renew_only_inside_window() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeCertClient::default());
        let m = manager(dir.path(), CertMode::Http, Some(client.clone()));

        // 剩余 40 天，不续期
        let pair = cert_valid_for(40);
        m.write_pair(&pair).await.unwrap();
        assert!(!m.renew_if_due().await.unwrap());
        assert!(client.calls.lock().unwrap().is_empty());

        // 剩余 20 天，续期并覆盖文件
        let pair = cert_valid_for(20);
        m.write_pair(&pair).await.unwrap();
        assert!(m.renew_if_due().await.unwrap());
        assert_eq!(*client.calls.lock().unwrap(), vec!["renew node.example.com"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("trojan1.cer")).unwrap(),
            "renewed-cert"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("trojan1.key")).unwrap(),
            "renewed-key"
        );
    }

    #[tokio::test]
    async fn test_renew_failure_keeps_files() {
        struct FailingClient;

        #[async_trait]
        impl CertClient for FailingClient {
            async fn obtain(&self, _domain: &str) -> Result<CertPair, CertError> {
                Err(CertError::Client("rate limited".to_string()))
            }

            async fn renew(&self, _domain: &str, _existing: &str) -> Result<CertPair, CertError> {
                Err(CertError::Client("rate limited".to_string()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let m = CertManager::with_client(
            CertMode::Http,
            "node.example.com",
            dir.path().join("a.cer"),
            dir.path().join("a.key"),
            Some(Arc::new(FailingClient)),
        );
        assert!(m.ensure().await.is_err());

        let pair = cert_valid_for(5);
        m.write_pair(&pair).await.unwrap();
        assert!(m.renew_if_due().await.is_err());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.cer")).unwrap(),
            pair.cert
        );
    }
}
