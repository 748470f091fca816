//! 面板访问错误类型

/// 访问面板接口时的结构化错误
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    /// 网络层失败（连接、超时等），下个周期重试
    #[error("访问 {url} 失败: {message}")]
    Transport { url: String, message: String },

    /// 面板返回 4xx/5xx
    #[error("访问 {url} 失败: HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    /// 响应体格式不符合预期
    #[error("解码 {url} 响应失败: {message}")]
    Decode { url: String, message: String },

    /// 协议类型不受支持
    #[error("不支持的节点类型: {0}")]
    UnsupportedProtocol(String),
}

impl PanelError {
    /// 是否为可重试的远端错误（网络错误或 5xx）
    pub fn is_transient(&self) -> bool {
        match self {
            PanelError::Transport { .. } => true,
            PanelError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
