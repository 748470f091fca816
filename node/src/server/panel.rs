//! 面板 HTTP 客户端
//!
//! `PanelClient` 对应单个节点会话，请求统一携带 protocol/server_id/secret_key 参数；
//! `ServerClient` 拉取整台服务器的配置，用 ETag 与响应体哈希判断是否变化。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use common::protocol::server::ServerConfigResponse;
use common::protocol::status::{NodeStatus, NodeStatusRequest};
use common::protocol::user::{
    AliveMap, OnlineUser, OnlineUserRequest, UserInfo, UserListBody, UserTraffic,
    UserTrafficRequest,
};
use common::{PanelApi, PanelError, ServerConfigApi};

use super::config::ApiConfig;

fn transport_error(url: &str, e: reqwest::Error) -> PanelError {
    PanelError::Transport {
        url: url.to_string(),
        message: e.to_string(),
    }
}

fn decode_error(url: &str, message: impl ToString) -> PanelError {
    PanelError::Decode {
        url: url.to_string(),
        message: message.to_string(),
    }
}

/// 4xx/5xx 转换为 `PanelError::Status`
async fn check_status(url: &str, resp: Response) -> Result<Response, PanelError> {
    let status = resp.status();
    if status.is_client_error() || status.is_server_error() {
        let body = resp.text().await.unwrap_or_default();
        return Err(PanelError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}

fn etag_of(resp: &Response) -> Option<String> {
    resp.headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn build_http_client(api: &ApiConfig) -> Result<reqwest::Client, PanelError> {
    reqwest::Client::builder()
        .timeout(api.timeout())
        .build()
        .map_err(|e| transport_error(&api.api_host, e))
}

/// 解析用户列表；空响应体视为没有用户
fn decode_user_list(url: &str, body: &[u8]) -> Result<Vec<UserInfo>, PanelError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let list: UserListBody = serde_json::from_slice(body).map_err(|e| decode_error(url, e))?;
    Ok(list.users.unwrap_or_default())
}

/// 单个节点的面板会话
pub struct PanelClient {
    client: reqwest::Client,
    api_host: String,
    protocol: String,
    server_id: i64,
    secret_key: String,
    user_etag: Mutex<Option<String>>,
}

impl PanelClient {
    pub fn new(api: &ApiConfig, protocol: &str) -> Result<Self, PanelError> {
        Ok(Self {
            client: build_http_client(api)?,
            api_host: api.api_host.trim_end_matches('/').to_string(),
            protocol: protocol.to_lowercase(),
            server_id: api.server_id,
            secret_key: api.secret_key.clone(),
            user_etag: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_host, path)
    }

    fn query(&self) -> [(&'static str, String); 3] {
        [
            ("protocol", self.protocol.clone()),
            ("server_id", self.server_id.to_string()),
            ("secret_key", self.secret_key.clone()),
        ]
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), PanelError> {
        let url = self.url(path);
        let resp = self
            .client
            .post(&url)
            .query(&self.query())
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        check_status(&url, resp).await?;
        Ok(())
    }

    async fn fetch_alive(&self) -> Result<HashMap<i64, u32>, PanelError> {
        let url = self.url("/v1/server/alivelist");
        let resp = self
            .client
            .get(&url)
            .query(&self.query())
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        let resp = check_status(&url, resp).await?;
        let body = resp.bytes().await.map_err(|e| transport_error(&url, e))?;
        let alive: AliveMap = serde_json::from_slice(&body).map_err(|e| decode_error(&url, e))?;
        Ok(alive.alive)
    }
}

#[async_trait]
impl PanelApi for PanelClient {
    fn api_host(&self) -> &str {
        &self.api_host
    }

    async fn get_user_list(&self) -> Result<Option<Vec<UserInfo>>, PanelError> {
        let url = self.url("/v1/server/user");
        let mut req = self.client.get(&url).query(&self.query());
        let etag = self
            .user_etag
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(etag) = etag {
            req = req.header(IF_NONE_MATCH, etag);
        }

        let resp = req.send().await.map_err(|e| transport_error(&url, e))?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        let resp = check_status(&url, resp).await?;
        let new_etag = etag_of(&resp);
        let body = resp.bytes().await.map_err(|e| transport_error(&url, e))?;
        let users = decode_user_list(&url, &body)?;

        *self.user_etag.lock().unwrap_or_else(|e| e.into_inner()) = new_etag;
        Ok(Some(users))
    }

    fn invalidate_user_cache(&self) {
        self.user_etag
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    async fn get_user_alive(&self) -> Result<HashMap<i64, u32>, PanelError> {
        match self.fetch_alive().await {
            Ok(alive) => Ok(alive),
            Err(e) => {
                debug!("获取在线设备列表失败，按空列表处理: {}", e);
                Ok(HashMap::new())
            }
        }
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<(), PanelError> {
        self.post(
            "/v1/server/push",
            &UserTrafficRequest {
                traffic: traffic.to_vec(),
            },
        )
        .await
    }

    async fn report_online_users(&self, users: &[OnlineUser]) -> Result<(), PanelError> {
        self.post(
            "/v1/server/online",
            &OnlineUserRequest {
                users: users.to_vec(),
            },
        )
        .await
    }

    async fn report_node_status(&self, status: &NodeStatus) -> Result<(), PanelError> {
        self.post(
            "/v1/server/status",
            &NodeStatusRequest {
                cpu: status.cpu,
                mem: status.mem,
                disk: status.disk,
                updated_at: chrono::Utc::now().timestamp_millis(),
            },
        )
        .await
    }
}

#[derive(Default)]
struct ServerCache {
    etag: Option<String>,
    body_hash: Option<String>,
}

/// 服务端配置客户端
pub struct ServerClient {
    client: reqwest::Client,
    api_host: String,
    server_id: i64,
    secret_key: String,
    cache: Mutex<ServerCache>,
}

impl ServerClient {
    pub fn new(api: &ApiConfig) -> Result<Self, PanelError> {
        Ok(Self {
            client: build_http_client(api)?,
            api_host: api.api_host.trim_end_matches('/').to_string(),
            server_id: api.server_id,
            secret_key: api.secret_key.clone(),
            cache: Mutex::new(ServerCache::default()),
        })
    }
}

#[async_trait]
impl ServerConfigApi for ServerClient {
    async fn fetch_server_config(&self) -> Result<Option<ServerConfigResponse>, PanelError> {
        let url = format!("{}/v2/server/{}", self.api_host, self.server_id);
        let mut req = self
            .client
            .get(&url)
            .query(&[("secret_key", self.secret_key.as_str())]);
        let etag = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .etag
            .clone();
        if let Some(etag) = etag {
            req = req.header(IF_NONE_MATCH, etag);
        }

        let resp = req.send().await.map_err(|e| transport_error(&url, e))?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        let resp = check_status(&url, resp).await?;
        let new_etag = etag_of(&resp);
        let body = resp.bytes().await.map_err(|e| transport_error(&url, e))?;

        let hash = format!("{:x}", Sha256::digest(&body));
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if cache.body_hash.as_deref() == Some(hash.as_str()) {
                return Ok(None);
            }
        }

        let config: ServerConfigResponse =
            serde_json::from_slice(&body).map_err(|e| decode_error(&url, e))?;
        let has_protocols = config
            .data
            .as_ref()
            .is_some_and(|data| data.protocols.is_some());
        if !has_protocols {
            warn!("服务端配置缺少协议列表: {}", url);
            return Err(decode_error(&url, "协议配置为空"));
        }

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.etag = new_etag;
        cache.body_hash = Some(hash);
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{header, HeaderMap};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::Arc;

    #[derive(Default)]
    struct FakePanelState {
        server_body: Mutex<String>,
        with_etag: std::sync::atomic::AtomicBool,
        posts: Mutex<Vec<(String, HashMap<String, String>, serde_json::Value)>>,
    }

    const USERS: &str = r#"{"users":[{"id":1,"uuid":"a","speed_limit":0,"device_limit":0},{"id":2,"uuid":"b"}]}"#;

    async fn users(Query(q): Query<HashMap<String, String>>, headers: HeaderMap) -> AxumResponse {
        match q.get("server_id").map(String::as_str) {
            // 空响应体
            Some("2") => (StatusCode::OK, "").into_response(),
            Some("3") => (StatusCode::FORBIDDEN, "bad secret").into_response(),
            _ => {
                if headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some("\"v1\"") {
                    return StatusCode::NOT_MODIFIED.into_response();
                }
                ([(header::ETAG, "\"v1\"")], USERS).into_response()
            }
        }
    }

    async fn alive(Query(q): Query<HashMap<String, String>>) -> AxumResponse {
        match q.get("server_id").map(String::as_str) {
            Some("2") => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
            _ => r#"{"alive":{"1":2}}"#.into_response(),
        }
    }

    async fn server(
        State(state): State<Arc<FakePanelState>>,
        headers: HeaderMap,
    ) -> AxumResponse {
        let body = state.server_body.lock().unwrap().clone();
        if !state.with_etag.load(std::sync::atomic::Ordering::SeqCst) {
            return body.into_response();
        }
        let etag = format!("\"{}\"", body.len());
        if headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some(etag.as_str()) {
            return StatusCode::NOT_MODIFIED.into_response();
        }
        ([(header::ETAG, etag)], body).into_response()
    }

    async fn record(
        State(state): State<Arc<FakePanelState>>,
        uri: axum::http::Uri,
        Query(q): Query<HashMap<String, String>>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        state
            .posts
            .lock()
            .unwrap()
            .push((uri.path().to_string(), q, body));
        StatusCode::OK
    }

    async fn spawn_panel(state: Arc<FakePanelState>) -> String {
        let app = Router::new()
            .route("/v1/server/user", get(users))
            .route("/v1/server/alivelist", get(alive))
            .route("/v1/server/push", post(record))
            .route("/v1/server/online", post(record))
            .route("/v1/server/status", post(record))
            .route("/v2/server/{id}", get(server))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn api(host: &str, server_id: i64) -> ApiConfig {
        ApiConfig {
            api_host: host.to_string(),
            server_id,
            secret_key: "secret".to_string(),
            timeout: 5,
        }
    }

    #[tokio::test]
    async fn test_user_list_etag_and_not_modified() {
        let host = spawn_panel(Arc::new(FakePanelState::default())).await;
        let client = PanelClient::new(&api(&host, 1), "Trojan").unwrap();

        let users = client.get_user_list().await.unwrap().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].speed_limit, 0);

        // 携带 ETag 后返回 304
        assert!(client.get_user_list().await.unwrap().is_none());

        // 清除缓存后重新拿到完整列表
        client.invalidate_user_cache();
        assert_eq!(client.get_user_list().await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_user_list_empty_body_and_errors() {
        let host = spawn_panel(Arc::new(FakePanelState::default())).await;

        let empty = PanelClient::new(&api(&host, 2), "vless").unwrap();
        assert_eq!(empty.get_user_list().await.unwrap(), Some(vec![]));

        let forbidden = PanelClient::new(&api(&host, 3), "vless").unwrap();
        match forbidden.get_user_list().await {
            Err(PanelError::Status { status, body, .. }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "bad secret");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // 连接失败
        let down = PanelClient::new(&api("http://127.0.0.1:1", 1), "vless").unwrap();
        assert!(matches!(
            down.get_user_list().await,
            Err(PanelError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_alive_list_falls_back_to_empty() {
        let host = spawn_panel(Arc::new(FakePanelState::default())).await;

        let ok = PanelClient::new(&api(&host, 1), "vless").unwrap();
        assert_eq!(ok.get_user_alive().await.unwrap(), HashMap::from([(1, 2)]));

        let failing = PanelClient::new(&api(&host, 2), "vless").unwrap();
        assert!(failing.get_user_alive().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reports_carry_query_and_body() {
        let state = Arc::new(FakePanelState::default());
        let host = spawn_panel(state.clone()).await;
        let client = PanelClient::new(&api(&host, 1), "hysteria2").unwrap();

        client
            .report_user_traffic(&[UserTraffic {
                uid: 1,
                upload: 10,
                download: 20,
            }])
            .await
            .unwrap();
        client
            .report_online_users(&[OnlineUser {
                uid: 1,
                ip: "1.2.3.4".to_string(),
            }])
            .await
            .unwrap();
        client
            .report_node_status(&NodeStatus {
                cpu: 1.5,
                mem: 20.0,
                disk: 30.0,
                uptime: 100,
            })
            .await
            .unwrap();

        let posts = state.posts.lock().unwrap();
        assert_eq!(posts.len(), 3);

        let (path, query, body) = &posts[0];
        assert_eq!(path, "/v1/server/push");
        assert_eq!(query["protocol"], "hysteria2");
        assert_eq!(query["server_id"], "1");
        assert_eq!(query["secret_key"], "secret");
        assert_eq!(
            body,
            &serde_json::json!({"traffic": [{"uid": 1, "upload": 10, "download": 20}]})
        );

        assert_eq!(posts[1].0, "/v1/server/online");
        assert_eq!(
            posts[1].2,
            serde_json::json!({"users": [{"uid": 1, "ip": "1.2.3.4"}]})
        );

        assert_eq!(posts[2].0, "/v1/server/status");
        assert_eq!(posts[2].2["cpu"], 1.5);
        assert!(posts[2].2["updated_at"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_server_config_hash_dedup() {
        let state = Arc::new(FakePanelState::default());
        *state.server_body.lock().unwrap() =
            r#"{"code":200,"msg":"ok","data":{"pull_interval":30,"protocols":[{"type":"vless","port":443,"enable":true}]}}"#
                .to_string();
        let host = spawn_panel(state.clone()).await;
        let client = ServerClient::new(&api(&host, 1)).unwrap();

        let config = client.fetch_server_config().await.unwrap().unwrap();
        assert_eq!(config.data.unwrap().pull_interval_secs(), 30);

        // 内容相同，不视为变化
        assert!(client.fetch_server_config().await.unwrap().is_none());

        // 内容变化
        *state.server_body.lock().unwrap() =
            r#"{"code":200,"msg":"ok","data":{"pull_interval":60,"protocols":[]}}"#.to_string();
        assert!(client.fetch_server_config().await.unwrap().is_some());

        // 缺少协议列表
        *state.server_body.lock().unwrap() = r#"{"code":200,"msg":"ok","data":{}}"#.to_string();
        assert!(matches!(
            client.fetch_server_config().await,
            Err(PanelError::Decode { .. })
        ));
        // 出错的响应不会更新缓存，恢复后仍视为未变化
        *state.server_body.lock().unwrap() =
            r#"{"code":200,"msg":"ok","data":{"pull_interval":60,"protocols":[]}}"#.to_string();
        assert!(client.fetch_server_config().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_config_not_modified() {
        let state = Arc::new(FakePanelState::default());
        state
            .with_etag
            .store(true, std::sync::atomic::Ordering::SeqCst);
        *state.server_body.lock().unwrap() =
            r#"{"code":200,"msg":"ok","data":{"protocols":[]}}"#.to_string();
        let host = spawn_panel(state.clone()).await;
        let client = ServerClient::new(&api(&host, 1)).unwrap();

        assert!(client.fetch_server_config().await.unwrap().is_some());
        // 面板返回 304
        assert!(client.fetch_server_config().await.unwrap().is_none());

        *state.server_body.lock().unwrap() =
            r#"{"code":200,"msg":"ok","data":{"push_interval":10,"protocols":[]}}"#.to_string();
        let config = client.fetch_server_config().await.unwrap().unwrap();
        assert_eq!(config.data.unwrap().push_interval_secs(), 10);
    }
}
