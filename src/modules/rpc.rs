// 原生插件后端
//
// 插件以字节形式缓存在内存里；每次执行时落盘为随机命名的临时可执行文件
// （前缀 pp-，后缀 .bin，0700），拉起短命子进程，走 stdio 管道上的
// 行分隔 JSON-RPC，调用完成立即杀进程、删临时文件。
// 字节留在内存中，下次执行的重启延迟很低。
//
// 握手沿用宿主/插件共享的 magic cookie 约定：
// 环境变量 BASIC_PLUGIN=hello，协议版本 1，
// 插件在 stdout 第一行输出 "1|1|stdio|netrpc" 表示就绪。

use log::{debug, warn};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{AgentError, Result};

/// 握手 cookie 键
const HANDSHAKE_COOKIE_KEY: &str = "BASIC_PLUGIN";
/// 握手 cookie 值
const HANDSHAKE_COOKIE_VALUE: &str = "hello";
/// 插件协议版本
const PROTOCOL_VERSION: u32 = 1;
/// 等待插件握手行的超时
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 原生插件记录：缓存字节或磁盘路径，二者至少其一
pub struct NativePlugin {
    name: String,
    data: Option<Vec<u8>>,
    plugin_path: Option<PathBuf>,
}

impl NativePlugin {
    pub fn from_bytes(name: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            data: Some(bytes),
            plugin_path: None,
        }
    }

    pub fn from_path(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            data: None,
            plugin_path: Some(path),
        }
    }

    /// 替换缓存字节（模块重新下发时）
    pub fn update_bytes(&mut self, bytes: Vec<u8>) {
        self.data = Some(bytes);
    }

    pub async fn execute(&self, args: &[String]) -> Result<String> {
        self.call("Plugin.Execute", json!({ "args": args })).await
    }

    pub async fn execute_from_session(&self, args: &[String]) -> Result<String> {
        self.call("Plugin.ExecuteFromSession", json!({ "args": args }))
            .await
    }

    pub async fn execute_from_beacon(&self, args: &[String], data: &str) -> Result<String> {
        self.call(
            "Plugin.ExecuteFromBeacon",
            json!({ "args": args, "data": data }),
        )
        .await
    }

    /// 拉起子进程 → 单次 RPC → 杀进程删临时文件
    async fn call(&self, method: &str, params: Value) -> Result<String> {
        let mut process =
            PluginProcess::start(&self.name, self.data.as_deref(), self.plugin_path.as_deref())
                .await?;
        let result = process.call(method, params).await;
        process.shutdown().await;
        result
    }
}

/// 一次插件调用期间存活的子进程
///
/// 临时文件由 `TempPath` 持有，无论成功、出错还是 panic 展开，
/// drop 时都会删除。
struct PluginProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    _temp: Option<TempPath>,
    next_id: u64,
}

impl PluginProcess {
    async fn start(
        name: &str,
        data: Option<&[u8]>,
        plugin_path: Option<&std::path::Path>,
    ) -> Result<Self> {
        // 1. 准备可执行文件：缓存字节优先落盘，否则用登记的路径
        let (exec_path, temp) = match data {
            Some(bytes) if !bytes.is_empty() => {
                let temp_path = materialize_plugin(name, bytes)?;
                (temp_path.to_path_buf(), Some(temp_path))
            }
            _ => match plugin_path {
                Some(path) => (path.to_path_buf(), None),
                None => {
                    return Err(AgentError::Module(format!(
                        "no plugin data/path available for '{}'",
                        name
                    )))
                }
            },
        };

        // 2. 带 cookie 启动子进程，stdio 管道即 RPC 信道
        let mut child = Command::new(&exec_path)
            .env(HANDSHAKE_COOKIE_KEY, HANDSHAKE_COOKIE_VALUE)
            .env("PLUGIN_PROTOCOL_VERSIONS", PROTOCOL_VERSION.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Module(format!("failed to start plugin '{}': {}", name, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Module("plugin stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Module("plugin stdout unavailable".to_string()))?;

        let mut process = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            _temp: temp,
            next_id: 0,
        };

        // 3. 握手：插件第一行必须报出匹配的协议版本
        if let Err(e) = process.handshake(name).await {
            process.shutdown().await;
            return Err(e);
        }
        Ok(process)
    }

    async fn handshake(&mut self, name: &str) -> Result<()> {
        let mut line = String::new();
        let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.stdout.read_line(&mut line))
            .await
            .map_err(|_| {
                AgentError::Module(format!("plugin '{}' handshake timed out", name))
            })?
            .map_err(|e| AgentError::Module(format!("plugin '{}' handshake read: {}", name, e)))?;
        if read == 0 {
            return Err(AgentError::Module(format!(
                "plugin '{}' exited before handshake",
                name
            )));
        }

        // 形如 "1|1|stdio|netrpc"：第二段是应用协议版本
        let fields: Vec<&str> = line.trim().split('|').collect();
        if fields.len() < 2 {
            return Err(AgentError::Module(format!(
                "plugin '{}' sent malformed handshake: {}",
                name,
                line.trim()
            )));
        }
        let version: u32 = fields[1]
            .parse()
            .map_err(|_| AgentError::Module(format!("plugin '{}' sent bad protocol version", name)))?;
        if version != PROTOCOL_VERSION {
            return Err(AgentError::Module(format!(
                "plugin '{}' protocol version mismatch: got {}, want {}",
                name, version, PROTOCOL_VERSION
            )));
        }
        debug!("Plugin '{}' handshake complete", name);
        Ok(())
    }

    /// 单次 RPC：一行请求，一行响应
    async fn call(&mut self, method: &str, params: Value) -> Result<String> {
        self.next_id += 1;
        let request = json!({
            "method": method,
            "params": params,
            "id": self.next_id,
        });

        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Module(format!("plugin RPC write: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| AgentError::Module(format!("plugin RPC flush: {}", e)))?;

        let mut response_line = String::new();
        let read = self
            .stdout
            .read_line(&mut response_line)
            .await
            .map_err(|e| AgentError::Module(format!("plugin RPC read: {}", e)))?;
        if read == 0 {
            return Err(AgentError::Module(
                "plugin closed connection during RPC call".to_string(),
            ));
        }

        let response: Value = serde_json::from_str(response_line.trim())
            .map_err(|e| AgentError::Module(format!("plugin RPC malformed response: {}", e)))?;

        if let Some(err) = response.get("error").and_then(Value::as_str) {
            return Err(AgentError::Module(err.to_string()));
        }
        match response.get("result").and_then(Value::as_str) {
            Some(result) => Ok(result.to_string()),
            None => Err(AgentError::Module(
                "plugin RPC response missing result".to_string(),
            )),
        }
    }

    /// 杀掉子进程；临时文件随 TempPath drop 一并删除
    async fn shutdown(&mut self) {
        if let Err(e) = self.child.start_kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!("Failed to kill plugin process: {}", e);
            }
        }
        let _ = self.child.wait().await;
    }
}

/// 把插件字节写进随机命名的临时可执行文件
fn materialize_plugin(name: &str, bytes: &[u8]) -> Result<TempPath> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("pp-")
        .suffix(".bin")
        .tempfile()
        .map_err(|e| AgentError::Module(format!("failed to create temp file for plugin {}: {}", name, e)))?;
    file.write_all(bytes)
        .map_err(|e| AgentError::Module(format!("failed to write plugin data for {}: {}", name, e)))?;
    file.flush()
        .map_err(|e| AgentError::Module(format!("failed to flush plugin data for {}: {}", name, e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o700)).map_err(
            |e| AgentError::Module(format!("failed to set execute permission for plugin {}: {}", name, e)),
        )?;
    }

    Ok(file.into_temp_path())
}
