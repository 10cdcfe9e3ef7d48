// 混淆表模块
//
// 启动时读取一份 JSON 文档，重命名线上 JSON 字段键和命令名。
// 所有线上报文的构造与解析只用重命名后的键，绝不回退到明文键名。
// 路径解析优先级：命令行 flag → 环境变量 OBFUSCATE_CONFIG → 构建期内嵌默认值。

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AgentError, Result};

/// 环境变量名：混淆表路径
pub const OBFUSCATE_CONFIG_ENV: &str = "OBFUSCATE_CONFIG";

/// implant_info 段：Connect/Reconnect 载荷使用的字段键
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImplantInfoKeys {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub timer: String,
    #[serde(default)]
    pub jitter: String,
    #[serde(default)]
    pub uuid: String,
}

/// 单个命令的混淆名
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandAlias {
    #[serde(default)]
    pub obfuscation_name: String,
}

/// commands 段：命令数组与命令信封使用的字段键
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandKeys {
    /// 服务端响应里命令数组的键名
    #[serde(default)]
    pub obfuscation_name: String,
    #[serde(default)]
    pub command_uuid: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub module: CommandAlias,
    #[serde(default)]
    pub shell: CommandAlias,
}

/// 运行时混淆表
///
/// 缺失的键在解析时留空，等到分发真正需要它们时才报错（见 dispatch），
/// 不做任何静默回退。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObfuscationMap {
    #[serde(default)]
    pub implant_info: ImplantInfoKeys,
    #[serde(default)]
    pub commands: CommandKeys,
}

impl ObfuscationMap {
    /// 从 JSON 文件加载混淆表。路径缺失或文档非法是启动期致命错误。
    pub fn load(path: &Path) -> Result<ObfuscationMap> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!(
                "failed to read obfuscation config '{}': {}",
                path.display(),
                e
            ))
        })?;
        let map: ObfuscationMap = serde_json::from_str(&data).map_err(|e| {
            AgentError::Config(format!(
                "failed to parse obfuscation config '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(map)
    }

    /// 解析混淆表路径：flag → 环境变量 → 构建期内嵌默认值
    pub fn resolve_path(flag_value: Option<&str>) -> Result<String> {
        if let Some(path) = flag_value {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        if let Ok(env_path) = std::env::var(OBFUSCATE_CONFIG_ENV) {
            let trimmed = env_path.trim().to_string();
            if !trimmed.is_empty() {
                return Ok(trimmed);
            }
        }
        if let Some(embedded) = option_env!("OBFUSCATE_CONFIG_DEFAULT") {
            let trimmed = embedded.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        Err(AgentError::Config(
            "no obfuscation config path provided via flag, environment variable, or build settings"
                .to_string(),
        ))
    }
}
