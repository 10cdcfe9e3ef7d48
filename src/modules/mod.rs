// 动态模块注册表
//
// 命令名 → 模块后端的唯一归属地。三种后端共用同一套能力契约
// （execute / execute-from-session / execute-from-beacon）：
// - Builtin：编译进二进制，启动时注册
// - Native：缓存的插件字节，执行时落盘为临时可执行文件并以短命子进程运行
// - Interpreted：脚本源码，在内嵌引擎中求值并缓存编译结果
//
// 注册表独占持有模块记录；子进程生命周期归 Native 后端管。

pub mod builtins;
pub mod interpreter;
pub mod rpc;

use base64::Engine as _;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::{AgentError, Result};
use interpreter::InterpretedModule;
use rpc::NativePlugin;

/// 内建命令能力契约
pub trait BuiltinCommand: Send + Sync {
    fn execute(&self, args: &[String]) -> Result<String>;

    fn execute_from_session(&self, args: &[String]) -> Result<String> {
        self.execute(args)
    }

    fn execute_from_beacon(&self, args: &[String], data: &str) -> Result<String>;
}

/// 模块后端：查找时解析，不靠互相引用的全局表
pub enum ModuleBackend {
    Builtin(Box<dyn BuiltinCommand>),
    Native(NativePlugin),
    Interpreted(InterpretedModule),
}

/// 模块注册表
///
/// 外层读写锁保护名字表；每个模块各有一把互斥锁，
/// 串行化对单个模块的执行与重载。
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<Mutex<ModuleBackend>>>>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// 注册内建命令（启动时调用）
    pub async fn register_builtin(&self, name: &str, command: Box<dyn BuiltinCommand>) {
        let mut modules = self.modules.write().await;
        modules.insert(
            name.to_string(),
            Arc::new(Mutex::new(ModuleBackend::Builtin(command))),
        );
        debug!("Registered built-in module: '{}'", name);
    }

    /// 缓存原生插件字节（惰性启动，执行时才落盘/拉起子进程）
    pub async fn load_native_bytes(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            return Err(AgentError::Module(format!(
                "no plugin bytes provided for {}",
                name
            )));
        }
        let mut modules = self.modules.write().await;
        if let Some(entry) = modules.get(name).cloned() {
            // 已有记录：原地替换缓存字节
            let mut backend = entry.lock().await;
            match &mut *backend {
                ModuleBackend::Native(plugin) => plugin.update_bytes(bytes),
                _ => {
                    *backend = ModuleBackend::Native(NativePlugin::from_bytes(name, bytes));
                }
            }
        } else {
            modules.insert(
                name.to_string(),
                Arc::new(Mutex::new(ModuleBackend::Native(NativePlugin::from_bytes(
                    name, bytes,
                )))),
            );
        }
        info!("Cached native plugin bytes for '{}' (lazy start on execute)", name);
        Ok(())
    }

    /// 登记磁盘上的插件路径（同样惰性启动）
    pub async fn load_native_path(&self, name: &str, path: std::path::PathBuf) -> Result<()> {
        let mut modules = self.modules.write().await;
        modules.insert(
            name.to_string(),
            Arc::new(Mutex::new(ModuleBackend::Native(NativePlugin::from_path(
                name, path,
            )))),
        );
        info!("Cached native plugin path for '{}'", name);
        Ok(())
    }

    /// 缓存解释型模块源码
    pub async fn load_interpreted(&self, name: &str, source: String) -> Result<()> {
        if source.is_empty() {
            return Err(AgentError::Module(format!(
                "no module source provided for {}",
                name
            )));
        }
        let source_len = source.len();
        let mut modules = self.modules.write().await;
        if let Some(entry) = modules.get(name).cloned() {
            let mut backend = entry.lock().await;
            match &mut *backend {
                ModuleBackend::Interpreted(module) => module.update_source(source),
                _ => *backend = ModuleBackend::Interpreted(InterpretedModule::new(source)),
            }
        } else {
            modules.insert(
                name.to_string(),
                Arc::new(Mutex::new(ModuleBackend::Interpreted(
                    InterpretedModule::new(source),
                ))),
            );
        }
        info!("Loaded interpreted module '{}' ({} bytes)", name, source_len);
        Ok(())
    }

    /// 从 `module` 命令载荷加载模块
    ///
    /// 严格 base64 解码成功 → 原生插件字节；否则按解释型源码处理。
    pub async fn load_from_payload(&self, name: &str, data: &str) -> Result<()> {
        match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
            Ok(bytes) => self.load_native_bytes(name, bytes).await,
            Err(_) => self.load_interpreted(name, data.to_string()).await,
        }
    }

    /// 模块是否已加载（任一后端有记录即可）
    pub async fn has_command(&self, name: &str) -> bool {
        self.modules.read().await.contains_key(name)
    }

    /// 列出已加载模块名（三种后端的并集）
    pub async fn list(&self) -> Vec<String> {
        let modules = self.modules.read().await;
        let mut names: Vec<String> = modules.keys().cloned().collect();
        names.sort();
        names
    }

    fn not_loaded(name: &str) -> AgentError {
        AgentError::Module(format!("dynamic command '{}' not loaded", name))
    }

    pub async fn execute(&self, name: &str, args: &[String]) -> Result<String> {
        let entry = {
            let modules = self.modules.read().await;
            modules.get(name).cloned().ok_or_else(|| Self::not_loaded(name))?
        };
        let mut backend = entry.lock().await;
        match &mut *backend {
            ModuleBackend::Builtin(cmd) => cmd.execute(args),
            ModuleBackend::Native(plugin) => plugin.execute(args).await,
            ModuleBackend::Interpreted(module) => module.execute(args),
        }
    }

    pub async fn execute_from_session(&self, name: &str, args: &[String]) -> Result<String> {
        let entry = {
            let modules = self.modules.read().await;
            modules.get(name).cloned().ok_or_else(|| Self::not_loaded(name))?
        };
        let mut backend = entry.lock().await;
        match &mut *backend {
            ModuleBackend::Builtin(cmd) => cmd.execute_from_session(args),
            ModuleBackend::Native(plugin) => plugin.execute_from_session(args).await,
            ModuleBackend::Interpreted(module) => module.execute_from_session(args),
        }
    }

    pub async fn execute_from_beacon(&self, name: &str, args: &[String], data: &str) -> Result<String> {
        let entry = {
            let modules = self.modules.read().await;
            modules.get(name).cloned().ok_or_else(|| Self::not_loaded(name))?
        };
        let mut backend = entry.lock().await;
        match &mut *backend {
            ModuleBackend::Builtin(cmd) => cmd.execute_from_beacon(args, data),
            ModuleBackend::Native(plugin) => plugin.execute_from_beacon(args, data).await,
            ModuleBackend::Interpreted(module) => module.execute_from_beacon(args, data),
        }
    }
}

/// 注册全部内建模块
pub async fn register_builtins(registry: &ModuleRegistry) {
    registry
        .register_builtin("system_info", Box::new(builtins::SystemInfoCommand))
        .await;
    registry
        .register_builtin("list_directory", Box::new(builtins::ListDirectoryCommand))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoCommand;

    impl BuiltinCommand for EchoCommand {
        fn execute(&self, args: &[String]) -> Result<String> {
            Ok(format!("echo:{}", args.join(",")))
        }

        fn execute_from_beacon(&self, args: &[String], data: &str) -> Result<String> {
            Ok(format!("echo:{}:{}", args.join(","), data))
        }
    }

    #[tokio::test]
    async fn test_builtin_registration_and_execution() {
        let registry = ModuleRegistry::new();
        registry.register_builtin("echo", Box::new(EchoCommand)).await;

        assert!(registry.has_command("echo").await);
        assert!(!registry.has_command("missing").await);

        let out = registry
            .execute("echo", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out, "echo:a,b");

        let out = registry
            .execute_from_beacon("echo", &[], "payload")
            .await
            .unwrap();
        assert_eq!(out, "echo::payload");
    }

    #[tokio::test]
    async fn test_execute_unloaded_module_fails() {
        let registry = ModuleRegistry::new();
        let result = registry.execute_from_beacon("nope", &[], "").await;
        assert!(matches!(result, Err(AgentError::Module(_))));
    }

    #[tokio::test]
    async fn test_load_from_payload_base64_is_native() {
        let registry = ModuleRegistry::new();
        let bytes = base64::engine::general_purpose::STANDARD.encode([0x7f, b'E', b'L', b'F', 0x02]);
        registry.load_from_payload("probe", &bytes).await.unwrap();

        let modules = registry.modules.read().await;
        let backend = modules.get("probe").unwrap().lock().await;
        assert!(matches!(&*backend, ModuleBackend::Native(_)));
    }

    #[tokio::test]
    async fn test_load_from_payload_source_is_interpreted() {
        let registry = ModuleRegistry::new();
        let source = r#"fn execute(args) { "ok" }"#;
        registry.load_from_payload("script", source).await.unwrap();

        let modules = registry.modules.read().await;
        let backend = modules.get("script").unwrap().lock().await;
        assert!(matches!(&*backend, ModuleBackend::Interpreted(_)));
    }

    #[tokio::test]
    async fn test_load_native_empty_bytes_fails() {
        let registry = ModuleRegistry::new();
        let result = registry.load_native_bytes("empty", Vec::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_is_union_of_backends() {
        let registry = ModuleRegistry::new();
        registry.register_builtin("builtin_cmd", Box::new(EchoCommand)).await;
        registry
            .load_interpreted("script_cmd", "fn execute(args) { \"x\" }".to_string())
            .await
            .unwrap();
        registry
            .load_native_bytes("native_cmd", vec![1, 2, 3])
            .await
            .unwrap();

        let names = registry.list().await;
        assert_eq!(names, vec!["builtin_cmd", "native_cmd", "script_cmd"]);
    }

    #[tokio::test]
    async fn test_reload_replaces_backend() {
        let registry = ModuleRegistry::new();
        registry
            .load_interpreted("mod1", "fn execute(args) { \"v1\" }".to_string())
            .await
            .unwrap();

        // 同名模块以 base64 重新下发后应切换到原生后端
        let bytes = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        registry.load_from_payload("mod1", &bytes).await.unwrap();

        let modules = registry.modules.read().await;
        let backend = modules.get("mod1").unwrap().lock().await;
        assert!(matches!(&*backend, ModuleBackend::Native(_)));
    }
}
