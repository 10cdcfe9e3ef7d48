// 解释型模块后端
//
// 源码以文本缓存；首次执行时编译一次并缓存 AST，之后直接复用。
// 引擎预注入两个宿主符号：`log(msg)` 与 `run_shell_command(cmd)`。
// 模块脚本约定导出 `execute(args)` 和 `execute_from_beacon(args, data)`。

use log::{debug, info};
use rhai::{Array, Dynamic, Engine, Scope, AST};

use crate::error::{AgentError, Result};

/// 解释型模块记录
pub struct InterpretedModule {
    source: String,
    engine: Engine,
    ast: Option<AST>,
}

impl InterpretedModule {
    pub fn new(source: String) -> Self {
        Self {
            source,
            engine: build_engine(),
            ast: None,
        }
    }

    /// 替换源码并失效已缓存的编译结果
    pub fn update_source(&mut self, source: String) {
        self.source = source;
        self.ast = None;
    }

    /// 编译一次并缓存
    fn ensure_compiled(&mut self) -> Result<()> {
        if self.ast.is_some() {
            return Ok(());
        }
        let ast = self
            .engine
            .compile(&self.source)
            .map_err(|e| AgentError::Module(format!("failed to evaluate module source: {}", e)))?;
        self.ast = Some(ast);
        debug!("Module source compiled and cached");
        Ok(())
    }

    fn call_function(&mut self, name: &str, call_args: (Array, Option<String>)) -> Result<String> {
        self.ensure_compiled()?;
        let ast = match self.ast.as_ref() {
            Some(ast) => ast,
            None => return Err(AgentError::Module("module AST unavailable".to_string())),
        };

        let mut scope = Scope::new();
        let result = match call_args {
            (args, None) => self
                .engine
                .call_fn::<String>(&mut scope, ast, name, (args,)),
            (args, Some(data)) => self
                .engine
                .call_fn::<String>(&mut scope, ast, name, (args, data)),
        };
        result.map_err(|e| AgentError::Module(format!("failed to call {} function: {}", name, e)))
    }

    pub fn execute(&mut self, args: &[String]) -> Result<String> {
        self.call_function("execute", (to_array(args), None))
    }

    pub fn execute_from_session(&mut self, args: &[String]) -> Result<String> {
        self.execute(args)
    }

    pub fn execute_from_beacon(&mut self, args: &[String], data: &str) -> Result<String> {
        self.call_function(
            "execute_from_beacon",
            (to_array(args), Some(data.to_string())),
        )
    }
}

fn to_array(args: &[String]) -> Array {
    args.iter().map(|s| Dynamic::from(s.clone())).collect()
}

/// 构造预配置的脚本引擎
fn build_engine() -> Engine {
    let mut engine = Engine::new();

    engine.register_fn("log", |msg: &str| {
        info!("[module] {}", msg);
    });

    engine.register_fn("run_shell_command", |cmd: &str| -> String {
        run_shell_command_sync(cmd)
    });

    engine
}

/// 同步 shell 执行，注入给脚本使用
///
/// 单条命令内不做协作式挂起，阻塞 I/O 在这里是允许的。
fn run_shell_command_sync(command: &str) -> String {
    let (shell, arg) = crate::executor::CommandExecutor::get_shell();
    match std::process::Command::new(shell).arg(arg).arg(command).output() {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut combined = stdout.trim().to_string();
            if !stderr.trim().is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str("Stderr: ");
                combined.push_str(stderr.trim());
            }
            combined
        }
        Err(e) => format!("Error: failed to start command: {}", e),
    }
}
