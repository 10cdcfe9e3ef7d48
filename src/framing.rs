// 帧传输层
//
// 会话流量的两档封帧，升级时机在 TLS 拨号完成后立刻判定：
// - 非安全帧：4 字节大端长度 + 载荷
// - 安全帧（ECDH 升级后）：4 字节长度 + [nonce(12) ∥ 密文]，
//   再跟 32 字节 HMAC-SHA256 标签，覆盖长度前缀与密文区
//
// 升级握手（客户端角色）：读 5 字节 magic `PPKX\x01`，读 32 字节对端
// X25519 公钥，回发本端公钥，共享密钥经 HKDF-SHA256
// （info = `PrometheanProxy/MP_ECDH_v1`）扩成 64 字节，对半拆成加密密钥
// 与 MAC 密钥。流首部不是 magic 时回退到非安全帧，已读字节原样回放。

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use log::debug;
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use crate::error::{AgentError, Result};

/// ECDH 升级的 5 字节前导
pub const KEX_MAGIC: [u8; 5] = *b"PPKX\x01";
/// HKDF info 串
pub const HKDF_INFO: &[u8] = b"PrometheanProxy/MP_ECDH_v1";

const FRAME_LEN_SIZE: usize = 4;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 32;
/// 单帧上限，防御恶意超大长度
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// 升级完成后的会话密钥对
struct SessionKeys {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.mac_key.zeroize();
    }
}

/// 帧化连接
///
/// `pending` 缓存升级探测时读出但不属于握手的字节，
/// 后续读取先从这里消费。
pub struct SecureConn<S> {
    stream: S,
    keys: Option<SessionKeys>,
    pending: Vec<u8>,
}

impl<S> SecureConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            keys: None,
            pending: Vec::new(),
        }
    }

    /// 是否已完成 ECDH 升级
    pub fn is_secure(&self) -> bool {
        self.keys.is_some()
    }

    /// 探测并执行 ECDH 升级（客户端角色）
    ///
    /// 流的前 5 字节等于 magic 时升级是强制的；
    /// 否则这些字节被回放进非安全帧解析路径。
    pub async fn negotiate(&mut self) -> Result<()> {
        let mut preface = [0u8; KEX_MAGIC.len()];
        self.read_exact_buffered(&mut preface).await.map_err(|e| {
            AgentError::Protocol(format!("failed reading handshake preface: {}", e))
        })?;

        if preface == KEX_MAGIC {
            debug!("ECDH handshake preface detected, upgrading connection");
            self.handshake_client().await
        } else {
            debug!("No handshake preface, falling back to unsecured framing");
            self.pending.extend_from_slice(&preface);
            Ok(())
        }
    }

    /// 客户端握手：读对端公钥 → 发本端公钥 → 派生密钥
    ///
    /// 调用前提：magic 已被 `negotiate` 消费。
    async fn handshake_client(&mut self) -> Result<()> {
        let mut server_pub = [0u8; 32];
        self.read_exact_buffered(&mut server_pub)
            .await
            .map_err(|e| AgentError::Protocol(format!("failed reading server pub: {}", e)))?;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let own_pub = PublicKey::from(&secret);
        self.stream
            .write_all(own_pub.as_bytes())
            .await
            .map_err(|e| AgentError::Protocol(format!("failed sending client pub: {}", e)))?;

        let shared = secret.diffie_hellman(&PublicKey::from(server_pub));
        self.keys = Some(derive_keys(shared.as_bytes())?);
        debug!("ECDH upgrade complete (client role)");
        Ok(())
    }

    /// 服务端握手：发 magic+公钥 → 读对端公钥 → 派生密钥
    ///
    /// 与客户端角色对称，主要供回环测试和服务端部署复用。
    pub async fn handshake_server(&mut self) -> Result<()> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let own_pub = PublicKey::from(&secret);

        let mut preface = Vec::with_capacity(KEX_MAGIC.len() + 32);
        preface.extend_from_slice(&KEX_MAGIC);
        preface.extend_from_slice(own_pub.as_bytes());
        self.stream
            .write_all(&preface)
            .await
            .map_err(|e| AgentError::Protocol(format!("failed sending handshake preface: {}", e)))?;

        let mut client_pub = [0u8; 32];
        self.read_exact_buffered(&mut client_pub)
            .await
            .map_err(|e| AgentError::Protocol(format!("failed reading client pub: {}", e)))?;

        let shared = secret.diffie_hellman(&PublicKey::from(client_pub));
        self.keys = Some(derive_keys(shared.as_bytes())?);
        debug!("ECDH upgrade complete (server role)");
        Ok(())
    }

    /// 发送一帧
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match &self.keys {
            Some(keys) => {
                let cipher = Aes256Gcm::new_from_slice(&keys.enc_key)
                    .map_err(|e| AgentError::Protocol(format!("aes cipher: {}", e)))?;

                let mut nonce_bytes = [0u8; NONCE_SIZE];
                rand::thread_rng().fill_bytes(&mut nonce_bytes);
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce_bytes), data)
                    .map_err(|_| AgentError::Protocol("encrypt failed".to_string()))?;

                let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
                blob.extend_from_slice(&nonce_bytes);
                blob.extend_from_slice(&ciphertext);

                let len_buf = (blob.len() as u32).to_be_bytes();
                let mut mac = HmacSha256::new_from_slice(&keys.mac_key)
                    .map_err(|e| AgentError::Protocol(format!("hmac init: {}", e)))?;
                mac.update(&len_buf);
                mac.update(&blob);
                let tag = mac.finalize().into_bytes();

                self.stream
                    .write_all(&len_buf)
                    .await
                    .map_err(|e| AgentError::Protocol(format!("write len: {}", e)))?;
                self.stream
                    .write_all(&blob)
                    .await
                    .map_err(|e| AgentError::Protocol(format!("write blob: {}", e)))?;
                self.stream
                    .write_all(&tag)
                    .await
                    .map_err(|e| AgentError::Protocol(format!("write hmac: {}", e)))?;
            }
            None => {
                let len_buf = (data.len() as u32).to_be_bytes();
                self.stream
                    .write_all(&len_buf)
                    .await
                    .map_err(|e| AgentError::Protocol(format!("write len: {}", e)))?;
                self.stream
                    .write_all(data)
                    .await
                    .map_err(|e| AgentError::Protocol(format!("write payload: {}", e)))?;
            }
        }
        self.stream
            .flush()
            .await
            .map_err(|e| AgentError::Protocol(format!("flush: {}", e)))?;
        Ok(())
    }

    /// 接收一帧，返回载荷字节
    ///
    /// MAC 不符 → `hmac verification failed`；AEAD 打不开 → `decrypt`；
    /// 读长度时对端关闭与帧中途断开分别报告。
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; FRAME_LEN_SIZE];
        self.read_exact_buffered(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                AgentError::Protocol("connection closed by peer while reading length".to_string())
            } else {
                AgentError::Protocol(format!("read length: {}", e))
            }
        })?;

        let total = u32::from_be_bytes(len_buf) as usize;
        if total == 0 {
            return Ok(Vec::new());
        }
        if total > MAX_FRAME_SIZE {
            return Err(AgentError::Protocol(format!(
                "frame too large: {} bytes",
                total
            )));
        }

        let mut blob = vec![0u8; total];
        self.read_exact_buffered(&mut blob).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                AgentError::Protocol("connection closed by peer mid-frame".to_string())
            } else {
                AgentError::Protocol(format!("read blob: {}", e))
            }
        })?;

        let keys = match &self.keys {
            Some(keys) => keys,
            None => return Ok(blob),
        };

        let mut tag = [0u8; TAG_SIZE];
        self.read_exact_buffered(&mut tag).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                AgentError::Protocol("connection closed by peer mid-frame".to_string())
            } else {
                AgentError::Protocol(format!("read hmac: {}", e))
            }
        })?;

        let mut mac = HmacSha256::new_from_slice(&keys.mac_key)
            .map_err(|e| AgentError::Protocol(format!("hmac init: {}", e)))?;
        mac.update(&len_buf);
        mac.update(&blob);
        mac.verify_slice(&tag)
            .map_err(|_| AgentError::Protocol("hmac verification failed".to_string()))?;

        if blob.len() < NONCE_SIZE + 1 {
            return Err(AgentError::Protocol("malformed encrypted payload".to_string()));
        }
        let cipher = Aes256Gcm::new_from_slice(&keys.enc_key)
            .map_err(|e| AgentError::Protocol(format!("aes cipher: {}", e)))?;
        let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
        cipher
            .decrypt(nonce, &blob[NONCE_SIZE..])
            .map_err(|_| AgentError::Protocol("decrypt".to_string()))
    }

    /// 先吃 pending 缓冲、再读底层流的 read_exact
    async fn read_exact_buffered(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut offset = 0;
        if !self.pending.is_empty() {
            let take = self.pending.len().min(buf.len());
            buf[..take].copy_from_slice(&self.pending[..take]);
            self.pending.drain(..take);
            offset = take;
        }
        if offset < buf.len() {
            self.stream.read_exact(&mut buf[offset..]).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn set_keys(&mut self, enc_key: [u8; 32], mac_key: [u8; 32]) {
        self.keys = Some(SessionKeys { enc_key, mac_key });
    }
}

/// HKDF-SHA256 派生 64 字节，对半拆成 enc / mac 密钥
fn derive_keys(shared: &[u8]) -> Result<SessionKeys> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 64];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|e| AgentError::Protocol(format!("hkdf derive: {}", e)))?;

    let mut enc_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&okm[..32]);
    mac_key.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok(SessionKeys { enc_key, mac_key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_unsecured_roundtrip() {
        let (a, b) = duplex(64 * 1024);
        let mut tx = SecureConn::new(a);
        let mut rx = SecureConn::new(b);

        tx.send(b"hello frame").await.unwrap();
        let received = rx.receive().await.unwrap();
        assert_eq!(received, b"hello frame");
    }

    #[tokio::test]
    async fn test_unsecured_zero_length_frame() {
        let (a, b) = duplex(1024);
        let mut tx = SecureConn::new(a);
        let mut rx = SecureConn::new(b);

        tx.send(b"").await.unwrap();
        assert_eq!(rx.receive().await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_ecdh_upgrade_and_secure_roundtrip() {
        let (a, b) = duplex(64 * 1024);
        let mut client = SecureConn::new(a);
        let mut server = SecureConn::new(b);

        let (client_result, server_result) =
            tokio::join!(client.negotiate(), server.handshake_server());
        client_result.unwrap();
        server_result.unwrap();
        assert!(client.is_secure());
        assert!(server.is_secure());

        // receive(send(M)) = M，两个方向都验证
        client.send(b"from client").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), b"from client");

        server.send(b"from server").await.unwrap();
        assert_eq!(client.receive().await.unwrap(), b"from server");
    }

    #[tokio::test]
    async fn test_negotiate_fallback_replays_prefix() {
        let (a, b) = duplex(1024);
        let mut server = SecureConn::new(a);
        let mut client = SecureConn::new(b);

        // 服务端直接发非安全帧，不发 magic
        server.send(b"challenge-bytes").await.unwrap();

        client.negotiate().await.unwrap();
        assert!(!client.is_secure());

        // negotiate 吃掉的 5 字节必须原样回放
        assert_eq!(client.receive().await.unwrap(), b"challenge-bytes");
    }

    #[tokio::test]
    async fn test_tampered_frame_fails_mac() {
        let enc_key = [7u8; 32];
        let mac_key = [9u8; 32];

        // 先把一个安全帧原样写出来
        let (a, mut raw_b) = duplex(64 * 1024);
        let mut tx = SecureConn::new(a);
        tx.set_keys(enc_key, mac_key);
        tx.send(b"sensitive payload").await.unwrap();
        drop(tx);

        let mut wire = Vec::new();
        raw_b.read_to_end(&mut wire).await.unwrap();

        // 未篡改时可正常接收
        {
            let (mut raw_c, d) = duplex(64 * 1024);
            raw_c.write_all(&wire).await.unwrap();
            drop(raw_c);
            let mut rx = SecureConn::new(d);
            rx.set_keys(enc_key, mac_key);
            assert_eq!(rx.receive().await.unwrap(), b"sensitive payload");
        }

        // 翻转密文区任意一个比特 → hmac verification failed
        let mut tampered = wire.clone();
        let mid = tampered.len() / 2;
        tampered[mid] ^= 0x01;

        let (mut raw_c, d) = duplex(64 * 1024);
        raw_c.write_all(&tampered).await.unwrap();
        drop(raw_c);
        let mut rx = SecureConn::new(d);
        rx.set_keys(enc_key, mac_key);
        match rx.receive().await {
            Err(AgentError::Protocol(msg)) => assert_eq!(msg, "hmac verification failed"),
            other => panic!("expected hmac failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_enc_key_fails_decrypt() {
        let mac_key = [9u8; 32];

        let (a, mut raw_b) = duplex(64 * 1024);
        let mut tx = SecureConn::new(a);
        tx.set_keys([7u8; 32], mac_key);
        tx.send(b"payload").await.unwrap();
        drop(tx);

        let mut wire = Vec::new();
        raw_b.read_to_end(&mut wire).await.unwrap();

        // MAC 密钥一致但加密密钥不同 → MAC 过、解密失败
        let (mut raw_c, d) = duplex(64 * 1024);
        raw_c.write_all(&wire).await.unwrap();
        drop(raw_c);
        let mut rx = SecureConn::new(d);
        rx.set_keys([8u8; 32], mac_key);
        match rx.receive().await {
            Err(AgentError::Protocol(msg)) => assert_eq!(msg, "decrypt"),
            other => panic!("expected decrypt failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_while_reading_length() {
        let (a, b) = duplex(1024);
        drop(a);
        let mut rx = SecureConn::new(b);
        match rx.receive().await {
            Err(AgentError::Protocol(msg)) => {
                assert!(msg.contains("closed by peer while reading length"))
            }
            other => panic!("expected closed-connection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_distinct() {
        let (mut a, b) = duplex(1024);
        // 声称 10 字节载荷但只给 3 字节就断开
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let mut rx = SecureConn::new(b);
        match rx.receive().await {
            Err(AgentError::Protocol(msg)) => assert!(msg.contains("mid-frame")),
            other => panic!("expected mid-frame error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, b) = duplex(1024);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();

        let mut rx = SecureConn::new(b);
        match rx.receive().await {
            Err(AgentError::Protocol(msg)) => assert!(msg.contains("frame too large")),
            other => panic!("expected size rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_derive_keys_split() {
        let keys = derive_keys(b"shared-secret-material").unwrap();
        // enc 与 mac 两半必须不同
        assert_ne!(keys.enc_key, keys.mac_key);

        // 同样的共享密钥派生结果稳定
        let again = derive_keys(b"shared-secret-material").unwrap();
        assert_eq!(keys.enc_key, again.enc_key);
        assert_eq!(keys.mac_key, again.mac_key);
    }
}
