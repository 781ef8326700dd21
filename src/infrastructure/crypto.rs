//! 配置加密 - 基础设施层
//!
//! 只负责"敏感配置项加解密"能力，不关心哪些键是敏感的
//!
//! ## 加密方案
//! - 密钥派生：PBKDF2-HMAC-SHA256，100_000 轮，应用内置口令与盐
//! - 对称加密：AES-256-GCM（认证加密，篡改即解密失败）
//! - 密文格式：base64(nonce ‖ ciphertext)，每次加密使用新的随机 nonce

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

// 用于派生加密密钥的口令和盐。注意：修改任一值将导致旧配置文件无法解密。
const KDF_PASSWORD: &[u8] = b"a-strong-but-not-public-password-for-this-app";
const KDF_SALT: &[u8] = b"salt_for_llm_app_config";
const KDF_ROUNDS: u32 = 100_000;

const NONCE_LEN: usize = 12;

/// 配置加解密器
///
/// 职责：
/// - 从内置口令派生密钥并持有 AES-256-GCM 实例
/// - 加密单个字符串值
/// - 解密单个字符串值，失败返回 `None` 而不是错误
pub struct ConfigCipher {
    cipher: Aes256Gcm,
}

impl ConfigCipher {
    /// 派生密钥并创建加解密器
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(KDF_PASSWORD, KDF_SALT, KDF_ROUNDS, &mut key);
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// 加密字符串，返回 base64(nonce ‖ ciphertext)
    ///
    /// 空字符串不加密，原样返回空串。加密本身失败时返回 `None`。
    pub fn encrypt(&self, plaintext: &str) -> Option<String> {
        if plaintext.is_empty() {
            return Some(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self.cipher.encrypt(&nonce, plaintext.as_bytes()).ok()?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Some(BASE64.encode(blob))
    }

    /// 解密 base64(nonce ‖ ciphertext) 字符串
    ///
    /// 任何解码、认证或 UTF-8 失败都返回 `None`（调用方降级为空值）。
    pub fn decrypt(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return Some(String::new());
        }
        let blob = BASE64.decode(token).ok()?;
        if blob.len() <= NONCE_LEN {
            return None;
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self.cipher.decrypt(nonce, ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

impl Default for ConfigCipher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let cipher = ConfigCipher::new();
        let token = cipher.encrypt("sk-test-key-123456").unwrap();
        assert_ne!(token, "sk-test-key-123456");
        assert_eq!(cipher.decrypt(&token).unwrap(), "sk-test-key-123456");
    }

    #[test]
    fn test_empty_value_passthrough() {
        let cipher = ConfigCipher::new();
        assert_eq!(cipher.encrypt("").unwrap(), "");
        assert_eq!(cipher.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_nonce_is_fresh_per_encryption() {
        let cipher = ConfigCipher::new();
        let a = cipher.encrypt("same-value").unwrap();
        let b = cipher.encrypt("same-value").unwrap();
        // 相同明文每次加密产生不同密文
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn test_corrupt_token_yields_none() {
        let cipher = ConfigCipher::new();
        // 非 base64
        assert!(cipher.decrypt("不是密文").is_none());
        // base64 但不是本应用的密文
        assert!(cipher.decrypt("AAAAAAAAAAAAAAAAAAAAAAAA").is_none());
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let cipher = ConfigCipher::new();
        let token = cipher.encrypt("secret").unwrap();
        let mut blob = BASE64.decode(&token).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = BASE64.encode(blob);
        assert!(cipher.decrypt(&tampered).is_none());
    }
}
