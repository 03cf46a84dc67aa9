use crate::error::{Error, Result};
use aes_gcm::{
    aead::{generic_array::typenum, generic_array::GenericArray, Aead, KeyInit},
    Aes128Gcm, Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha1::Sha1;

/// AEAD tag length, 16 for all supported suites.
pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// The AEAD suites the server speaks. Key and salt lengths follow the
/// suite; the tag is always 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl CipherSuite {
    pub fn parse(method: &str) -> Result<Self> {
        match method.to_lowercase().as_str() {
            "aes-128-gcm" | "aead_aes_128_gcm" => Ok(CipherSuite::Aes128Gcm),
            "aes-256-gcm" | "aead_aes_256_gcm" => Ok(CipherSuite::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" | "aead_chacha20_poly1305" => {
                Ok(CipherSuite::Chacha20Poly1305)
            }
            _ => Err(Error::config(format!("Unsupported cipher: {}", method))),
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherSuite::Aes128Gcm => 16,
            CipherSuite::Aes256Gcm | CipherSuite::Chacha20Poly1305 => 32,
        }
    }

    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    pub fn tag_len(&self) -> usize {
        TAG_LEN
    }

    /// Cryptographically secure per-session salt.
    pub fn random_salt(&self) -> Result<Vec<u8>> {
        let mut salt = vec![0u8; self.salt_len()];
        getrandom::fill(&mut salt)
            .map_err(|e| Error::internal(format!("CSPRNG failure: {}", e)))?;
        Ok(salt)
    }

    /// Session subkey: HKDF-SHA1(ikm = psk, salt = salt, info = "ss-subkey")
    /// expanded to the suite's key length.
    pub fn derive_subkey(&self, psk: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
        let hk = Hkdf::<Sha1>::new(Some(salt), psk);
        let mut subkey = vec![0u8; self.key_len()];
        hk.expand(SUBKEY_INFO, &mut subkey)
            .map_err(|e| Error::internal(format!("HKDF expand failed: {}", e)))?;
        Ok(subkey)
    }
}

#[allow(clippy::large_enum_variant)]
enum AeadCipherInner {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl AeadCipherInner {
    fn new(suite: CipherSuite, key: &[u8]) -> Self {
        match suite {
            CipherSuite::Aes128Gcm => {
                AeadCipherInner::Aes128Gcm(Aes128Gcm::new(GenericArray::from_slice(key)))
            }
            CipherSuite::Aes256Gcm => {
                AeadCipherInner::Aes256Gcm(Aes256Gcm::new(GenericArray::from_slice(key)))
            }
            CipherSuite::Chacha20Poly1305 => {
                AeadCipherInner::ChaCha20Poly1305(ChaCha20Poly1305::new(GenericArray::from_slice(
                    key,
                )))
            }
        }
    }

    fn seal(&self, nonce: &GenericArray<u8, typenum::U12>, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            AeadCipherInner::Aes128Gcm(cipher) => cipher.encrypt(nonce, plaintext),
            AeadCipherInner::Aes256Gcm(cipher) => cipher.encrypt(nonce, plaintext),
            AeadCipherInner::ChaCha20Poly1305(cipher) => cipher.encrypt(nonce, plaintext),
        }
        .map_err(|e| Error::internal(format!("AEAD seal failed: {}", e)))
    }

    fn open(&self, nonce: &GenericArray<u8, typenum::U12>, record: &[u8]) -> Result<Vec<u8>> {
        match self {
            AeadCipherInner::Aes128Gcm(cipher) => cipher.decrypt(nonce, record),
            AeadCipherInner::Aes256Gcm(cipher) => cipher.decrypt(nonce, record),
            AeadCipherInner::ChaCha20Poly1305(cipher) => cipher.decrypt(nonce, record),
        }
        .map_err(|_| Error::AuthFailed)
    }
}

// Shadowsocks AEAD nonce is the record counter in little-endian.
fn nonce_at(counter: u64) -> GenericArray<u8, typenum::U12> {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    GenericArray::clone_from_slice(&nonce)
}

/// Sealing half of a session direction. The counter advances once per
/// sealed record and is never reused with the same subkey.
pub struct SealingKey {
    inner: AeadCipherInner,
    counter: u64,
}

impl SealingKey {
    pub fn new(suite: CipherSuite, subkey: &[u8]) -> Self {
        Self {
            inner: AeadCipherInner::new(suite, subkey),
            counter: 0,
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.inner.seal(&nonce_at(self.counter), plaintext)?;
        self.counter = self.counter.wrapping_add(1);
        Ok(sealed)
    }
}

/// Opening half of a session direction. The counter advances only when a
/// record authenticates; a failed open leaves it in place.
pub struct OpeningKey {
    inner: AeadCipherInner,
    counter: u64,
}

impl OpeningKey {
    pub fn new(suite: CipherSuite, subkey: &[u8]) -> Self {
        Self {
            inner: AeadCipherInner::new(suite, subkey),
            counter: 0,
        }
    }

    pub fn open(&mut self, record: &[u8]) -> Result<Vec<u8>> {
        let plain = self.inner.open(&nonce_at(self.counter), record)?;
        self.counter = self.counter.wrapping_add(1);
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITES: [CipherSuite; 3] = [
        CipherSuite::Aes128Gcm,
        CipherSuite::Aes256Gcm,
        CipherSuite::Chacha20Poly1305,
    ];

    fn session_keys(suite: CipherSuite) -> (SealingKey, OpeningKey) {
        let psk = vec![0u8; suite.key_len()];
        let salt = suite.random_salt().unwrap();
        let subkey = suite.derive_subkey(&psk, &salt).unwrap();
        (
            SealingKey::new(suite, &subkey),
            OpeningKey::new(suite, &subkey),
        )
    }

    #[test]
    fn parse_accepts_both_spellings() {
        assert_eq!(CipherSuite::parse("aes-128-gcm").unwrap(), CipherSuite::Aes128Gcm);
        assert_eq!(CipherSuite::parse("AEAD_AES_256_GCM").unwrap(), CipherSuite::Aes256Gcm);
        assert_eq!(
            CipherSuite::parse("chacha20-ietf-poly1305").unwrap(),
            CipherSuite::Chacha20Poly1305
        );
        assert!(CipherSuite::parse("rc4-md5").is_err());
    }

    #[test]
    fn key_and_salt_lengths_match_suite() {
        assert_eq!(CipherSuite::Aes128Gcm.key_len(), 16);
        assert_eq!(CipherSuite::Aes256Gcm.key_len(), 32);
        assert_eq!(CipherSuite::Chacha20Poly1305.key_len(), 32);
        for suite in SUITES {
            assert_eq!(suite.salt_len(), suite.key_len());
            assert_eq!(suite.tag_len(), TAG_LEN);
        }
    }

    #[test]
    fn derive_subkey_is_deterministic() {
        for suite in SUITES {
            let psk = vec![3u8; suite.key_len()];
            let salt = vec![9u8; suite.salt_len()];
            let a = suite.derive_subkey(&psk, &salt).unwrap();
            let b = suite.derive_subkey(&psk, &salt).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), suite.key_len());
        }
    }

    #[test]
    fn seal_open_round_trip() {
        for suite in SUITES {
            let (mut sealer, mut opener) = session_keys(suite);
            let sealed = sealer.seal(b"hello shadowgate").unwrap();
            assert_eq!(sealed.len(), 16 + TAG_LEN);
            assert_eq!(opener.open(&sealed).unwrap(), b"hello shadowgate");
        }
    }

    #[test]
    fn records_must_be_opened_in_seal_order() {
        let (mut sealer, mut opener) = session_keys(CipherSuite::Aes256Gcm);
        let first = sealer.seal(b"first").unwrap();
        let second = sealer.seal(b"second").unwrap();
        // Out of order: the nonce counters disagree.
        assert!(matches!(opener.open(&second), Err(Error::AuthFailed)));
        assert_eq!(opener.open(&first).unwrap(), b"first");
        assert_eq!(opener.open(&second).unwrap(), b"second");
    }

    #[test]
    fn tampering_any_byte_fails_authentication() {
        let suite = CipherSuite::Chacha20Poly1305;
        let psk = vec![0u8; suite.key_len()];
        let salt = suite.random_salt().unwrap();
        let subkey = suite.derive_subkey(&psk, &salt).unwrap();
        let mut sealer = SealingKey::new(suite, &subkey);
        let sealed = sealer.seal(b"payload").unwrap();
        for i in 0..sealed.len() {
            let mut opener = OpeningKey::new(suite, &subkey);
            let mut corrupted = sealed.clone();
            corrupted[i] ^= 0x01;
            assert!(opener.open(&corrupted).is_err(), "byte {} accepted", i);
        }
    }

    #[test]
    fn failed_open_does_not_advance_the_counter() {
        let (mut sealer, mut opener) = session_keys(CipherSuite::Aes128Gcm);
        let good = sealer.seal(b"record").unwrap();
        let mut bad = good.clone();
        bad[0] ^= 0xff;
        assert!(opener.open(&bad).is_err());
        // Counter did not move, so the untampered record still opens.
        assert_eq!(opener.open(&good).unwrap(), b"record");
    }

    #[test]
    fn random_salts_are_distinct() {
        let a = CipherSuite::Aes256Gcm.random_salt().unwrap();
        let b = CipherSuite::Aes256Gcm.random_salt().unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
