//! Reality key pair and credential generation
//!
//! Key pairs come from an ordered chain of sources. The first source asks the
//! xray binary from the daemon image itself, which guarantees the encoding the
//! daemon expects; the in-process X25519 implementation and the openssl CLI
//! follow as fallbacks. Every source must satisfy the same contract: both keys
//! URL-safe base64 without padding, each decoding to exactly 32 bytes.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::command::{run_checked, CommandRunner, Invocation};
use crate::config::DockerSettings;
use crate::error::{VpnctlError, VpnctlResult};
use crate::secrets::{SecretRecord, SecretStore};

/// Raw X25519 key length
pub const KEY_LEN: usize = 32;

/// Random bytes behind each generated password (24 base64 characters)
const PASSWORD_BYTES: usize = 18;

/// Random bytes behind the short id (8 hex characters)
const SHORT_ID_BYTES: usize = 4;

/// Encoded reality key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    pub fn from_raw(private_key: &[u8; KEY_LEN], public_key: &[u8; KEY_LEN]) -> Self {
        Self {
            private_key: URL_SAFE_NO_PAD.encode(private_key),
            public_key: URL_SAFE_NO_PAD.encode(public_key),
        }
    }

    /// Check the wire-format contract shared by every source
    pub fn validate(&self) -> VpnctlResult<()> {
        let private_key = decode_key(&self.private_key)?;
        let public_key = decode_key(&self.public_key)?;
        if private_key == public_key {
            return Err(VpnctlError::Generation(
                "private and public key are identical".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decode a URL-safe unpadded base64 key into its 32 raw bytes
pub fn decode_key(encoded: &str) -> VpnctlResult<[u8; KEY_LEN]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| VpnctlError::Generation(format!("key is not URL-safe unpadded base64: {}", e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        VpnctlError::Generation(format!(
            "key decodes to {} bytes, expected {}",
            bytes.len(),
            KEY_LEN
        ))
    })
}

/// One way of producing a key pair
#[async_trait]
pub trait KeyPairSource: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self) -> VpnctlResult<KeyPair>;
}

/// `xray x25519` inside the daemon image
pub struct XrayContainerSource {
    runner: Arc<dyn CommandRunner>,
    image: String,
    timeout: Duration,
}

impl XrayContainerSource {
    pub fn new(runner: Arc<dyn CommandRunner>, image: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            image: image.into(),
            timeout,
        }
    }
}

#[async_trait]
impl KeyPairSource for XrayContainerSource {
    fn name(&self) -> &str {
        "xray"
    }

    async fn generate(&self) -> VpnctlResult<KeyPair> {
        let output = run_checked(
            self.runner.as_ref(),
            Invocation::new("docker")
                .args(["run", "--rm", self.image.as_str(), "x25519"])
                .timeout(self.timeout),
        )
        .await?;

        parse_xray_output(&output.stdout_lossy()).ok_or_else(|| {
            VpnctlError::Generation("xray x25519 output did not contain a key pair".to_string())
        })
    }
}

/// Parse `xray x25519` output
///
/// Older releases print `Private key:` / `Public key:`; newer ones print
/// `PrivateKey:` / `Password:` (the public key) followed by `Hash32:`.
pub fn parse_xray_output(output: &str) -> Option<KeyPair> {
    let mut private_key = None;
    let mut public_key = None;

    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let label: String = label
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match label.as_str() {
            "privatekey" => private_key = Some(value.to_string()),
            "publickey" | "password" => public_key = Some(value.to_string()),
            _ => {}
        }
    }

    Some(KeyPair {
        private_key: private_key?,
        public_key: public_key?,
    })
}

/// In-process X25519 from the OS random source
#[derive(Debug, Default)]
pub struct LocalX25519Source;

#[async_trait]
impl KeyPairSource for LocalX25519Source {
    fn name(&self) -> &str {
        "x25519-dalek"
    }

    async fn generate(&self) -> VpnctlResult<KeyPair> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Ok(KeyPair::from_raw(&secret.to_bytes(), public.as_bytes()))
    }
}

/// `openssl genpkey -algorithm x25519`, raw keys taken from the DER tail
pub struct OpensslSource {
    runner: Arc<dyn CommandRunner>,
}

impl OpensslSource {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl KeyPairSource for OpensslSource {
    fn name(&self) -> &str {
        "openssl"
    }

    async fn generate(&self) -> VpnctlResult<KeyPair> {
        // Private PEM files live only as long as this directory
        let dir = tempfile::TempDir::new()?;
        let private_pem = path_str(&dir.path().join("reality_priv.pem"))?;
        let public_pem = path_str(&dir.path().join("reality_pub.pem"))?;
        let runner = self.runner.as_ref();

        run_checked(
            runner,
            Invocation::new("openssl").args(["genpkey", "-algorithm", "x25519", "-out", private_pem.as_str()]),
        )
        .await?;
        run_checked(
            runner,
            Invocation::new("openssl").args(["pkey", "-in", private_pem.as_str(), "-pubout", "-out", public_pem.as_str()]),
        )
        .await?;

        let private_der = run_checked(
            runner,
            Invocation::new("openssl").args(["pkey", "-in", private_pem.as_str(), "-outform", "DER"]),
        )
        .await?
        .stdout;
        let public_der = run_checked(
            runner,
            Invocation::new("openssl").args(["pkey", "-pubin", "-in", public_pem.as_str(), "-outform", "DER"]),
        )
        .await?
        .stdout;

        Ok(KeyPair::from_raw(&der_tail(&private_der)?, &der_tail(&public_der)?))
    }
}

fn der_tail(der: &[u8]) -> VpnctlResult<[u8; KEY_LEN]> {
    if der.len() < KEY_LEN {
        return Err(VpnctlError::Generation(format!(
            "openssl DER output too short ({} bytes)",
            der.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&der[der.len() - KEY_LEN..]);
    Ok(key)
}

fn path_str(path: &Path) -> VpnctlResult<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| VpnctlError::Generation(format!("Temporary path {:?} is not UTF-8", path)))
}

/// Random printable password from the OS random source
pub fn random_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Random lowercase hex short id
pub fn random_short_id() -> String {
    let mut bytes = [0u8; SHORT_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Key generator walking its sources in order
pub struct KeyGenerator {
    sources: Vec<Box<dyn KeyPairSource>>,
}

impl KeyGenerator {
    pub fn new(sources: Vec<Box<dyn KeyPairSource>>) -> Self {
        Self { sources }
    }

    /// xray container, then x25519-dalek, then openssl
    pub fn with_default_chain(runner: Arc<dyn CommandRunner>, docker: &DockerSettings) -> Self {
        Self::new(vec![
            Box::new(XrayContainerSource::new(
                runner.clone(),
                docker.xray_image.clone(),
                Duration::from_secs(docker.keygen_timeout_secs),
            )),
            Box::new(LocalX25519Source),
            Box::new(OpensslSource::new(runner)),
        ])
    }

    /// First key pair from the chain that satisfies the format contract
    pub async fn generate_key_pair(&self) -> VpnctlResult<KeyPair> {
        let mut failures = Vec::new();

        for source in &self.sources {
            let attempt = match source.generate().await {
                Ok(pair) => pair.validate().map(|_| pair),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(pair) => {
                    info!("Reality key pair generated via {}", source.name());
                    return Ok(pair);
                }
                Err(e) => {
                    warn!("Key source {} failed: {}", source.name(), e);
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        Err(VpnctlError::Generation(if failures.is_empty() {
            "no key sources configured".to_string()
        } else {
            failures.join("; ")
        }))
    }

    /// Generate a full secret record and persist it in one write
    ///
    /// Nothing is written unless every value was produced.
    pub async fn generate_keys(&self, store: &mut SecretStore) -> VpnctlResult<SecretRecord> {
        let pair = self.generate_key_pair().await?;

        let record = SecretRecord {
            private_key: pair.private_key,
            public_key: pair.public_key,
            client_id: uuid::Uuid::new_v4().to_string(),
            short_id: random_short_id(),
            hysteria_password: random_password(),
            obfs_password: random_password(),
        };

        store.set_many(record.entries())?;
        info!("New secret record written to {:?}", store.path());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::command::CommandOutput;
    use crate::secrets::keys;
    use tempfile::TempDir;

    struct FailingSource;

    #[async_trait]
    impl KeyPairSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn generate(&self) -> VpnctlResult<KeyPair> {
            Err(VpnctlError::Generation("unavailable".to_string()))
        }
    }

    struct MalformedSource;

    #[async_trait]
    impl KeyPairSource for MalformedSource {
        fn name(&self) -> &str {
            "malformed"
        }

        async fn generate(&self) -> VpnctlResult<KeyPair> {
            // Standard alphabet with padding: wrong encoding for xray
            Ok(KeyPair {
                private_key: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string(),
                public_key: "abc".to_string(),
            })
        }
    }

    fn assert_contract(pair: &KeyPair) {
        for key in [&pair.private_key, &pair.public_key] {
            assert!(!key.contains('='), "padding in {}", key);
            assert!(!key.contains('+') && !key.contains('/'), "non URL-safe char in {}", key);
            assert_eq!(decode_key(key).unwrap().len(), KEY_LEN);
        }
    }

    #[tokio::test]
    async fn test_local_source_contract() {
        let first = LocalX25519Source.generate().await.unwrap();
        let second = LocalX25519Source.generate().await.unwrap();

        assert_contract(&first);
        assert_contract(&second);
        assert_ne!(first.private_key, second.private_key);
        assert_ne!(first.public_key, second.public_key);

        // Public key really belongs to the private key
        let secret = StaticSecret::from(decode_key(&first.private_key).unwrap());
        let public = PublicKey::from(&secret);
        assert_eq!(public.as_bytes(), &decode_key(&first.public_key).unwrap());
    }

    #[test]
    fn test_parse_classic_xray_output() {
        let out = "Private key: SMeHKl-ukp0tA0bVfYoWQZ0MwJNCJG9GFrKprs-mH3U\nPublic key: hXhoJZ3ZgGd7uzsBF3vuPXX6aY0nY_hkLx0fyEV4jWI\n";
        let pair = parse_xray_output(out).unwrap();
        assert_eq!(pair.private_key, "SMeHKl-ukp0tA0bVfYoWQZ0MwJNCJG9GFrKprs-mH3U");
        assert_eq!(pair.public_key, "hXhoJZ3ZgGd7uzsBF3vuPXX6aY0nY_hkLx0fyEV4jWI");
        assert_contract(&pair);
    }

    #[test]
    fn test_parse_new_xray_output() {
        let out = "PrivateKey: SMeHKl-ukp0tA0bVfYoWQZ0MwJNCJG9GFrKprs-mH3U\nPassword: hXhoJZ3ZgGd7uzsBF3vuPXX6aY0nY_hkLx0fyEV4jWI\nHash32: ZGVhZGJlZWY\n";
        let pair = parse_xray_output(out).unwrap();
        assert_eq!(pair.public_key, "hXhoJZ3ZgGd7uzsBF3vuPXX6aY0nY_hkLx0fyEV4jWI");
    }

    #[test]
    fn test_parse_incomplete_xray_output() {
        assert!(parse_xray_output("Private key: abc\n").is_none());
        assert!(parse_xray_output("Unable to find image 'teddysun/xray:latest' locally\n").is_none());
    }

    #[tokio::test]
    async fn test_xray_source_runs_image() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(
            "x25519",
            CommandOutput {
                code: Some(0),
                stdout: b"Private key: SMeHKl-ukp0tA0bVfYoWQZ0MwJNCJG9GFrKprs-mH3U\nPublic key: hXhoJZ3ZgGd7uzsBF3vuPXX6aY0nY_hkLx0fyEV4jWI\n".to_vec(),
                stderr: Vec::new(),
            },
        );
        let source = XrayContainerSource::new(runner.clone(), "teddysun/xray:latest", Duration::from_secs(15));
        let pair = source.generate().await.unwrap();

        assert_contract(&pair);
        let calls = runner.calls();
        assert_eq!(calls[0].command_line(), "docker run --rm teddysun/xray:latest x25519");
        assert_eq!(calls[0].timeout, Some(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn test_openssl_source_takes_der_tail() {
        let runner = Arc::new(RecordingRunner::new());
        let mut public_der = vec![0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00];
        public_der.extend([7u8; 32]);
        let mut private_der = vec![0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x04, 0x22, 0x04, 0x20];
        private_der.extend([9u8; 32]);
        runner.respond("-pubin", CommandOutput { code: Some(0), stdout: public_der, stderr: Vec::new() });
        runner.respond("-outform DER", CommandOutput { code: Some(0), stdout: private_der, stderr: Vec::new() });

        let pair = OpensslSource::new(runner.clone()).generate().await.unwrap();
        assert_eq!(pair, KeyPair::from_raw(&[9u8; 32], &[7u8; 32]));
        assert_contract(&pair);
        assert_eq!(runner.calls().len(), 4);
        assert!(runner.command_lines()[0].starts_with("openssl genpkey -algorithm x25519 -out "));
    }

    #[tokio::test]
    async fn test_chain_falls_back_in_order() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail("docker run", "Cannot connect to the Docker daemon");

        let generator = KeyGenerator::with_default_chain(runner.clone(), &DockerSettings::default());
        let pair = generator.generate_key_pair().await.unwrap();

        assert_contract(&pair);
        // Local source answered, openssl never ran
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_output_is_skipped() {
        let generator = KeyGenerator::new(vec![Box::new(MalformedSource), Box::new(LocalX25519Source)]);
        let pair = generator.generate_key_pair().await.unwrap();
        assert_contract(&pair);
    }

    #[tokio::test]
    async fn test_all_sources_failing_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "SERVER_IP=203.0.113.5\n").unwrap();
        let mut store = SecretStore::open(&path).unwrap();

        let generator = KeyGenerator::new(vec![Box::new(FailingSource), Box::new(MalformedSource)]);
        let err = generator.generate_keys(&mut store).await.unwrap_err();

        assert!(matches!(err, VpnctlError::Generation(_)));
        let msg = err.to_string();
        assert!(msg.contains("failing") && msg.contains("malformed"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "SERVER_IP=203.0.113.5\n");
    }

    #[tokio::test]
    async fn test_generate_keys_writes_full_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        let mut store = SecretStore::open(&path).unwrap();

        let generator = KeyGenerator::new(vec![Box::new(LocalX25519Source)]);
        let first = generator.generate_keys(&mut store).await.unwrap();
        let second = generator.generate_keys(&mut store).await.unwrap();

        assert_ne!(first.private_key, second.private_key);
        assert_ne!(first.client_id, second.client_id);

        let reopened = SecretStore::open(&path).unwrap();
        assert_eq!(SecretRecord::from_store(&reopened).unwrap(), second);

        let uuid = uuid::Uuid::parse_str(&second.client_id).unwrap();
        assert_eq!(uuid.get_version_num(), 4);

        assert_eq!(second.short_id.len(), 8);
        assert!(second.short_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        for password in [&second.hysteria_password, &second.obfs_password] {
            assert_eq!(password.len(), 24);
            assert!(password.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
        assert_ne!(second.hysteria_password, second.obfs_password);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches(keys::REALITY_PRIVATE_KEY).count(), 1);
    }
}
