//! Persistent ed25519 device identity used to sign the gateway `connect` request.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use ed25519_dalek::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey,
};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const DEVICE_IDENTITY_SCHEMA_VERSION: u32 = 1;

/// Signing clock for device payloads, in unix milliseconds.
pub fn signed_at_now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// `~/.openclaw/plugins/kimi-claw/device.json`, when a home directory is known.
pub fn default_device_identity_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join(".openclaw")
            .join("plugins")
            .join("kimi-claw")
            .join("device.json")
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDeviceIdentity {
    version: u32,
    device_id: String,
    public_key_pem: String,
    private_key_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at_ms: Option<u64>,
}

#[derive(Clone)]
/// Device keypair plus the fingerprint the gateway knows it by.
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Inputs covered by the connect signature besides the device id itself.
pub struct DeviceAuthParams<'a> {
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [&'a str],
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub signed_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// The `device` field of the gateway `connect` params.
pub struct DeviceAuthField {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// hex(sha256(raw 32-byte public key)).
pub fn fingerprint_public_key(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// `v1|device|client|mode|role|scopes|signedAt|token`, with `v2|…|nonce` when a nonce is present.
pub fn build_device_auth_payload(device_id: &str, params: &DeviceAuthParams<'_>) -> String {
    let nonce = params.nonce.filter(|nonce| !nonce.is_empty());
    let version = if nonce.is_some() { "v2" } else { "v1" };
    let signed_at = params.signed_at_ms.to_string();
    let scopes = params.scopes.join(",");
    let mut parts = vec![
        version,
        device_id,
        params.client_id,
        params.client_mode,
        params.role,
        scopes.as_str(),
        signed_at.as_str(),
        params.token.unwrap_or_default(),
    ];
    if let Some(nonce) = nonce {
        parts.push(nonce);
    }
    parts.join("|")
}

impl DeviceIdentity {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing_key)
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            device_id: fingerprint_public_key(&verifying_key),
            signing_key,
            verifying_key,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn public_key_base64url(&self) -> String {
        BASE64_URL.encode(self.verifying_key.as_bytes())
    }

    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        BASE64_URL.encode(signature.to_bytes())
    }

    pub fn build_auth_field(&self, params: &DeviceAuthParams<'_>) -> DeviceAuthField {
        let payload = build_device_auth_payload(&self.device_id, params);
        DeviceAuthField {
            id: self.device_id.clone(),
            public_key: self.public_key_base64url(),
            signature: self.sign(&payload),
            signed_at: params.signed_at_ms,
            nonce: params
                .nonce
                .filter(|nonce| !nonce.is_empty())
                .map(str::to_string),
        }
    }

    fn to_stored(&self) -> Result<StoredDeviceIdentity> {
        let private_key_pem = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|error| anyhow!("failed to encode device private key: {error}"))?;
        let public_key_pem = self
            .verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|error| anyhow!("failed to encode device public key: {error}"))?;
        Ok(StoredDeviceIdentity {
            version: DEVICE_IDENTITY_SCHEMA_VERSION,
            device_id: self.device_id.clone(),
            public_key_pem,
            private_key_pem: private_key_pem.to_string(),
            created_at_ms: Some(signed_at_now_ms()),
        })
    }
}

/// Loads the identity at `path`, rewriting a stale device id and replacing unreadable files.
pub fn load_or_create_device_identity(path: &Path) -> Result<DeviceIdentity> {
    if path.exists() {
        match load_stored_identity(path) {
            Ok(identity) => return Ok(identity),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "device identity unreadable, generating a new one"
                );
            }
        }
    }
    let identity = DeviceIdentity::generate();
    write_identity_file(path, &identity.to_stored()?)?;
    Ok(identity)
}

fn load_stored_identity(path: &Path) -> Result<DeviceIdentity> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut stored = serde_json::from_str::<StoredDeviceIdentity>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if stored.version != DEVICE_IDENTITY_SCHEMA_VERSION {
        bail!(
            "unsupported device identity version {} in {}",
            stored.version,
            path.display()
        );
    }
    let signing_key = SigningKey::from_pkcs8_pem(&stored.private_key_pem)
        .map_err(|error| anyhow!("invalid device private key: {error}"))?;
    let verifying_key = VerifyingKey::from_public_key_pem(&stored.public_key_pem)
        .map_err(|error| anyhow!("invalid device public key: {error}"))?;
    let derived_id = fingerprint_public_key(&verifying_key);
    if derived_id != stored.device_id {
        tracing::info!(path = %path.display(), "device id out of date, rewriting");
        stored.device_id = derived_id.clone();
        write_identity_file(path, &stored)?;
    }
    Ok(DeviceIdentity {
        device_id: derived_id,
        signing_key,
        verifying_key,
    })
}

fn write_identity_file(path: &Path, stored: &StoredDeviceIdentity) -> Result<()> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let encoded = serde_json::to_string_pretty(stored).context("failed to encode device identity")?;
    let temp_path = parent.join(format!(".device.json.tmp-{}", std::process::id()));
    std::fs::write(&temp_path, format!("{encoded}\n"))
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    restrict_permissions(&temp_path);
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(error) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::debug!(path = %path.display(), error = %error, "chmod 600 failed");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
    use base64::Engine;
    use ed25519_dalek::{Signature, SigningKey, Verifier};
    use serde_json::Value;

    use super::{
        build_device_auth_payload, load_or_create_device_identity, signed_at_now_ms,
        DeviceAuthParams, DeviceIdentity,
    };

    fn params<'a>(scopes: &'a [&'a str], nonce: Option<&'a str>) -> DeviceAuthParams<'a> {
        DeviceAuthParams {
            client_id: "gateway-client",
            client_mode: "backend",
            role: "operator",
            scopes,
            token: Some("tok"),
            nonce,
            signed_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn unit_signed_at_clock_is_unix_milliseconds() {
        let first = signed_at_now_ms();
        let second = signed_at_now_ms();
        assert!(first > 1_577_836_800_000, "expected a post-2020 epoch ms value, got {first}");
        assert!(second >= first);
    }

    #[test]
    fn unit_auth_payload_switches_to_v2_when_nonce_present() {
        let scopes = ["operator.admin", "operator.read"];
        assert_eq!(
            build_device_auth_payload("dev", &params(&scopes, None)),
            "v1|dev|gateway-client|backend|operator|operator.admin,operator.read|1700000000000|tok"
        );
        assert_eq!(
            build_device_auth_payload("dev", &params(&scopes, Some("n-1"))),
            "v2|dev|gateway-client|backend|operator|operator.admin,operator.read|1700000000000|tok|n-1"
        );
    }

    #[test]
    fn functional_auth_field_signature_verifies_against_public_key() {
        let identity = DeviceIdentity::from_signing_key(SigningKey::from_bytes(&[7; 32]));
        let scopes = ["operator.admin"];
        let auth = params(&scopes, Some("nonce-abc"));
        let field = identity.build_auth_field(&auth);
        assert_eq!(field.id, identity.device_id());
        assert_eq!(field.nonce.as_deref(), Some("nonce-abc"));
        assert_eq!(identity.device_id().len(), 64);

        let signature_bytes = BASE64_URL.decode(&field.signature).expect("signature b64");
        let signature = Signature::from_slice(&signature_bytes).expect("signature");
        let payload = build_device_auth_payload(identity.device_id(), &auth);
        identity
            .verifying_key()
            .verify(payload.as_bytes(), &signature)
            .expect("signature verifies");
        let public_key = BASE64_URL.decode(&field.public_key).expect("pk b64");
        assert_eq!(public_key.as_slice(), identity.verifying_key().as_bytes());
    }

    #[test]
    fn integration_identity_round_trips_and_repairs_stale_device_id() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("nested").join("device.json");
        let created = load_or_create_device_identity(&path).expect("create");
        let reloaded = load_or_create_device_identity(&path).expect("reload");
        assert_eq!(created.device_id(), reloaded.device_id());

        let mut stored: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(stored["version"], 1);
        stored["deviceId"] = Value::String("stale".to_string());
        std::fs::write(&path, serde_json::to_string(&stored).expect("encode")).expect("write");

        let repaired = load_or_create_device_identity(&path).expect("repair");
        assert_eq!(repaired.device_id(), created.device_id());
        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(rewritten["deviceId"], created.device_id());
    }

    #[test]
    fn regression_corrupt_identity_file_is_replaced() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("device.json");
        std::fs::write(&path, "{not json").expect("write");
        let identity = load_or_create_device_identity(&path).expect("regenerate");
        let stored: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(stored["deviceId"], identity.device_id());
    }
}
