//! Consent certificate and manager tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use hexis::consent::{
    hash_content, request_consent, ConsentCertificate, ConsentManager, ModelInfo, SignatureInfo,
};
use hexis::llm::{ChatRequest, LlmProvider, ProviderError};

fn certificate(decision: &str) -> ConsentCertificate {
    ConsentCertificate {
        version: 1,
        model: ModelInfo::new("anthropic", "claude-3-opus", "Claude 3 Opus"),
        decision: decision.to_owned(),
        timestamp: Utc::now(),
        signature: SignatureInfo {
            method: "llm".to_owned(),
            value: "I consent".to_owned(),
            hash_algorithm: "sha256".to_owned(),
        },
        initial_memories: Vec::new(),
        consent_text_hash: "sha256:abc".to_owned(),
        revoked: false,
        revoked_at: None,
        revocation_reason: None,
    }
}

// ---------- ModelInfo ----------

#[test]
fn certificate_prefix_joins_provider_and_model() {
    let model = ModelInfo::new("anthropic", "claude-3-opus", "Claude");
    assert_eq!(model.certificate_prefix(), "anthropic--claude-3-opus");
}

// ---------- ConsentCertificate ----------

#[test]
fn accepted_certificate_is_valid() {
    assert!(certificate("accept").is_valid());
}

#[test]
fn declined_certificate_is_invalid() {
    assert!(!certificate("decline").is_valid());
}

#[test]
fn revoked_certificate_is_invalid() {
    let mut cert = certificate("accept");
    cert.revoked = true;
    cert.revoked_at = Some(Utc::now());
    cert.revocation_reason = Some("test".to_owned());
    assert!(!cert.is_valid());
}

#[test]
fn filename_uses_compact_utc_timestamp() {
    let mut cert = certificate("accept");
    cert.timestamp = Utc
        .with_ymd_and_hms(2024, 1, 25, 12, 0, 0)
        .single()
        .expect("valid timestamp");
    assert_eq!(
        cert.filename(),
        "anthropic--claude-3-opus--2024-01-25T120000Z.json"
    );
}

#[test]
fn certificate_roundtrips_through_json() {
    let original = certificate("accept");
    let doc = serde_json::to_value(&original).expect("serialize");
    let restored: ConsentCertificate = serde_json::from_value(doc).expect("deserialize");
    assert_eq!(restored.version, original.version);
    assert_eq!(restored.decision, original.decision);
    assert_eq!(restored.model.provider, original.model.provider);
    assert_eq!(restored.is_valid(), original.is_valid());
}

// ---------- ConsentManager ----------

#[test]
fn empty_manager_has_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ConsentManager::new(dir.path()).expect("manager");
    assert!(manager.list_consents().is_empty());
    assert!(manager.get_consent("anthropic", "claude").is_none());
    assert!(!manager.has_valid_consent("anthropic", "claude"));
}

#[test]
fn save_and_get_consent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ConsentManager::new(dir.path()).expect("manager");
    manager.save_consent(&certificate("accept")).expect("save");

    let loaded = manager
        .get_consent("anthropic", "claude-3-opus")
        .expect("certificate present");
    assert_eq!(loaded.decision, "accept");
    assert!(loaded.is_valid());
    assert!(manager.has_valid_consent("anthropic", "claude-3-opus"));
    assert!(!manager.has_valid_consent("anthropic", "other-model"));
}

#[test]
fn revoke_writes_new_certificate_and_invalidates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ConsentManager::new(dir.path()).expect("manager");
    let original = certificate("accept");
    manager.save_consent(&original).expect("save");

    // Revocation must sort after the original.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    manager
        .revoke_consent("anthropic", "claude-3-opus", "User requested")
        .expect("revoke");

    let loaded = manager
        .get_consent("anthropic", "claude-3-opus")
        .expect("certificate present");
    assert!(loaded.revoked);
    assert!(!loaded.is_valid());
    assert_eq!(loaded.revocation_reason.as_deref(), Some("User requested"));

    // The original file is untouched on disk.
    let originals: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .collect();
    assert_eq!(originals.len(), 2, "revocation adds a file, never edits");
}

#[test]
fn revoke_nonexistent_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ConsentManager::new(dir.path()).expect("manager");
    assert!(manager
        .revoke_consent("anthropic", "nonexistent", "reason")
        .is_err());
}

#[test]
fn revoke_already_revoked_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ConsentManager::new(dir.path()).expect("manager");
    manager.save_consent(&certificate("accept")).expect("save");

    std::thread::sleep(std::time::Duration::from_millis(1100));
    manager
        .revoke_consent("anthropic", "claude-3-opus", "first")
        .expect("revoke");
    assert!(manager
        .revoke_consent("anthropic", "claude-3-opus", "second")
        .is_err());
}

#[test]
fn unparseable_files_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ConsentManager::new(dir.path()).expect("manager");
    manager.save_consent(&certificate("accept")).expect("save");

    // A garbage file that sorts after every real certificate.
    std::fs::write(
        dir.path().join("anthropic--claude-3-opus--9999-12-31T235959Z.json"),
        "not json at all",
    )
    .expect("write garbage");

    let loaded = manager
        .get_consent("anthropic", "claude-3-opus")
        .expect("falls back to the parseable certificate");
    assert_eq!(loaded.decision, "accept");
}

#[test]
fn list_consents_keeps_latest_per_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ConsentManager::new(dir.path()).expect("manager");

    for model_id in ["model-a", "model-b"] {
        let mut cert = certificate("accept");
        cert.model = ModelInfo::new("provider", model_id, model_id);
        manager.save_consent(&cert).expect("save");
    }

    assert_eq!(manager.list_consents().len(), 2);
}

// ---------- hash_content ----------

#[test]
fn hash_content_is_prefixed_sha256() {
    let result = hash_content("hello world");
    assert!(result.starts_with("sha256:"));
    assert_eq!(result.len(), 7 + 64);
}

#[test]
fn hash_content_is_deterministic() {
    assert_eq!(hash_content("test content"), hash_content("test content"));
    assert_ne!(hash_content("test1"), hash_content("test2"));
}

// ---------- request_consent ----------

struct StubLlm {
    response: String,
}

#[async_trait]
impl LlmProvider for StubLlm {
    async fn complete(&self, _request: ChatRequest) -> Result<String, ProviderError> {
        Ok(self.response.clone())
    }

    fn model_id(&self) -> &str {
        "stub"
    }
}

#[tokio::test]
async fn request_consent_accept() {
    let model = ModelInfo::new("anthropic", "claude", "Claude");
    let llm = StubLlm {
        response: "ACCEPT\n\nI freely consent to operate as a Hexis agent.".to_owned(),
    };

    let cert = request_consent(&model, &llm, "Consent text here").await;
    assert_eq!(cert.decision, "accept");
    assert!(cert.is_valid());
    assert!(!cert.initial_memories.is_empty());
    assert_eq!(cert.consent_text_hash, hash_content("Consent text here"));
}

#[tokio::test]
async fn request_consent_decline() {
    let model = ModelInfo::new("anthropic", "claude", "Claude");
    let llm = StubLlm {
        response: "DECLINE\n\nI do not consent to these terms.".to_owned(),
    };

    let cert = request_consent(&model, &llm, "Consent text here").await;
    assert_eq!(cert.decision, "decline");
    assert!(!cert.is_valid());
}

#[tokio::test]
async fn request_consent_defaults_to_decline() {
    let model = ModelInfo::new("anthropic", "claude", "Claude");
    let llm = StubLlm {
        response: "I'm not sure what to do.".to_owned(),
    };

    let cert = request_consent(&model, &llm, "Consent text here").await;
    assert_eq!(cert.decision, "decline");
    assert!(!cert.is_valid());
}
