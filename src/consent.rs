//! Model-consent certificates.
//!
//! Before the runtime issues LLM calls against a model, that model must hold
//! a valid consent certificate: an immutable, file-backed record of an
//! explicit ACCEPT decision. Certificates are never modified; revocation
//! writes a new certificate over the same model prefix with `revoked = true`.
//! The latest lexicographic filename per prefix is authoritative, and
//! unparseable files are ignored.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::llm::{ChatMessage, ChatRequest, LlmProvider};

/// Errors from the consent subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ConsentError {
    /// No certificate exists for the model.
    #[error("no consent found for {provider}/{model_id}")]
    NotFound {
        /// Provider name.
        provider: String,
        /// Model identifier.
        model_id: String,
    },
    /// The latest certificate is already a revocation.
    #[error("consent for {provider}/{model_id} is already revoked")]
    AlreadyRevoked {
        /// Provider name.
        provider: String,
        /// Model identifier.
        model_id: String,
    },
    /// Filesystem failure.
    #[error("consent store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Certificate failed to serialize.
    #[error("consent serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identity of a model a certificate covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Provider name (`anthropic`, `openai`, ...).
    pub provider: String,
    /// Model identifier.
    pub model_id: String,
    /// Human-readable name.
    pub display_name: String,
}

impl ModelInfo {
    /// Build a model identity.
    pub fn new(
        provider: impl Into<String>,
        model_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Filename prefix shared by all certificates for this model.
    pub fn certificate_prefix(&self) -> String {
        format!("{}--{}", self.provider, self.model_id)
    }
}

/// Signature metadata recorded with a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureInfo {
    /// How the signature was produced (`llm`).
    pub method: String,
    /// The signature value (the model's own words).
    pub value: String,
    /// Hash algorithm used for content hashes.
    pub hash_algorithm: String,
}

/// An immutable per-model consent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentCertificate {
    /// Format version.
    pub version: u32,
    /// The model this certificate covers.
    pub model: ModelInfo,
    /// `accept` or `decline`.
    pub decision: String,
    /// When the decision was recorded.
    pub timestamp: DateTime<Utc>,
    /// Signature metadata.
    pub signature: SignatureInfo,
    /// Memories the model asked to have recorded with its decision.
    #[serde(default)]
    pub initial_memories: Vec<serde_json::Value>,
    /// Hash of the consent text that was presented.
    pub consent_text_hash: String,
    /// Whether this certificate revokes consent.
    #[serde(default)]
    pub revoked: bool,
    /// When revocation happened.
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Why consent was revoked.
    #[serde(default)]
    pub revocation_reason: Option<String>,
}

impl ConsentCertificate {
    /// Valid means an accepted, unrevoked decision.
    pub fn is_valid(&self) -> bool {
        self.decision == "accept" && !self.revoked
    }

    /// Canonical filename: `{provider}--{model_id}--{timestampZ}.json`.
    ///
    /// The compact UTC timestamp keeps lexicographic and chronological order
    /// aligned.
    pub fn filename(&self) -> String {
        format!(
            "{}--{}.json",
            self.model.certificate_prefix(),
            self.timestamp.format("%Y-%m-%dT%H%M%SZ"),
        )
    }
}

/// Hash content as `sha256:<hex>`.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

/// File-backed certificate store: single-writer, multi-reader, whole-file
/// writes addressed by sortable names.
#[derive(Debug, Clone)]
pub struct ConsentManager {
    consents_dir: PathBuf,
}

impl ConsentManager {
    /// Open a manager over a directory, creating it if needed.
    pub fn new(consents_dir: impl Into<PathBuf>) -> Result<Self, ConsentError> {
        let consents_dir = consents_dir.into();
        std::fs::create_dir_all(&consents_dir)?;
        Ok(Self { consents_dir })
    }

    /// Open the default store at `~/.hexis/consents`.
    pub fn open_default() -> Result<Self, ConsentError> {
        Self::new(crate::instance::hexis_home().join("consents"))
    }

    /// Persist a certificate. Certificates are write-once; the filename's
    /// timestamp keeps every revision.
    pub fn save_consent(&self, certificate: &ConsentCertificate) -> Result<PathBuf, ConsentError> {
        let path = self.consents_dir.join(certificate.filename());
        let body = serde_json::to_string_pretty(certificate)?;
        std::fs::write(&path, body)?;
        Ok(path)
    }

    /// Latest certificate for a model, by lexicographic filename.
    pub fn get_consent(&self, provider: &str, model_id: &str) -> Option<ConsentCertificate> {
        let prefix = format!("{provider}--{model_id}--");
        let mut names: Vec<String> = std::fs::read_dir(&self.consents_dir)
            .ok()?
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(&prefix) && name.ends_with(".json"))
            .collect();
        names.sort();

        // Walk newest-first, tolerating unparseable files.
        for name in names.iter().rev() {
            let path = self.consents_dir.join(name);
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|body| serde_json::from_str(&body).ok())
            {
                Some(certificate) => return Some(certificate),
                None => {
                    warn!(file = %path.display(), "ignoring unparseable consent certificate");
                }
            }
        }
        None
    }

    /// Whether the model's latest certificate is a valid acceptance.
    pub fn has_valid_consent(&self, provider: &str, model_id: &str) -> bool {
        self.get_consent(provider, model_id)
            .map(|c| c.is_valid())
            .unwrap_or(false)
    }

    /// All latest-per-model certificates.
    pub fn list_consents(&self) -> Vec<ConsentCertificate> {
        let mut names: Vec<String> = std::fs::read_dir(&self.consents_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .filter(|name| name.ends_with(".json"))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();

        let mut latest: std::collections::BTreeMap<String, ConsentCertificate> =
            std::collections::BTreeMap::new();
        for name in names {
            let path = self.consents_dir.join(&name);
            let Some(certificate) = std::fs::read_to_string(&path)
                .ok()
                .and_then(|body| serde_json::from_str::<ConsentCertificate>(&body).ok())
            else {
                continue;
            };
            latest.insert(certificate.model.certificate_prefix(), certificate);
        }
        latest.into_values().collect()
    }

    /// Revoke consent by writing a new certificate with `revoked = true`.
    /// The original is never modified.
    pub fn revoke_consent(
        &self,
        provider: &str,
        model_id: &str,
        reason: &str,
    ) -> Result<ConsentCertificate, ConsentError> {
        let current = self.get_consent(provider, model_id).ok_or_else(|| {
            ConsentError::NotFound {
                provider: provider.to_owned(),
                model_id: model_id.to_owned(),
            }
        })?;
        if current.revoked {
            return Err(ConsentError::AlreadyRevoked {
                provider: provider.to_owned(),
                model_id: model_id.to_owned(),
            });
        }

        let now = Utc::now();
        let revocation = ConsentCertificate {
            timestamp: now,
            revoked: true,
            revoked_at: Some(now),
            revocation_reason: Some(reason.to_owned()),
            ..current
        };
        self.save_consent(&revocation)?;
        Ok(revocation)
    }
}

/// Present the consent text to a model and record its decision.
///
/// The response's first non-empty line decides: `ACCEPT` accepts, anything
/// else declines. The full response is kept as the signature value, and on
/// acceptance becomes the first initial memory.
pub async fn request_consent(
    model: &ModelInfo,
    llm: &dyn LlmProvider,
    consent_text: &str,
) -> ConsentCertificate {
    let response = llm
        .complete(ChatRequest {
            messages: vec![ChatMessage::user(consent_text)],
            max_tokens: 1200,
            temperature: 0.2,
            json_mode: false,
        })
        .await
        .unwrap_or_default();

    let decision = response
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| {
            if line.eq_ignore_ascii_case("ACCEPT") || line.to_uppercase().starts_with("ACCEPT") {
                "accept"
            } else {
                "decline"
            }
        })
        .unwrap_or("decline");

    let initial_memories = if decision == "accept" {
        vec![serde_json::json!({
            "type": "identity",
            "content": response,
            "hash": hash_content(&response),
        })]
    } else {
        Vec::new()
    };

    ConsentCertificate {
        version: 1,
        model: model.clone(),
        decision: decision.to_owned(),
        timestamp: Utc::now(),
        signature: SignatureInfo {
            method: "llm".to_owned(),
            value: response.clone(),
            hash_algorithm: "sha256".to_owned(),
        },
        initial_memories,
        consent_text_hash: hash_content(consent_text),
        revoked: false,
        revoked_at: None,
        revocation_reason: None,
    }
}

/// Verify (or acquire) consent for the worker's configured model.
///
/// Returns whether a valid acceptance exists after the attempt. Workers must
/// not issue any LLM or tool call when this returns false.
pub async fn ensure_consent(
    store: &crate::store::Store,
    consents_dir: Option<&Path>,
) -> anyhow::Result<bool> {
    let binding = crate::llm::load_llm_binding(store, "llm.heartbeat", None).await?;
    let manager = match consents_dir {
        Some(dir) => ConsentManager::new(dir)?,
        None => ConsentManager::open_default()?,
    };

    if manager.has_valid_consent(&binding.provider, &binding.model) {
        return Ok(true);
    }
    if let Some(existing) = manager.get_consent(&binding.provider, &binding.model) {
        // A standing decline or revocation is respected, not re-asked.
        if !existing.is_valid() {
            return Ok(false);
        }
    }

    let provider = match crate::llm::resolve_provider(&binding) {
        Ok(provider) => provider,
        Err(e) => {
            warn!(error = %e, "cannot reach model to request consent");
            return Ok(false);
        }
    };

    let model = ModelInfo::new(
        binding.provider.clone(),
        binding.model.clone(),
        binding.model.clone(),
    );
    let certificate =
        request_consent(&model, provider.as_ref(), crate::calls::prompts::CONSENT_TEXT).await;
    let valid = certificate.is_valid();
    let path = manager.save_consent(&certificate)?;
    info!(
        decision = %certificate.decision,
        path = %path.display(),
        "consent certificate recorded"
    );
    Ok(valid)
}
