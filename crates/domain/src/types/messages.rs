//! Wire schema for everything that crosses the broker.
//!
//! Every payload is a JSON object discriminated by a `kind` tag. Producers
//! always emit the strict [`SyncMessage`] form. Request consumers parse the
//! lenient drafts first so that a malformed payload can still yield the ids
//! needed for a failure confirmation.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::broker::QueueName;
use crate::errors::{ClinisyncError, Result};

/// Identity document presented by a patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DocumentType {
    /// National identity card (`DO`).
    NationalId,
    /// Passport (`PA`).
    Passport,
    /// Any other document (`OTRO`).
    Other,
}

impl DocumentType {
    /// Canonical wire code.
    pub const fn code(self) -> &'static str {
        match self {
            Self::NationalId => "DO",
            Self::Passport => "PA",
            Self::Other => "OTRO",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DocumentType {
    type Err = ClinisyncError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DO" | "CI" | "CEDULA" | "CEDULA_IDENTIDAD" => Ok(Self::NationalId),
            "PA" | "PASAPORTE" | "PASSPORT" => Ok(Self::Passport),
            "OTRO" | "OTROS" | "DNI" => Ok(Self::Other),
            other => Err(ClinisyncError::Validation(format!("unknown document type '{other}'"))),
        }
    }
}

impl TryFrom<String> for DocumentType {
    type Error = ClinisyncError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DocumentType> for String {
    fn from(value: DocumentType) -> Self {
        value.code().to_string()
    }
}

/// Peripheral → central: a clinical document was created locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSyncRequest {
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub subject_id: String,
}

impl DocumentSyncRequest {
    /// Build a request, rejecting a blank subject identifier.
    pub fn new(document_id: Uuid, subject_id: impl Into<String>, tenant_id: Uuid) -> Result<Self> {
        let subject_id = subject_id.into();
        require_subject(&subject_id)?;
        Ok(Self { document_id, tenant_id, subject_id })
    }
}

/// Central → peripheral: outcome of a [`DocumentSyncRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSyncConfirmation {
    pub document_id: Uuid,
    pub aggregate_id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub subject_id: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub correlation_id: String,
}

impl DocumentSyncConfirmation {
    /// Confirmation for a request that was applied under `aggregate_id`.
    pub fn success(
        request: &DocumentSyncRequest,
        aggregate_id: Uuid,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            document_id: request.document_id,
            aggregate_id: Some(aggregate_id),
            tenant_id: request.tenant_id,
            subject_id: request.subject_id.clone(),
            success: true,
            error_message: None,
            correlation_id: correlation_id.into(),
        }
    }

    /// Confirmation for a request that could not be applied.
    pub fn failure(
        document_id: Uuid,
        tenant_id: Uuid,
        subject_id: impl Into<String>,
        error_message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            document_id,
            aggregate_id: None,
            tenant_id,
            subject_id: subject_id.into(),
            success: false,
            error_message: Some(error_message.into()),
            correlation_id: correlation_id.into(),
        }
    }

    /// Structural checks applied before sending and after receiving.
    pub fn validate(&self) -> Result<()> {
        require_subject(&self.subject_id)?;
        if self.success {
            if self.aggregate_id.is_none() {
                return Err(ClinisyncError::Validation(
                    "successful confirmation requires an aggregateId".into(),
                ));
            }
        } else if is_blank(self.error_message.as_deref()) {
            return Err(ClinisyncError::Validation(
                "failed confirmation requires an errorMessage".into(),
            ));
        }
        Ok(())
    }
}

/// Optional demographics registered alongside a patient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatientProfile {
    pub first_name: Option<String>,
    pub second_name: Option<String>,
    pub first_surname: Option<String>,
    pub second_surname: Option<String>,
    pub email: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub active: Option<bool>,
}

/// Peripheral → central: a patient was registered at a clinic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSyncRequest {
    pub subject_id: String,
    pub document_type: DocumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<PatientProfile>,
}

impl UserSyncRequest {
    /// Build a request, rejecting a blank subject identifier.
    pub fn new(subject_id: impl Into<String>, document_type: DocumentType) -> Result<Self> {
        let subject_id = subject_id.into();
        require_subject(&subject_id)?;
        Ok(Self { subject_id, document_type, tenant_id: None, profile: None })
    }

    /// Stamp the originating clinic.
    #[must_use]
    pub const fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Attach demographics.
    #[must_use]
    pub fn with_profile(mut self, profile: PatientProfile) -> Self {
        self.profile = Some(profile);
        self
    }
}

/// Central → peripheral: outcome of a [`UserSyncRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSyncConfirmation {
    pub subject_id: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
}

impl UserSyncConfirmation {
    /// Confirmation for a registered (or already known) patient.
    pub fn success(request: &UserSyncRequest, correlation_id: impl Into<String>) -> Self {
        Self {
            subject_id: request.subject_id.clone(),
            success: true,
            error_message: None,
            correlation_id: correlation_id.into(),
            tenant_id: request.tenant_id,
        }
    }

    /// Confirmation for a registration that failed.
    pub fn failure(
        subject_id: impl Into<String>,
        tenant_id: Option<Uuid>,
        error_message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            success: false,
            error_message: Some(error_message.into()),
            correlation_id: correlation_id.into(),
            tenant_id,
        }
    }

    /// Structural checks applied before sending and after receiving.
    pub fn validate(&self) -> Result<()> {
        require_subject(&self.subject_id)?;
        if !self.success && is_blank(self.error_message.as_deref()) {
            return Err(ClinisyncError::Validation(
                "failed confirmation requires an errorMessage".into(),
            ));
        }
        Ok(())
    }
}

/// Discriminator of [`SyncMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    DocumentSyncRequest,
    DocumentSyncConfirmation,
    UserSyncRequest,
    UserSyncConfirmation,
}

impl MessageKind {
    /// Tag value used on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DocumentSyncRequest => "document_sync_request",
            Self::DocumentSyncConfirmation => "document_sync_confirmation",
            Self::UserSyncRequest => "user_sync_request",
            Self::UserSyncConfirmation => "user_sync_confirmation",
        }
    }

    /// Queue that carries this kind of message.
    pub const fn queue(self) -> QueueName {
        match self {
            Self::DocumentSyncRequest => QueueName::DocumentSync,
            Self::DocumentSyncConfirmation => QueueName::DocumentConfirmation,
            Self::UserSyncRequest => QueueName::UserSync,
            Self::UserSyncConfirmation => QueueName::UserConfirmation,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every message exchanged between peripheral and central nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncMessage {
    DocumentSyncRequest(DocumentSyncRequest),
    DocumentSyncConfirmation(DocumentSyncConfirmation),
    UserSyncRequest(UserSyncRequest),
    UserSyncConfirmation(UserSyncConfirmation),
}

impl SyncMessage {
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::DocumentSyncRequest(_) => MessageKind::DocumentSyncRequest,
            Self::DocumentSyncConfirmation(_) => MessageKind::DocumentSyncConfirmation,
            Self::UserSyncRequest(_) => MessageKind::UserSyncRequest,
            Self::UserSyncConfirmation(_) => MessageKind::UserSyncConfirmation,
        }
    }

    pub const fn queue(&self) -> QueueName {
        self.kind().queue()
    }

    pub fn subject_id(&self) -> &str {
        match self {
            Self::DocumentSyncRequest(m) => &m.subject_id,
            Self::DocumentSyncConfirmation(m) => &m.subject_id,
            Self::UserSyncRequest(m) => &m.subject_id,
            Self::UserSyncConfirmation(m) => &m.subject_id,
        }
    }

    pub const fn tenant_id(&self) -> Option<Uuid> {
        match self {
            Self::DocumentSyncRequest(m) => Some(m.tenant_id),
            Self::DocumentSyncConfirmation(m) => Some(m.tenant_id),
            Self::UserSyncRequest(m) => m.tenant_id,
            Self::UserSyncConfirmation(m) => m.tenant_id,
        }
    }

    /// Tenant a confirmation is addressed to. Requests all go to the central
    /// node and carry no address.
    pub const fn address(&self) -> Option<Uuid> {
        match self {
            Self::DocumentSyncConfirmation(m) => Some(m.tenant_id),
            Self::UserSyncConfirmation(m) => m.tenant_id,
            Self::DocumentSyncRequest(_) | Self::UserSyncRequest(_) => None,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ClinisyncError::Internal(format!("failed to encode {}: {e}", self.kind())))
    }

    /// Strict decode; any schema violation is a validation error.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| ClinisyncError::Validation(format!("malformed sync message: {e}")))
    }
}

impl From<DocumentSyncRequest> for SyncMessage {
    fn from(value: DocumentSyncRequest) -> Self {
        Self::DocumentSyncRequest(value)
    }
}

impl From<DocumentSyncConfirmation> for SyncMessage {
    fn from(value: DocumentSyncConfirmation) -> Self {
        Self::DocumentSyncConfirmation(value)
    }
}

impl From<UserSyncRequest> for SyncMessage {
    fn from(value: UserSyncRequest) -> Self {
        Self::UserSyncRequest(value)
    }
}

impl From<UserSyncConfirmation> for SyncMessage {
    fn from(value: UserSyncConfirmation) -> Self {
        Self::UserSyncConfirmation(value)
    }
}

// ============================================================================
// Lenient drafts
// ============================================================================

/// Partially populated document request.
///
/// Used by batch producers (entries may be incomplete) and by the central
/// consumer to salvage ids from a payload that fails validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSyncDraft {
    pub document_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub subject_id: Option<String>,
}

impl DocumentSyncDraft {
    /// Read whatever fields are usable from a raw payload.
    pub fn parse(payload: &str) -> Result<Self> {
        let object = parse_object(payload, MessageKind::DocumentSyncRequest)?;
        Ok(Self {
            document_id: uuid_field(&object, "documentId"),
            tenant_id: uuid_field(&object, "tenantId"),
            subject_id: string_field(&object, "subjectId"),
        })
    }

    /// Promote to a complete request or explain what is missing.
    pub fn validate(&self) -> Result<DocumentSyncRequest> {
        let document_id = self.document_id.ok_or_else(|| missing("documentId"))?;
        let tenant_id = self.tenant_id.ok_or_else(|| missing("tenantId"))?;
        let subject_id = self.subject_id.clone().ok_or_else(|| missing("subjectId"))?;
        DocumentSyncRequest::new(document_id, subject_id, tenant_id)
    }
}

impl From<DocumentSyncRequest> for DocumentSyncDraft {
    fn from(value: DocumentSyncRequest) -> Self {
        Self {
            document_id: Some(value.document_id),
            tenant_id: Some(value.tenant_id),
            subject_id: Some(value.subject_id),
        }
    }
}

/// Partially populated user request. See [`DocumentSyncDraft`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSyncDraft {
    pub subject_id: Option<String>,
    pub document_type: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub profile: Option<PatientProfile>,
}

impl UserSyncDraft {
    /// Read whatever fields are usable from a raw payload.
    pub fn parse(payload: &str) -> Result<Self> {
        let object = parse_object(payload, MessageKind::UserSyncRequest)?;
        let profile = object
            .get("profile")
            .filter(|value| !value.is_null())
            .and_then(|value| serde_json::from_value(value.clone()).ok());
        Ok(Self {
            subject_id: string_field(&object, "subjectId"),
            document_type: string_field(&object, "documentType"),
            tenant_id: uuid_field(&object, "tenantId"),
            profile,
        })
    }

    /// Promote to a complete request or explain what is missing.
    pub fn validate(&self) -> Result<UserSyncRequest> {
        let subject_id = self.subject_id.clone().ok_or_else(|| missing("subjectId"))?;
        let document_type: DocumentType =
            self.document_type.as_deref().ok_or_else(|| missing("documentType"))?.parse()?;
        let mut request = UserSyncRequest::new(subject_id, document_type)?;
        request.tenant_id = self.tenant_id;
        request.profile = self.profile.clone();
        Ok(request)
    }
}

impl From<UserSyncRequest> for UserSyncDraft {
    fn from(value: UserSyncRequest) -> Self {
        Self {
            subject_id: Some(value.subject_id),
            document_type: Some(value.document_type.code().to_string()),
            tenant_id: value.tenant_id,
            profile: value.profile,
        }
    }
}

fn parse_object(payload: &str, expected: MessageKind) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| ClinisyncError::Validation(format!("payload is not valid JSON: {e}")))?;
    let Value::Object(object) = value else {
        return Err(ClinisyncError::Validation("payload is not a JSON object".into()));
    };
    match object.get("kind").and_then(Value::as_str) {
        Some(kind) if kind == expected.as_str() => Ok(object),
        Some(kind) => Err(ClinisyncError::Validation(format!(
            "unexpected message kind '{kind}', expected '{expected}'"
        ))),
        None => Err(ClinisyncError::Validation("payload has no message kind".into())),
    }
}

fn uuid_field(object: &Map<String, Value>, key: &str) -> Option<Uuid> {
    object.get(key).and_then(Value::as_str).and_then(|raw| Uuid::parse_str(raw).ok())
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn missing(field: &str) -> ClinisyncError {
    ClinisyncError::Validation(format!("missing or malformed {field}"))
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

fn require_subject(subject_id: &str) -> Result<()> {
    if subject_id.trim().is_empty() {
        return Err(ClinisyncError::Validation("subjectId must not be blank".into()));
    }
    Ok(())
}
