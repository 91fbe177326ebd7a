use super::ErrorDetails;
use crate::audio::Voice;

/// Server view of the session, as echoed in `session.created`/`session.updated`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionResource {
    id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    voice: Option<Voice>,
    #[serde(default)]
    modalities: Vec<String>,
}

impl SessionResource {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn voice(&self) -> Option<&Voice> {
        self.voice.as_ref()
    }

    pub fn modalities(&self) -> &[String] {
        &self.modalities
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseResource {
    id: String,

    /// "completed", "cancelled", "failed", "incomplete" or "in_progress"
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    status_details: Option<ResponseStatusDetails>,
    #[serde(default)]
    output: Vec<serde_json::Value>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl ResponseResource {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn status_details(&self) -> Option<&ResponseStatusDetails> {
        self.status_details.as_ref()
    }

    /// The error carried by a failed response, if any.
    pub fn error(&self) -> Option<&ErrorDetails> {
        self.status_details.as_ref().and_then(|d| d.error.as_ref())
    }

    pub fn output(&self) -> &[serde_json::Value] {
        &self.output
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseStatusDetails {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    error: Option<ErrorDetails>,
}

impl ResponseStatusDetails {
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    total_tokens: i32,
    input_tokens: i32,
    output_tokens: i32,
}

impl Usage {
    pub fn total_tokens(&self) -> i32 {
        self.total_tokens
    }

    pub fn input_tokens(&self) -> i32 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> i32 {
        self.output_tokens
    }
}
