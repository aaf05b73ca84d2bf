use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

const ERROR_BODY_PREVIEW_CHARS: usize = 240;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid backend base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("backend request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("backend {endpoint} answered status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("backend {endpoint} returned an unparseable body: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("backend {endpoint} returned no data")]
    EmptyData { endpoint: String },
}

/// Identifies which backend and channel a call is made for. Both values come
/// from the widget's connect query and are forwarded as given.
#[derive(Debug, Clone, Copy)]
pub struct BackendTarget<'a> {
    pub base_url: &'a str,
    pub channel_id: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOperation {
    Register,
    History,
    Receive,
}

impl BackendOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::History => "history",
            Self::Receive => "receive",
        }
    }
}

impl BackendTarget<'_> {
    pub fn endpoint(&self, operation: BackendOperation) -> Result<String, BackendError> {
        let base = self.base_url.trim().trim_end_matches('/');
        let parsed = Url::parse(base).map_err(|err| BackendError::InvalidBaseUrl {
            url: self.base_url.to_owned(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BackendError::InvalidBaseUrl {
                url: self.base_url.to_owned(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        Ok(format!(
            "{base}/c/wch/{}/{}",
            self.channel_id,
            operation.as_str()
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContactIdentity {
    #[serde(default)]
    pub contact_uuid: String,
    #[serde(default)]
    pub contact_token: String,
    #[serde(default)]
    pub contact_urn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Vec<ContactIdentity>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub attachments: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Vec<Vec<HistoryEntry>>,
}

/// The backend chat API as seen by the dispatcher.
#[async_trait]
pub trait BackendGateway: Send + Sync {
    async fn register(
        &self,
        target: BackendTarget<'_>,
        urn: &str,
        user_token: &str,
        language: &str,
    ) -> Result<ContactIdentity, BackendError>;

    /// Returns the first history page.
    async fn history(
        &self,
        target: BackendTarget<'_>,
        user_token: &str,
    ) -> Result<Vec<HistoryEntry>, BackendError>;

    async fn relay_inbound(
        &self,
        target: BackendTarget<'_>,
        from: &str,
        text: &str,
    ) -> Result<(), BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
}

impl HttpBackend {
    pub fn new(timeout_ms: u64, user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1_000)))
            .user_agent(user_agent)
            .build()
            .context("failed building backend http client")?;
        Ok(Self { http })
    }

    async fn post_json(
        &self,
        target: BackendTarget<'_>,
        operation: BackendOperation,
        body: &Value,
    ) -> Result<(String, String), BackendError> {
        let endpoint = target.endpoint(operation)?;
        debug!("backend POST {endpoint}");
        let response = self
            .http
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|source| BackendError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;
        if !status.is_success() {
            return Err(BackendError::Status {
                endpoint,
                status: status.as_u16(),
                body: preview(&text),
            });
        }
        Ok((endpoint, text))
    }
}

#[async_trait]
impl BackendGateway for HttpBackend {
    async fn register(
        &self,
        target: BackendTarget<'_>,
        urn: &str,
        user_token: &str,
        language: &str,
    ) -> Result<ContactIdentity, BackendError> {
        let body = json!({
            "urn": urn,
            "user_token": user_token,
            "language": language,
        });
        let (endpoint, text) = self
            .post_json(target, BackendOperation::Register, &body)
            .await?;
        let parsed: RegisterResponse =
            serde_json::from_str(&text).map_err(|source| BackendError::Decode {
                endpoint: endpoint.clone(),
                source,
            })?;
        let message = parsed.message;
        parsed.data.into_iter().next().ok_or_else(|| {
            debug!("backend {endpoint} returned no data: {message}");
            BackendError::EmptyData { endpoint }
        })
    }

    async fn history(
        &self,
        target: BackendTarget<'_>,
        user_token: &str,
    ) -> Result<Vec<HistoryEntry>, BackendError> {
        let body = json!({ "user_token": user_token });
        let (endpoint, text) = self
            .post_json(target, BackendOperation::History, &body)
            .await?;
        let parsed: HistoryResponse =
            serde_json::from_str(&text).map_err(|source| BackendError::Decode {
                endpoint: endpoint.clone(),
                source,
            })?;
        let message = parsed.message;
        parsed.data.into_iter().next().ok_or_else(|| {
            debug!("backend {endpoint} returned no data: {message}");
            BackendError::EmptyData { endpoint }
        })
    }

    async fn relay_inbound(
        &self,
        target: BackendTarget<'_>,
        from: &str,
        text: &str,
    ) -> Result<(), BackendError> {
        let body = json!({
            "from": from,
            "text": text,
            "attachment_url": "",
        });
        self.post_json(target, BackendOperation::Receive, &body)
            .await
            .map(|_| ())
    }
}

fn preview(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_PREVIEW_CHARS {
        return body.to_owned();
    }
    let mut out = body
        .chars()
        .take(ERROR_BODY_PREVIEW_CHARS)
        .collect::<String>();
    out.push_str("...");
    out
}


#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{BackendError, BackendGateway, BackendTarget, ContactIdentity, HistoryEntry};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum BackendCall {
        Register {
            base_url: String,
            channel_id: String,
            urn: String,
            user_token: String,
            language: String,
        },
        History {
            channel_id: String,
            user_token: String,
        },
        Relay {
            channel_id: String,
            from: String,
            text: String,
        },
    }

    /// In-memory gateway that records every call and answers from fixtures.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingBackend {
        pub(crate) calls: Mutex<Vec<BackendCall>>,
        pub(crate) contact: Option<ContactIdentity>,
        pub(crate) history_page: Vec<HistoryEntry>,
        pub(crate) fail: bool,
    }

    impl RecordingBackend {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<BackendCall> {
            self.calls.lock().map(|guard| guard.clone()).unwrap_or_default()
        }

        fn record(&self, call: BackendCall) -> Result<(), BackendError> {
            if let Ok(mut guard) = self.calls.lock() {
                guard.push(call);
            }
            if self.fail {
                return Err(BackendError::EmptyData {
                    endpoint: "fake".to_owned(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BackendGateway for RecordingBackend {
        async fn register(
            &self,
            target: BackendTarget<'_>,
            urn: &str,
            user_token: &str,
            language: &str,
        ) -> Result<ContactIdentity, BackendError> {
            self.record(BackendCall::Register {
                base_url: target.base_url.to_owned(),
                channel_id: target.channel_id.to_owned(),
                urn: urn.to_owned(),
                user_token: user_token.to_owned(),
                language: language.to_owned(),
            })?;
            self.contact.clone().ok_or(BackendError::EmptyData {
                endpoint: "fake".to_owned(),
            })
        }

        async fn history(
            &self,
            target: BackendTarget<'_>,
            user_token: &str,
        ) -> Result<Vec<HistoryEntry>, BackendError> {
            self.record(BackendCall::History {
                channel_id: target.channel_id.to_owned(),
                user_token: user_token.to_owned(),
            })?;
            Ok(self.history_page.clone())
        }

        async fn relay_inbound(
            &self,
            target: BackendTarget<'_>,
            from: &str,
            text: &str,
        ) -> Result<(), BackendError> {
            self.record(BackendCall::Relay {
                channel_id: target.channel_id.to_owned(),
                from: from.to_owned(),
                text: text.to_owned(),
            })
        }
    }
}
