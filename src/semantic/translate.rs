//! Query translation.
//!
//! CLIP text towers are trained on English captions, so non-English queries
//! are translated before encoding when a translator is configured.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for translation. Always recoverable for the caller.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("translation request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("translation service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("translation service returned an empty result")]
    Empty,
}

pub trait Translator: Send + Sync {
    fn translate(&self, text: &str) -> Result<String, TranslateError>;
}

/// Translator speaking the LibreTranslate JSON API (`POST /translate`).
pub struct HttpTranslator {
    client: reqwest::blocking::Client,
    endpoint: String,
    source: String,
    target: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: Option<String>,
    error: Option<String>,
}

impl HttpTranslator {
    pub fn new(
        endpoint: &str,
        source: &str,
        target: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TranslateError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            source: source.to_string(),
            target: target.to_string(),
            api_key,
        })
    }

    fn parse_response(status: u16, body: TranslateResponse) -> Result<String, TranslateError> {
        if let Some(message) = body.error {
            return Err(TranslateError::Service { status, message });
        }

        match body.translated_text.map(|t| t.trim().to_string()) {
            Some(text) if !text.is_empty() => Ok(text),
            _ => Err(TranslateError::Empty),
        }
    }
}

impl Translator for HttpTranslator {
    fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let request = TranslateRequest {
            q: text,
            source: &self.source,
            target: &self.target,
            format: "text",
            api_key: self.api_key.as_deref(),
        };

        let resp = self
            .client
            .post(format!("{}/translate", self.endpoint))
            .json(&request)
            .send()?;

        let status = resp.status().as_u16();
        let body = resp.json::<TranslateResponse>()?;
        let translated = Self::parse_response(status, body)?;

        log::debug!("translated '{text}' -> '{translated}'");
        Ok(translated)
    }
}
