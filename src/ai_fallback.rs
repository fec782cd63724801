//! Optional model-assisted field extraction for documents the pattern
//! rules could not fill in.
//!
//! Disabled by default. When enabled, the client posts the document text
//! to a chat-completions endpoint asking for a fixed JSON shape, first in
//! strict json_schema mode, falling back once to loose JSON mode when the
//! endpoint rejects the schema parameter. Replies only ever fill fields
//! the offline parse left empty.
//!
//! Retry strategy: statuses 408, 429 and 5xx plus network errors back
//! off exponentially (1s, 2s, 4s, capped at 32s) up to `max_retries`;
//! other 4xx fail immediately. The wire call sits behind the
//! [`AiTransport`] port so the retry loop is exercised in tests with a
//! scripted transport, the same way the registry client is.
//!
//! Document text and model replies are never logged; the audit trail
//! carries only the status code and attempt count.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AiConfig;
use crate::models::{CandidateDocument, LineItem};
use crate::parser;

const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

fn is_retryable(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// A 400 complaining about the response format means the endpoint cannot
/// do strict schema mode.
fn is_schema_rejection(status: u16, body: &str) -> bool {
    status == 400 && (body.contains("response_format") || body.contains("json_schema"))
}

/// Structured reply decoded from the model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AiExtraction {
    pub supplier_tax_id: Option<String>,
    pub doc_number: Option<String>,
    pub issue_date: Option<String>,
    pub total_with_vat: Option<f64>,
    pub currency: Option<String>,
    #[serde(default)]
    pub items: Vec<AiItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiItem {
    pub description: String,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub line_total: Option<f64>,
    pub vat_rate: Option<f64>,
}

/// Redacted call record for the forensic trail.
#[derive(Debug, Clone, Serialize)]
pub struct AiAudit {
    pub attempts: u32,
    pub last_status: Option<u16>,
    pub schema_mode: String,
}

/// Raw reply from the extraction endpoint: status plus body text.
#[derive(Debug, Clone)]
pub struct AiResponse {
    pub status: u16,
    pub body: String,
}

/// One request to the extraction endpoint. `Err` is a network-level
/// failure; an HTTP error status comes back as `Ok` with that status.
#[async_trait]
pub trait AiTransport: Send + Sync {
    async fn send(&self, request: &Value) -> Result<AiResponse>;
}

/// HTTPS transport against a chat-completions endpoint, authenticated
/// with `OPENAI_API_KEY` from the environment.
pub struct HttpAiTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl HttpAiTransport {
    pub fn new(cfg: &AiConfig) -> Result<Self> {
        let endpoint = match cfg.endpoint.as_deref() {
            Some(e) if !e.is_empty() => e.to_string(),
            _ => bail!("ai.endpoint must be set"),
        };
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            timeout: Duration::from_secs(cfg.timeout_secs),
        })
    }
}

#[async_trait]
impl AiTransport for HttpAiTransport {
    async fn send(&self, request: &Value) -> Result<AiResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(AiResponse { status, body })
    }
}

pub struct AiClient {
    transport: Arc<dyn AiTransport>,
    model: String,
    max_retries: u32,
}

impl AiClient {
    /// Build the client from config. Fails when the fallback is enabled
    /// without an endpoint, model, or `OPENAI_API_KEY` in the environment.
    pub fn new(cfg: &AiConfig) -> Result<Self> {
        if !cfg.enabled {
            bail!("AI fallback is disabled");
        }
        let model = match cfg.model.as_deref() {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => bail!("ai.model must be set"),
        };
        Ok(Self {
            transport: Arc::new(HttpAiTransport::new(cfg)?),
            model,
            max_retries: cfg.max_retries,
        })
    }

    /// Build the client over an explicit transport.
    pub fn with_transport(
        transport: Arc<dyn AiTransport>,
        model: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            transport,
            model: model.into(),
            max_retries,
        }
    }

    /// Ask the model to extract header fields and items from `text`.
    pub async fn extract(&self, text: &str) -> Result<(AiExtraction, AiAudit)> {
        let mut strict = true;
        let mut attempts = 0u32;
        let mut last_status = None;
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            let body = request_body(&self.model, text, strict);
            match self.transport.send(&body).await {
                Ok(response) => {
                    last_status = Some(response.status);

                    if (200..300).contains(&response.status) {
                        let reply: Value = serde_json::from_str(&response.body)
                            .map_err(|e| anyhow!("reply body is not JSON: {}", e))?;
                        let extraction = decode_reply(&reply)?;
                        return Ok((
                            extraction,
                            AiAudit {
                                attempts,
                                last_status,
                                schema_mode: if strict { "strict" } else { "loose" }.to_string(),
                            },
                        ));
                    }

                    if is_retryable(response.status) {
                        last_err = Some(anyhow!(
                            "extraction endpoint returned {}",
                            response.status
                        ));
                        continue;
                    }

                    if strict && is_schema_rejection(response.status, &response.body) {
                        strict = false;
                        last_err = Some(anyhow!("strict schema mode rejected"));
                        continue;
                    }
                    bail!("extraction endpoint returned {}", response.status);
                }
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("extraction retries exhausted")))
    }
}

fn request_body(model: &str, text: &str, strict: bool) -> Value {
    let response_format = if strict {
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": "document_fields",
                "strict": true,
                "schema": extraction_schema(),
            }
        })
    } else {
        json!({ "type": "json_object" })
    };
    json!({
        "model": model,
        "messages": [
            {
                "role": "system",
                "content": "Extract accounting document fields from the text. \
                            Reply with JSON only. Use null for anything not \
                            present in the text; never guess values."
            },
            { "role": "user", "content": text }
        ],
        "response_format": response_format,
    })
}

fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["supplier_tax_id", "doc_number", "issue_date",
                     "total_with_vat", "currency", "items"],
        "properties": {
            "supplier_tax_id": { "type": ["string", "null"] },
            "doc_number": { "type": ["string", "null"] },
            "issue_date": { "type": ["string", "null"], "description": "YYYY-MM-DD" },
            "total_with_vat": { "type": ["number", "null"] },
            "currency": { "type": ["string", "null"] },
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["description", "quantity", "unit_price",
                                 "line_total", "vat_rate"],
                    "properties": {
                        "description": { "type": "string" },
                        "quantity": { "type": ["number", "null"] },
                        "unit_price": { "type": ["number", "null"] },
                        "line_total": { "type": ["number", "null"] },
                        "vat_rate": { "type": ["number", "null"] }
                    }
                }
            }
        }
    })
}

fn decode_reply(reply: &Value) -> Result<AiExtraction> {
    let content = reply["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| anyhow!("reply carries no message content"))?;
    let mut parsed: Value =
        serde_json::from_str(content).map_err(|e| anyhow!("reply is not valid JSON: {}", e))?;
    ensure_schema_defaults(&mut parsed);
    Ok(serde_json::from_value(parsed)?)
}

/// Fill missing top-level keys with nulls or empty arrays so loose-mode
/// replies decode through the same struct as strict-mode ones.
pub fn ensure_schema_defaults(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    for key in [
        "supplier_tax_id",
        "doc_number",
        "issue_date",
        "total_with_vat",
        "currency",
    ] {
        obj.entry(key).or_insert(Value::Null);
    }
    obj.entry("items").or_insert_with(|| json!([]));
}

/// Merge a model reply into the candidate. Only fields the offline parse
/// left empty are filled; a synthetic tax id never replaces a real one,
/// and a real one from the model is only accepted into an empty slot.
pub fn merge_extraction(doc: &mut CandidateDocument, ai: &AiExtraction) {
    if doc.supplier_tax_id.is_none() {
        if let Some(tax_id) = &ai.supplier_tax_id {
            if !parser::is_pseudo_tax_id(tax_id) && !tax_id.trim().is_empty() {
                doc.supplier_tax_id = Some(tax_id.trim().to_string());
                doc.push_reason("supplier tax id filled by extraction fallback");
            }
        }
    }
    if doc.doc_number.is_none() {
        if let Some(n) = &ai.doc_number {
            if !n.trim().is_empty() {
                doc.doc_number = Some(n.trim().to_string());
                doc.push_reason("document number filled by extraction fallback");
            }
        }
    }
    if doc.issue_date.is_none() {
        if let Some(raw) = &ai.issue_date {
            if let Ok(d) = chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
                doc.issue_date = Some(d);
                doc.push_reason("issue date filled by extraction fallback");
            }
        }
    }
    if doc.total_with_vat.is_none() {
        if let Some(t) = ai.total_with_vat {
            doc.total_with_vat = Some(t);
            doc.push_reason("grand total filled by extraction fallback");
        }
    }
    if doc.items.is_empty() && !ai.items.is_empty() {
        doc.items = ai
            .items
            .iter()
            .map(|i| LineItem {
                description: i.description.clone(),
                quantity: i.quantity.unwrap_or(1.0),
                unit_price: i.unit_price,
                line_total: i.line_total,
                vat_rate: i.vat_rate,
            })
            .collect();
        doc.push_reason("line items filled by extraction fallback");
    }
}
