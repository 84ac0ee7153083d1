//! Outbound calls to the messaging gateway that delivered the webhook.

use std::time::Duration;

use reqwest::RequestBuilder;
use serde_json::{json, Value};

use crate::error::IngestError;
use crate::types::{GatewayCredentials, MessageKey};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Media as returned by the gateway, still base64 encoded.
#[derive(Debug, Clone)]
pub struct GatewayMedia {
    pub base64: String,
    pub mimetype: Option<String>,
}

#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new() -> Result<Self, IngestError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http })
    }

    fn post(&self, creds: &GatewayCredentials, path: &str) -> RequestBuilder {
        let url = format!("{}/{}/{}", creds.api_url, path, creds.instance);
        let request = self.http.post(url);
        if creds.provider.uses_bearer_auth() {
            request.bearer_auth(&creds.api_key)
        } else {
            request.header("apikey", &creds.api_key)
        }
    }

    async fn send_json(request: RequestBuilder, body: Value) -> Result<Value, IngestError> {
        let response = request.json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Gateway { status, body });
        }
        Ok(response.json::<Value>().await?)
    }

    /// Asks the gateway to decrypt and return the attachment of `key`.
    pub async fn fetch_media_base64(
        &self,
        creds: &GatewayCredentials,
        key: &MessageKey,
    ) -> Result<GatewayMedia, IngestError> {
        let request = self.post(creds, "chat/getBase64FromMediaMessage");
        let data = Self::send_json(request, json!({ "message": { "key": key } })).await?;

        let base64 = data
            .get("base64")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IngestError::Decode("gateway returned no base64 media".to_string()))?;
        let mimetype = data
            .get("mimetype")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(GatewayMedia {
            base64: base64.to_string(),
            mimetype,
        })
    }

    /// Profile picture URL for `phone`, if the gateway knows one.
    pub async fn fetch_profile_picture(
        &self,
        creds: &GatewayCredentials,
        phone: &str,
    ) -> Result<Option<String>, IngestError> {
        let request = self.post(creds, "chat/fetchProfile");
        let data = Self::send_json(request, json!({ "number": phone })).await?;
        Ok(["profilePictureUrl", "picture"]
            .iter()
            .filter_map(|field| data.get(*field).and_then(Value::as_str))
            .map(str::trim)
            .find(|url| !url.is_empty())
            .map(str::to_string))
    }
}
