// Second factor verification against an external access-control API. The
// proxy has already seen the directory accept the password; the verifier
// decides whether the bind is allowed to succeed.

use crate::config::{ApiConfig, PrivacyMode};
use crate::directory::Profile;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessVerdict {
    Granted,
    Denied,
}

/// Profile fields released to the verifier, after privacy filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyContext {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Apply a client policy's privacy mode to the loaded profile. `full` strips
/// everything but the identity, `partial` releases only the listed fields.
pub fn privacy_filtered(
    profile: Option<&Profile>,
    mode: PrivacyMode,
    fields: &[String],
) -> VerifyContext {
    let Some(profile) = profile else {
        return VerifyContext::default();
    };
    let allow = |field: &str| match mode {
        PrivacyMode::None => true,
        PrivacyMode::Full => false,
        PrivacyMode::Partial => fields.iter().any(|f| f.eq_ignore_ascii_case(field)),
    };
    VerifyContext {
        name: if allow("name") {
            profile.display_name.clone()
        } else {
            None
        },
        email: if allow("email") {
            profile.email.clone()
        } else {
            None
        },
    }
}

/// Surface every session depends on. Object-safe so tests can substitute a
/// scripted verifier.
#[async_trait]
pub trait SecondFactorVerifier: Send + Sync {
    async fn verify(
        &self,
        client: &str,
        identity: &str,
        context: &VerifyContext,
    ) -> Result<AccessVerdict>;
}

#[derive(Serialize)]
struct AccessRequest<'a> {
    identity: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
}

#[derive(Deserialize)]
struct AccessResponse {
    granted: bool,
}

/// Production verifier: POSTs the access request to the first API endpoint
/// that answers. Endpoints are tried in configured order; transport failures
/// move on to the next one.
pub struct ApiVerifier {
    http: reqwest::Client,
    urls: Vec<String>,
    authorization: String,
    bypass_when_unreachable: bool,
}

impl ApiVerifier {
    pub fn new(api: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()
            .context("building the access API HTTP client")?;
        let credentials = BASE64.encode(format!("{}:{}", api.key, api.secret));
        Ok(ApiVerifier {
            http,
            urls: api.urls.clone(),
            authorization: format!("Basic {credentials}"),
            bypass_when_unreachable: api.bypass_second_factor_when_unreachable,
        })
    }

    async fn post(&self, url: &str, body: &AccessRequest<'_>) -> Result<AccessVerdict> {
        let response = self
            .http
            .post(format!("{url}/access/requests/la"))
            .header(reqwest::header::AUTHORIZATION, self.authorization.as_str())
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            bail!("access API answered {status}");
        }
        let decision: AccessResponse = response.json().await?;
        Ok(if decision.granted {
            AccessVerdict::Granted
        } else {
            AccessVerdict::Denied
        })
    }
}

#[async_trait]
impl SecondFactorVerifier for ApiVerifier {
    async fn verify(
        &self,
        client: &str,
        identity: &str,
        context: &VerifyContext,
    ) -> Result<AccessVerdict> {
        let body = AccessRequest {
            identity,
            name: context.name.as_deref(),
            email: context.email.as_deref(),
        };
        for url in &self.urls {
            match self.post(url, &body).await {
                Ok(verdict) => {
                    debug!("second factor for {identity} on {client}: {verdict:?} via {url}");
                    return Ok(verdict);
                }
                Err(e) => warn!("second-factor API {url} failed for {identity}: {e:#}"),
            }
        }
        if self.bypass_when_unreachable {
            warn!("no second-factor API reachable, letting {identity} through per configuration");
            Ok(AccessVerdict::Granted)
        } else {
            warn!("no second-factor API reachable, denying {identity} on {client}");
            Ok(AccessVerdict::Denied)
        }
    }
}
