//! Appliance REST Client
//!
//! Thin wrappers around the vendor's REST API for the local control
//! endpoints: status, settings, program selection and the wake/brew
//! sequences. Every call records into the API usage statistics, and a `401`
//! triggers at most one forced token refresh and retry per request.

use std::sync::Arc;

use reqwest::{Method, StatusCode, header};
use serde::Serialize;
use serde_json::{Value, json};

use crate::application::ports::TokenProvider;
use crate::infrastructure::history::HistoryStore;
use crate::infrastructure::metrics::record_api_call;

/// Vendor media type for request and response bodies.
const VENDOR_MEDIA_TYPE: &str = "application/vnd.bsh.sdk.v1+json";

/// Power state setting key.
const POWER_STATE_SETTING: &str = "BSH.Common.Setting.PowerState";
/// Power state value: on.
const POWER_ON: &str = "BSH.Common.EnumType.PowerState.On";
/// Power state value: standby.
const POWER_STANDBY: &str = "BSH.Common.EnumType.PowerState.Standby";

/// Espresso program key used by the brew endpoint.
const ESPRESSO_PROGRAM: &str = "ConsumerProducts.CoffeeMaker.Program.Beverage.Espresso";
/// Fill quantity option key.
const FILL_QUANTITY_OPTION: &str = "ConsumerProducts.CoffeeMaker.Option.FillQuantity";
/// Option rejected by many devices; stripped before starting a program.
const AROMA_SELECT_OPTION: &str = "ConsumerProducts.CoffeeMaker.Option.AromaSelect";

/// REST client errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request could not be sent or the response body not read.
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Still `401` after a forced token refresh and retry.
    #[error("unauthorized after token refresh")]
    Unauthorized,

    /// The API rate limited the request.
    #[error("rate limited by the appliance API")]
    RateLimited,

    /// Any other non-success response.
    #[error("API request failed ({status}): {detail}")]
    Api {
        /// HTTP status code.
        status: StatusCode,
        /// Error description extracted from the response body.
        detail: String,
    },

    /// No valid access token could be obtained.
    #[error("token unavailable: {0}")]
    Token(anyhow::Error),
}

/// Result of a wake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum WakeOutcome {
    /// The appliance was in standby and has been switched on.
    Activated,
    /// The appliance was already on.
    AlreadyOn,
    /// The power state was something unexpected.
    Unknown(String),
}

/// REST verb wrappers for one appliance.
pub struct ApplianceClient {
    http: reqwest::Client,
    base_url: String,
    haid: String,
    tokens: Arc<dyn TokenProvider>,
    stats: Option<Arc<HistoryStore>>,
}

impl ApplianceClient {
    /// Create a new client.
    #[must_use]
    pub fn new(base_url: String, haid: String, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url,
            haid,
            tokens,
            stats: None,
        }
    }

    /// Record calls into the API usage statistics.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<HistoryStore>) -> Self {
        self.stats = Some(stats);
        self
    }

    // =========================================================================
    // Request Plumbing
    // =========================================================================

    /// Issue one request with the single-retry `401` policy.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        self.record_call(path);

        let token = self.tokens.access_token().await.map_err(ApiError::Token)?;
        let mut response = self.send(method.clone(), path, body, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::info!(path, "401 from appliance API, refreshing token and retrying once");
            match self.tokens.force_refresh().await {
                Ok(fresh) => {
                    response = self.send(method, path, body, &fresh).await?;
                    if response.status() == StatusCode::UNAUTHORIZED {
                        return Err(ApiError::Unauthorized);
                    }
                }
                Err(error) => {
                    tracing::warn!(path, error = %error, "token refresh for retry failed");
                    return Err(ApiError::Unauthorized);
                }
            }
        }

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited);
        }
        if !status.is_success() {
            let detail = error_detail(&response.text().await.unwrap_or_default());
            return Err(ApiError::Api { status, detail });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(json!({}));
        }
        Ok(response.json().await?)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(token)
            .header(header::ACCEPT, VENDOR_MEDIA_TYPE)
            .header(header::CONTENT_TYPE, VENDOR_MEDIA_TYPE);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    fn record_call(&self, path: &str) {
        record_api_call();
        tracing::debug!(path, "appliance API call");
        if let Some(stats) = self.stats.clone() {
            tokio::task::spawn_blocking(move || stats.increment_api_call());
        }
    }

    // =========================================================================
    // REST Verbs
    // =========================================================================

    /// Current appliance status.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn get_status(&self) -> Result<Value, ApiError> {
        self.request(Method::GET, &format!("/homeappliances/{}/status", self.haid), None)
            .await
    }

    /// Current appliance settings.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn get_settings(&self) -> Result<Value, ApiError> {
        self.request(
            Method::GET,
            &format!("/homeappliances/{}/settings", self.haid),
            None,
        )
        .await
    }

    /// Programs the appliance can run.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn get_available_programs(&self) -> Result<Value, ApiError> {
        self.request(
            Method::GET,
            &format!("/homeappliances/{}/programs/available", self.haid),
            None,
        )
        .await
    }

    /// The currently selected program.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn get_selected_program(&self) -> Result<Value, ApiError> {
        self.request(
            Method::GET,
            &format!("/homeappliances/{}/programs/selected", self.haid),
            None,
        )
        .await
    }

    /// The currently running program.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn get_active_program(&self) -> Result<Value, ApiError> {
        self.request(
            Method::GET,
            &format!("/homeappliances/{}/programs/active", self.haid),
            None,
        )
        .await
    }

    /// Select a program with options.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn select_program(&self, key: &str, options: Vec<Value>) -> Result<Value, ApiError> {
        self.request(
            Method::PUT,
            &format!("/homeappliances/{}/programs/selected", self.haid),
            Some(&json!({"data": {"key": key, "options": options}})),
        )
        .await
    }

    /// Start the currently selected program.
    ///
    /// Re-reads the selection and strips options some devices reject.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn start_program(&self) -> Result<Value, ApiError> {
        let selected = self.get_selected_program().await?;
        let program = selected.get("data").cloned().unwrap_or_else(|| json!({}));
        let options = filter_program_options(program.get("options"));

        self.request(
            Method::PUT,
            &format!("/homeappliances/{}/programs/active", self.haid),
            Some(&json!({"data": {"key": program.get("key"), "options": options}})),
        )
        .await
    }

    /// Stop the running program.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn stop_program(&self) -> Result<Value, ApiError> {
        self.request(
            Method::DELETE,
            &format!("/homeappliances/{}/programs/active", self.haid),
            None,
        )
        .await
    }

    /// Clear the selected program.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn clear_selected_program(&self) -> Result<Value, ApiError> {
        self.request(
            Method::DELETE,
            &format!("/homeappliances/{}/programs/selected", self.haid),
            None,
        )
        .await
    }

    /// Write one appliance setting.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the call fails.
    pub async fn set_setting(&self, key: &str, value: &Value) -> Result<Value, ApiError> {
        self.request(
            Method::PUT,
            &format!("/homeappliances/{}/settings/{key}", self.haid),
            Some(&json!({"data": {"key": key, "value": value}})),
        )
        .await
    }

    // =========================================================================
    // Flows
    // =========================================================================

    /// Wake the appliance from standby.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when reading or writing the power state fails.
    pub async fn wake(&self) -> Result<WakeOutcome, ApiError> {
        let settings = self.get_settings().await?;
        match power_state(&settings) {
            Some(POWER_STANDBY) => {
                self.set_setting(POWER_STATE_SETTING, &json!(POWER_ON)).await?;
                Ok(WakeOutcome::Activated)
            }
            Some(POWER_ON) => Ok(WakeOutcome::AlreadyOn),
            other => Ok(WakeOutcome::Unknown(
                other.unwrap_or("missing").to_string(),
            )),
        }
    }

    /// Select and start an espresso with the given fill quantity.
    ///
    /// Waking the device and clearing a stale selection are best-effort; the
    /// brew fails only when selection or start fail.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when program selection or start fails.
    pub async fn brew(&self, fill_ml: u32) -> Result<(), ApiError> {
        if let Err(error) = self.wake().await {
            tracing::warn!(error = %error, "could not check power state before brew");
        }
        if let Err(error) = self.clear_selected_program().await {
            tracing::debug!(error = %error, "no selected program to clear");
        }

        let options = vec![json!({"key": FILL_QUANTITY_OPTION, "value": fill_ml})];
        self.select_program(ESPRESSO_PROGRAM, options).await?;
        self.start_program().await?;
        Ok(())
    }
}

/// Pull the power state value out of a settings response.
fn power_state(settings: &Value) -> Option<&str> {
    settings
        .get("data")?
        .get("settings")?
        .as_array()?
        .iter()
        .find(|setting| setting.get("key").and_then(Value::as_str) == Some(POWER_STATE_SETTING))?
        .get("value")?
        .as_str()
}

/// Drop options that devices frequently reject when starting a program.
fn filter_program_options(options: Option<&Value>) -> Vec<Value> {
    options
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter(|option| {
                    option.get("key").and_then(Value::as_str) != Some(AROMA_SELECT_OPTION)
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Extract a human-readable error description from a response body.
fn error_detail(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    match parsed.get("error") {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Object(error)) => error
            .get("description")
            .and_then(Value::as_str)
            .map_or_else(|| body.to_string(), ToString::to_string),
        _ => parsed
            .get("description")
            .and_then(Value::as_str)
            .map_or_else(|| body.to_string(), ToString::to_string),
    }
}
