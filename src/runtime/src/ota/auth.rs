//! OAuth2 client-credentials exchange with the OTA authorization server.

use lockbox_core::error::{LockboxError, Result};

use super::credentials::ServerCredentials;
use crate::http::{join_url, HttpRequest, HttpTransport};

/// Exchange the client credentials for an access token.
///
/// POSTs `grant_type=client_credentials` (plus `scope` when configured) to
/// `{auth_server}/token`, authenticating the client with HTTP Basic.
pub async fn fetch_access_token(
    transport: &dyn HttpTransport,
    credentials: &ServerCredentials,
) -> Result<String> {
    if credentials.client_id.is_empty() || credentials.client_secret.is_empty() {
        return Err(LockboxError::Authorization(
            "client_id and client_secret must be set to fetch an access token".to_string(),
        ));
    }

    let url = join_url(&credentials.auth_server, "token");
    let mut form = vec![(
        "grant_type".to_string(),
        "client_credentials".to_string(),
    )];
    if let Some(scope) = &credentials.scope {
        form.push(("scope".to_string(), scope.clone()));
    }

    tracing::debug!(url = %url, "Requesting access token");
    let request = HttpRequest::post_form(&url, form)
        .basic_auth(&credentials.client_id, &credentials.client_secret)
        .header("Accept", "application/json");
    let response = transport
        .send(request)
        .await
        .map_err(|e| LockboxError::Authorization(e.to_string()))?;

    if !response.is_success() {
        return Err(LockboxError::Authorization(format!(
            "Token request to {} failed with status {}",
            url, response.status
        )));
    }

    let body: serde_json::Value = response
        .json()
        .map_err(|e| LockboxError::Authorization(format!("Malformed token response: {}", e)))?;
    body.get("access_token")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            LockboxError::Authorization("Token response carried no access_token".to_string())
        })
}
