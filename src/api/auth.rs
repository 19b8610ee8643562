use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ApiClient, ApiError, Auth, ValidationErrors};

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Check whether a JWT has expired.
///
/// The signature is not verified; the server remains the authority and the
/// claim is only read to decide whether to refresh before sending. Tokens
/// that cannot be decoded are treated as expired.
pub fn token_expired(token: &str) -> bool {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => data.claims.exp <= chrono::Utc::now().timestamp(),
        Err(e) => {
            debug!("Failed to decode stored token: {}", e);
            true
        }
    }
}

impl ApiClient {
    /// Build the `Authorization` header value, refreshing or obtaining a token
    /// when the stored one is missing or expired
    pub(super) async fn authorization_header(&self, auth: &Auth) -> Result<String, ApiError> {
        if let Auth::Credentials { email, password } = auth {
            let token = self.obtain_token(email, password).await?;
            return Ok(format!("JWT {}", token));
        }

        if let Some(token) = self.config.token()? {
            if !token_expired(&token) {
                return Ok(format!("JWT {}", token));
            }

            info!("Stored token has expired, refreshing");
            match self.token_call("/api-token-refresh/", json!({ "token": token })).await {
                Ok(fresh) => {
                    self.config.set_token(&fresh)?;
                    return Ok(format!("JWT {}", fresh));
                }
                Err(ApiError::Validation(errors)) => {
                    debug!("Token refresh rejected: {}", errors);
                }
                Err(e) => return Err(e),
            }
        }

        println!(
            "If you already have an account, please enter your credentials and we will log you in :"
        );
        let email = self.prompter.input("E-mail")?;
        let password = self.prompter.password("Password")?;
        let token = self.obtain_token(&email, &password).await?;
        Ok(format!("JWT {}", token))
    }

    async fn obtain_token(&self, email: &str, password: &str) -> Result<String, ApiError> {
        let token = self
            .token_call(
                "/api-token-auth/",
                json!({ "email": email, "password": password }),
            )
            .await?;
        self.config.set_token(&token)?;
        Ok(token)
    }

    /// POST to one of the token endpoints, which live outside the API prefix
    async fn token_call(&self, route: &str, body: Value) -> Result<String, ApiError> {
        let url = format!("{}{}", self.base_url, route);
        let response = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ApiError::ServerUnavailable
                } else {
                    ApiError::Transport(e)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let text = response.text().await.map_err(ApiError::Transport)?;
            let parsed: TokenResponse =
                serde_json::from_str(&text).map_err(|source| ApiError::Decode {
                    route: route.to_string(),
                    source,
                })?;
            return Ok(parsed.token);
        }

        match status.as_u16() {
            400 | 401 | 403 => {
                let body = response.json::<Value>().await.unwrap_or(Value::Null);
                Err(ApiError::Validation(ValidationErrors::from_value(&body)))
            }
            _ => Err(ApiError::Authentication(
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string(),
            )),
        }
    }
}
