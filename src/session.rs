use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::naming;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Login form values for the single sign-on endpoint.
#[derive(Clone)]
pub struct Credentials {
    pub auth_url: Url,
    pub username: String,
    pub password: String,
    /// Hidden `execution` field of the login form; selects the Moodle instance.
    pub execution: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_url", &self.auth_url.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn content_disposition_filename(&self) -> Option<String> {
        self.headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(naming::parse_content_disposition)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turns a non-200 response into [`MirrorError::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(MirrorError::HttpStatus {
                url: self.url.to_string(),
                status: self.status.as_u16(),
            }
            .into())
        }
    }
}

/// One authenticated Moodle session. Read-only after login, so a single
/// instance is shared by reference across every concurrent request.
#[derive(Clone)]
pub struct Session {
    client: Client,
    fetch_retries: u32,
}

impl Session {
    fn build_http_client(config: &MirrorConfig) -> Result<Client> {
        let client = ClientBuilder::new()
            .use_rustls_tls()
            .cookie_store(true)
            .user_agent(concat!("course-mirror/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(client)
    }

    /// A session without logging in, for sites that serve courses to guests.
    pub fn anonymous(config: &MirrorConfig) -> Result<Self> {
        Ok(Self {
            client: Self::build_http_client(config)?,
            fetch_retries: config.fetch_retries,
        })
    }

    /// Posts the login form once; the resulting cookies stay in the client's jar.
    pub async fn login(config: &MirrorConfig, credentials: &Credentials) -> Result<Self> {
        let session = Self::anonymous(config)?;

        let form = [
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
            ("execution", credentials.execution.as_str()),
            ("_eventId", "submit"),
        ];

        let response = session
            .client
            .post(credentials.auth_url.clone())
            .form(&form)
            .send()
            .await
            .with_context(|| format!("Login request to {} failed", credentials.auth_url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::HttpStatus {
                url: credentials.auth_url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }

        info!(user = %credentials.username, "Logged in");
        Ok(session)
    }

    /// GETs `url` with optional query pairs and buffers the whole body.
    ///
    /// Connection failures are retried a few times; timeouts and HTTP error
    /// statuses are returned to the caller untouched.
    pub async fn get(&self, url: &Url, query: &[(&str, &str)]) -> Result<FetchedResponse> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url.clone());
            if !query.is_empty() {
                request = request.query(query);
            }

            match request.send().await {
                Ok(response) => {
                    let final_url = response.url().clone();
                    let status = response.status();
                    let headers = response.headers().clone();
                    let body = response
                        .bytes()
                        .await
                        .with_context(|| format!("Failed to read response body from {}", final_url))?;

                    debug!(url = %final_url, status = status.as_u16(), bytes = body.len(), "Fetched");
                    return Ok(FetchedResponse {
                        url: final_url,
                        status,
                        headers,
                        body: body.to_vec(),
                    });
                }
                Err(e) if e.is_connect() && attempt < self.fetch_retries => {
                    attempt += 1;
                    warn!(url = %url, attempt, error = %e, "Connection failed, retrying");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!("Request to {} failed", url)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn response(status: u16, headers: &[(reqwest::header::HeaderName, &str)]) -> FetchedResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        FetchedResponse {
            url: Url::parse("https://moodle.example.ac.uk/pluginfile.php/1/a").unwrap(),
            status: StatusCode::from_u16(status).unwrap(),
            headers: map,
            body: b"body".to_vec(),
        }
    }

    #[test]
    fn test_header_accessors() {
        let resp = response(
            200,
            &[
                (CONTENT_TYPE, "application/pdf"),
                (CONTENT_DISPOSITION, "inline; filename=\"lecture 1.pdf\""),
            ],
        );
        assert_eq!(resp.content_type(), Some("application/pdf"));
        assert_eq!(resp.content_disposition_filename().as_deref(), Some("lecture 1.pdf"));
        assert_eq!(resp.text(), "body");
    }

    #[test]
    fn test_error_for_status() {
        assert!(response(200, &[]).error_for_status().is_ok());

        let err = response(404, &[]).error_for_status().unwrap_err();
        match err.downcast_ref::<MirrorError>() {
            Some(MirrorError::HttpStatus { status, .. }) => assert_eq!(*status, 404),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            auth_url: Url::parse("https://auth.example.ac.uk/login").unwrap(),
            username: "student".to_string(),
            password: "hunter2".to_string(),
            execution: "e1s1".to_string(),
        };
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("student"));
        assert!(!printed.contains("hunter2"));
    }
}
