use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::{Error, Result};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the `reqwest::Client` shared by the external-service clients.
pub fn build_http_client(request_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("talkback/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10));

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    builder
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))
}

/// Map a failed request to the job error taxonomy.
///
/// Every transport failure and non-success status is transient: the only
/// retry is the whole-job retry, so an upstream outage must not fail jobs
/// permanently on the first attempt.
pub fn request_error(service: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::transient(format!("{} request timed out", service))
    } else if err.is_connect() {
        Error::transient(format!("{} connection failed: {}", service, err))
    } else {
        Error::transient(format!("{} request failed: {}", service, err))
    }
}

/// Turn a non-success HTTP status into an error, keeping a short body excerpt.
pub fn status_error(service: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let excerpt: String = body.chars().take(200).collect();
    Error::transient(format!(
        "{} returned HTTP {}: {}",
        service,
        status.as_u16(),
        excerpt.trim()
    ))
}
