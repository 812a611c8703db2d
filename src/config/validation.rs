//! Configuration validation logic.

use url::Url;

use crate::config::schema::ProxyConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a ProxyConfig for semantic correctness.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listen_addr.is_empty() {
        errors.push(ValidationError("listen_addr must be set".to_string()));
    }

    match Url::parse(&config.backend) {
        Ok(url) => {
            // The backend dialer speaks plain TCP (or a unix socket); a TLS
            // backend indicates a misdirected deployment.
            if url.scheme() == "https" {
                errors.push(ValidationError(
                    "TLS is not supported for backend connections".to_string(),
                ));
            }
            if url.host_str().is_none() && config.backend_socket.is_none() {
                errors.push(ValidationError(format!(
                    "backend URL '{}' has no host and no backend_socket is set",
                    config.backend
                )));
            }
        }
        Err(e) => errors.push(ValidationError(format!(
            "backend URL '{}' does not parse: {}",
            config.backend, e
        ))),
    }

    if config.api_queue.limit > 0 && config.api_queue.queue_timeout_secs == 0 {
        errors.push(ValidationError(
            "api_queue.queue_timeout_secs must be > 0 when queueing is enabled".to_string(),
        ));
    }

    if config.senddata.header.is_empty() {
        errors.push(ValidationError("senddata.header must be set".to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
