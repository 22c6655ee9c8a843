use crate::payments::error::{ProviderError, ProviderResult};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Thin reqwest wrapper shared by provider adapters. It never retries on its
/// own: the router decides whether a transport failure is replayed with the
/// same reference token.
#[derive(Clone)]
pub struct ProviderHttpClient {
    client: Client,
    provider: String,
    timeout: Duration,
}

impl ProviderHttpClient {
    pub fn new(provider: impl Into<String>, timeout: Duration) -> ProviderResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ProviderError::Configuration {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            provider: provider.into(),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST a pre-serialized body. Providers that sign the exact bytes they
    /// send go through here.
    pub async fn post_bytes<T: DeserializeOwned>(
        &self,
        url: &str,
        body: Vec<u8>,
        additional_headers: &[(&str, &str)],
    ) -> ProviderResult<T> {
        let mut request = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json");
        for (k, v) in additional_headers {
            request = request.header(*k, *v);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    provider: self.provider.clone(),
                    timeout_secs: self.timeout.as_secs(),
                }
            } else {
                ProviderError::Transport {
                    provider: self.provider.clone(),
                    message: format!("provider request failed: {}", e),
                }
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport {
                provider: self.provider.clone(),
                message: format!("failed to read provider response: {}", e),
            })?;

        // Some upstreams answer business errors with 4xx and a normal RC body.
        match serde_json::from_str::<T>(&text) {
            Ok(parsed) => Ok(parsed),
            Err(e) if status.is_server_error() => {
                warn!(
                    provider = %self.provider,
                    status = %status,
                    "provider server error without a parseable body"
                );
                Err(ProviderError::Transport {
                    provider: self.provider.clone(),
                    message: format!("HTTP {}: {}", status, e),
                })
            }
            Err(e) => Err(ProviderError::InvalidResponse {
                provider: self.provider.clone(),
                message: format!("HTTP {}: invalid provider JSON response: {}", status, e),
            }),
        }
    }

    pub async fn post_json<T: DeserializeOwned, B: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        additional_headers: &[(&str, &str)],
    ) -> ProviderResult<T> {
        let bytes = serde_json::to_vec(body).map_err(|e| ProviderError::InvalidResponse {
            provider: self.provider.clone(),
            message: format!("failed to encode request: {}", e),
        })?;
        self.post_bytes(url, bytes, additional_headers).await
    }
}

pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Accepts both `sha256=<hex>` and a bare hex digest.
pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let computed = hmac_sha256_hex(secret, payload);
    !computed.is_empty() && secure_eq(computed.as_bytes(), signature.as_bytes())
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn hmac_sha256_matches_known_vector() {
        // RFC 4231 test case 2
        let digest = hmac_sha256_hex("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            digest,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verification_accepts_prefixed_and_bare_signatures() {
        let payload = br#"{"event":"transaction.success"}"#;
        let digest = hmac_sha256_hex("secret", payload);

        assert!(verify_hmac_sha256_hex(payload, "secret", &digest));
        assert!(verify_hmac_sha256_hex(
            payload,
            "secret",
            &format!("sha256={}", digest)
        ));
        assert!(!verify_hmac_sha256_hex(payload, "other", &digest));
        assert!(!verify_hmac_sha256_hex(payload, "secret", "not-a-signature"));
    }

    #[tokio::test]
    async fn business_errors_with_4xx_are_still_parsed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/transaction")
            .with_status(400)
            .with_body(r#"{"data":{"rc":"41","message":"Signature tidak valid"}}"#)
            .create_async()
            .await;

        let client = ProviderHttpClient::new("digiflazz", Duration::from_secs(5)).unwrap();
        let body: JsonValue = client
            .post_json(
                &format!("{}/v1/transaction", server.url()),
                &serde_json::json!({}),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(body["data"]["rc"], "41");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unparseable_5xx_is_a_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/transaction")
            .with_status(502)
            .with_body("<html>Bad Gateway</html>")
            .create_async()
            .await;

        let client = ProviderHttpClient::new("digiflazz", Duration::from_secs(5)).unwrap();
        let err = client
            .post_json::<JsonValue, _>(
                &format!("{}/v1/transaction", server.url()),
                &serde_json::json!({}),
                &[],
            )
            .await
            .unwrap_err();

        assert!(err.is_transport());
    }
}
