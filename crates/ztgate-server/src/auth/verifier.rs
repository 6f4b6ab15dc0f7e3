//! Credential verification.
//!
//! Every flow is verified from scratch; nothing is cached between calls.
//! Signature, expiry and audience checks belong to the external validation
//! service behind [`TokenValidator`]. Anything other than a clear answer
//! from it (timeout, transport error, unexpected status) is a hard deny.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use ztgate_core::{AuthError, Credential, Identity};

/// Longest credential accepted before contacting the validator.
const MAX_CREDENTIAL_LEN: usize = 8192;

/// The external token-validation collaborator.
pub trait TokenValidator: Send + Sync {
    fn validate<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<Identity, AuthError>> + Send + 'a>>;
}

/// Request body sent to the validation endpoint.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ValidateRequest<'a> {
    Token { token: &'a str },
    Certificate { certificate: &'a str },
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Validator that POSTs credentials to the management service.
pub struct HttpTokenValidator {
    url: String,
    service_token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpTokenValidator {
    pub fn new(url: String, service_token: Option<String>, timeout: Duration) -> Self {
        Self {
            url,
            service_token,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn call(&self, credential: &Credential) -> Result<Identity, AuthError> {
        let body = match credential {
            Credential::Bearer(token) => ValidateRequest::Token { token },
            Credential::PeerCertificate(fp) => ValidateRequest::Certificate { certificate: fp },
        };

        let mut req = self.http_client.post(&self.url).json(&body);
        if let Some(ref token) = self.service_token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| AuthError::VerifierUnavailable(format!("request failed: {e}")))?;
        let status = response.status();

        if status.is_success() {
            let parsed: ValidateResponse = response
                .json()
                .await
                .map_err(|e| AuthError::VerifierUnavailable(format!("bad response: {e}")))?;
            return match parsed.identity {
                Some(id) if !id.trim().is_empty() => Ok(Identity::new(id)),
                _ => Err(AuthError::VerifierUnavailable("response carried no identity".into())),
            };
        }

        match status.as_u16() {
            400 => Err(AuthError::MalformedCredential),
            401 | 403 => {
                let reason = response
                    .json::<ValidateResponse>()
                    .await
                    .ok()
                    .and_then(|r| r.error)
                    .unwrap_or_default();
                Err(classify_rejection(&reason))
            }
            code => Err(AuthError::VerifierUnavailable(format!("status {code}"))),
        }
    }
}

impl TokenValidator for HttpTokenValidator {
    fn validate<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<Identity, AuthError>> + Send + 'a>> {
        Box::pin(self.call(credential))
    }
}

/// Map the validator's rejection reason onto the error taxonomy.
fn classify_rejection(reason: &str) -> AuthError {
    let reason = reason.to_ascii_lowercase();
    if reason.contains("expired") {
        AuthError::ExpiredCredential
    } else if reason.contains("revoked") {
        AuthError::RevokedCredential
    } else {
        AuthError::MalformedCredential
    }
}

/// Resolves credentials to identities, one call per flow.
#[derive(Clone)]
pub struct IdentityVerifier {
    validator: Arc<dyn TokenValidator>,
    timeout: Duration,
}

impl IdentityVerifier {
    pub fn new(validator: Arc<dyn TokenValidator>, timeout: Duration) -> Self {
        Self { validator, timeout }
    }

    pub async fn verify(&self, credential: &Credential) -> Result<Identity, AuthError> {
        check_shape(credential)?;

        match tokio::time::timeout(self.timeout, self.validator.validate(credential)).await {
            Ok(Ok(identity)) => {
                debug!(
                    credential = %credential.fingerprint(),
                    identity = %identity,
                    "credential verified"
                );
                Ok(identity)
            }
            Ok(Err(e)) => {
                debug!(credential = %credential.fingerprint(), error = %e, "credential rejected");
                Err(e)
            }
            Err(_) => {
                warn!(credential = %credential.fingerprint(), "token validation timed out");
                Err(AuthError::VerifierUnavailable("timeout".into()))
            }
        }
    }
}

/// Cheap syntactic checks that never need the validator.
fn check_shape(credential: &Credential) -> Result<(), AuthError> {
    let value = credential.secret();
    if value.is_empty() || value.len() > MAX_CREDENTIAL_LEN {
        return Err(AuthError::MalformedCredential);
    }
    let ok = match credential {
        Credential::Bearer(t) => t.bytes().all(|b| b.is_ascii_graphic()),
        Credential::PeerCertificate(fp) => fp.chars().all(|c| c.is_ascii_hexdigit() || c == ':'),
    };
    if ok {
        Ok(())
    } else {
        Err(AuthError::MalformedCredential)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process validator: maps tokens to outcomes and counts calls.
    #[derive(Default)]
    pub(crate) struct FakeValidator {
        pub outcomes: HashMap<String, Result<String, AuthError>>,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
    }

    impl FakeValidator {
        pub(crate) fn with(entries: &[(&str, Result<&str, AuthError>)]) -> Self {
            Self {
                outcomes: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone().map(str::to_string)))
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl TokenValidator for FakeValidator {
        fn validate<'a>(
            &'a self,
            credential: &'a Credential,
        ) -> Pin<Box<dyn Future<Output = Result<Identity, AuthError>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(d) = self.delay {
                    tokio::time::sleep(d).await;
                }
                match self.outcomes.get(credential.secret()) {
                    Some(Ok(id)) => Ok(Identity::new(id.clone())),
                    Some(Err(e)) => Err(e.clone()),
                    None => Err(AuthError::MalformedCredential),
                }
            })
        }
    }

    fn verifier(fake: FakeValidator) -> (IdentityVerifier, Arc<FakeValidator>) {
        let fake = Arc::new(fake);
        (IdentityVerifier::new(fake.clone(), Duration::from_millis(200)), fake)
    }

    #[tokio::test]
    async fn resolves_identity() {
        let (v, _) = verifier(FakeValidator::with(&[("good", Ok("u1"))]));
        let id = v.verify(&Credential::Bearer("good".into())).await.unwrap();
        assert_eq!(id.id(), "u1");
    }

    #[tokio::test]
    async fn propagates_rejections() {
        let (v, _) = verifier(FakeValidator::with(&[
            ("old", Err(AuthError::ExpiredCredential)),
            ("gone", Err(AuthError::RevokedCredential)),
        ]));
        assert_eq!(
            v.verify(&Credential::Bearer("old".into())).await,
            Err(AuthError::ExpiredCredential)
        );
        assert_eq!(
            v.verify(&Credential::Bearer("gone".into())).await,
            Err(AuthError::RevokedCredential)
        );
    }

    #[tokio::test]
    async fn malformed_never_reaches_validator() {
        let (v, fake) = verifier(FakeValidator::default());
        for bad in ["", "has space", "tab\there"] {
            assert_eq!(
                v.verify(&Credential::Bearer(bad.into())).await,
                Err(AuthError::MalformedCredential)
            );
        }
        assert_eq!(
            v.verify(&Credential::PeerCertificate("zz:11".into())).await,
            Err(AuthError::MalformedCredential)
        );
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_validator_is_unavailable() {
        let mut fake = FakeValidator::with(&[("good", Ok("u1"))]);
        fake.delay = Some(Duration::from_secs(5));
        let (v, _) = verifier(fake);
        let err = v.verify(&Credential::Bearer("good".into())).await.unwrap_err();
        assert!(matches!(err, AuthError::VerifierUnavailable(_)));
    }

    #[tokio::test]
    async fn every_call_reverifies() {
        let (v, fake) = verifier(FakeValidator::with(&[("good", Ok("u1"))]));
        let cred = Credential::Bearer("good".into());
        v.verify(&cred).await.unwrap();
        v.verify(&cred).await.unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_http_validator_fails_closed() {
        // Nothing listens on this port; the connection is refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let http = HttpTokenValidator::new(
            format!("http://127.0.0.1:{port}/validate"),
            None,
            Duration::from_secs(1),
        );
        let v = IdentityVerifier::new(Arc::new(http), Duration::from_secs(2));
        let err = v.verify(&Credential::Bearer("tok".into())).await.unwrap_err();
        assert!(matches!(err, AuthError::VerifierUnavailable(_)));
    }

    #[test]
    fn rejection_reasons() {
        assert_eq!(classify_rejection("token_expired"), AuthError::ExpiredCredential);
        assert_eq!(classify_rejection("Revoked"), AuthError::RevokedCredential);
        assert_eq!(classify_rejection(""), AuthError::MalformedCredential);
    }
}
