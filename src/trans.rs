use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    dir::{Resource, ResourceDirectory},
    error::{Error, Result},
    jws::{sign_jws, Jwk, ProtectedHeader},
    key::AccountKey,
    req::{req_expect_header, req_handle_error, req_head, req_post},
};

/// Maximum number of send attempts when the server keeps rejecting nonces.
const MAX_BAD_NONCE_ATTEMPTS: usize = 5;

/// How the protected header authenticates a request.
#[derive(Clone, Copy)]
enum SigningMode<'a> {
    /// Embedded public key; only for newAccount and the pre-account
    /// "does this key exist" query.
    Jwk,
    /// Account URL as key ID; everything after account setup.
    KeyId(&'a str),
}

/// Signed request transport.
///
/// Produces the signed envelope for a target URL and JSON payload, manages
/// the anti-replay nonce, and transparently retries requests the server
/// rejected with `badNonce`. Holds no state beyond the nonce pool; the
/// key ID is passed per call by the resource layer.
#[derive(Debug, Clone)]
pub(crate) struct Transport {
    http: reqwest::Client,
    directory: Arc<ResourceDirectory>,
    nonce_pool: Arc<NoncePool>,
    account_key: AccountKey,
}

impl Transport {
    pub(crate) fn new(
        http: reqwest::Client,
        directory: Arc<ResourceDirectory>,
        account_key: AccountKey,
    ) -> Self {
        Transport {
            http,
            directory,
            nonce_pool: Arc::new(NoncePool::default()),
            account_key,
        }
    }

    pub(crate) fn account_key(&self) -> &AccountKey {
        &self.account_key
    }

    pub(crate) fn directory(&self) -> &Arc<ResourceDirectory> {
        &self.directory
    }

    /// Signed call with the public key embedded in the header.
    pub(crate) async fn call_jwk<T>(&self, url: &str, body: &T) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, SigningMode::Jwk).await
    }

    /// Signed call authenticated by account URL.
    pub(crate) async fn call_kid<T>(
        &self,
        kid: &str,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, SigningMode::KeyId(kid)).await
    }

    async fn do_call<T>(
        &self,
        url: &str,
        body: &T,
        mode: SigningMode<'_>,
    ) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        // Nonce carried on a badNonce rejection, preferred over the pool for
        // the resubmission. Using it directly keeps every nonce single-use.
        let mut retry_nonce: Option<String> = None;

        for attempt in 1..=MAX_BAD_NONCE_ATTEMPTS {
            let nonce = match retry_nonce.take() {
                Some(nonce) => nonce,
                None => self.nonce_pool.get_nonce(&self.http, &self.directory).await?,
            };

            let protected = match mode {
                SigningMode::Jwk => {
                    ProtectedHeader::jwk_mode(Jwk::try_from(&self.account_key)?, url, nonce)
                }
                SigningMode::KeyId(kid) => ProtectedHeader::kid_mode(kid, url, nonce),
            };

            let body = sign_jws(protected, &self.account_key, body)?.to_json()?;

            log::debug!("call endpoint: {url}");
            let response = req_post(&self.http, url, body).await?;

            // Regardless of the request being a success or not, there might
            // be a fresh nonce in the response.
            let header_nonce = response
                .headers()
                .get("replay-nonce")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_owned());

            match req_handle_error(response).await {
                Ok(res) => {
                    if let Some(nonce) = header_nonce {
                        self.nonce_pool.add(nonce);
                    }
                    return Ok(res);
                }

                Err(problem) if problem.is_bad_nonce() => {
                    if attempt == MAX_BAD_NONCE_ATTEMPTS {
                        return Err(Error::Nonce(format!(
                            "bad-nonce retries exhausted after {MAX_BAD_NONCE_ATTEMPTS} attempts: {problem}"
                        )));
                    }

                    log::debug!("retrying on bad nonce (attempt {attempt})");
                    retry_nonce = header_nonce;
                }

                Err(problem) => {
                    if let Some(nonce) = header_nonce {
                        self.nonce_pool.add(nonce);
                    }
                    return Err(Error::Api(problem));
                }
            }
        }

        unreachable!("bad-nonce retry loop returns within the attempt bound")
    }
}

/// Shared pool of unused nonces, harvested from response headers.
#[derive(Debug, Default)]
pub(crate) struct NoncePool {
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    fn add(&self, nonce: String) {
        let mut pool = self.pool.lock();
        pool.push_back(nonce);

        if pool.len() > 10 {
            pool.pop_front();
        }
    }

    /// Pops a pooled nonce, or fetches a fresh one from the newNonce
    /// resource.
    async fn get_nonce(
        &self,
        http: &reqwest::Client,
        directory: &ResourceDirectory,
    ) -> Result<String> {
        {
            let mut pool = self.pool.lock();

            if let Some(nonce) = pool.pop_front() {
                log::trace!("using pooled nonce");
                return Ok(nonce);
            }
        }

        let url = directory.url_of(Resource::NewNonce).await?;

        log::debug!("requesting fresh nonce");
        let res = req_head(http, &url).await?;

        req_expect_header(&res, "replay-nonce")
            .map_err(|_| Error::Nonce("newNonce response carries no replay-nonce header".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{with_scenario, Scenario};

    fn transport_for(server: &crate::test::TestServer) -> Transport {
        let http = reqwest::Client::new();
        let directory = Arc::new(ResourceDirectory::new(http.clone(), &server.dir_url));
        Transport::new(http, directory, AccountKey::generate())
    }

    #[tokio::test]
    async fn recovers_from_bad_nonce_rejections() {
        let server = with_scenario(Scenario {
            bad_nonces: 2,
            ..Scenario::default()
        });

        let transport = transport_for(&server);
        let url = server.url("/acme/new-order");

        let res = transport
            .call_kid(
                &server.url("/acme/acct/7728515"),
                &url,
                &crate::api::EmptyObject,
            )
            .await
            .unwrap();

        assert!(res.status().is_success());
        // two rejected sends plus the successful resubmission
        assert_eq!(server.state.new_order_posts(), 3);
    }

    #[tokio::test]
    async fn gives_up_when_bad_nonce_retries_are_exhausted() {
        let server = with_scenario(Scenario {
            bad_nonces: usize::MAX,
            ..Scenario::default()
        });

        let transport = transport_for(&server);
        let url = server.url("/acme/new-order");

        let err = transport
            .call_kid(
                &server.url("/acme/acct/7728515"),
                &url,
                &crate::api::EmptyObject,
            )
            .await
            .unwrap_err();

        match err {
            Error::Nonce(_) => {}
            other => panic!("expected Error::Nonce, got {other:?}"),
        }
        assert_eq!(server.state.new_order_posts(), MAX_BAD_NONCE_ATTEMPTS);
    }

    #[tokio::test]
    async fn non_nonce_errors_surface_as_api_errors() {
        let server = with_scenario(Scenario::default());

        let transport = transport_for(&server);
        let url = server.url("/acme/no-such-resource");

        let err = transport
            .call_kid(
                &server.url("/acme/acct/7728515"),
                &url,
                &crate::api::EmptyObject,
            )
            .await
            .unwrap_err();

        match err {
            Error::Api(_) => {}
            other => panic!("expected Error::Api, got {other:?}"),
        }
    }
}
