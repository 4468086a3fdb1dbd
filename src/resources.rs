//! Resource-oriented API mapping.
//!
//! One method per protocol operation. Each declares its target (a named
//! directory resource or an explicit URL), the set of acceptable status
//! codes, and whether key-ID signing is required; responses outside the
//! accepted set fail with the server-supplied problem detail.

use parking_lot::RwLock;
use serde::Serialize;

use crate::{
    api,
    dir::Resource,
    error::{Error, Result},
    req::{problem_from_response, req_expect_header},
    trans::Transport,
};

enum Target<'a> {
    Resource(Resource),
    Url(&'a str),
}

/// Signing context for one account key: transport plus the account URL used
/// as key ID. Replaced wholesale on key rollover, never mutated piecemeal.
#[derive(Debug)]
pub(crate) struct ResourceApi {
    transport: Transport,
    account_url: RwLock<Option<String>>,
}

impl ResourceApi {
    pub(crate) fn new(transport: Transport, account_url: Option<String>) -> Self {
        ResourceApi {
            transport,
            account_url: RwLock::new(account_url),
        }
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The server-assigned account URL (key ID).
    pub(crate) fn account_url(&self) -> Result<String> {
        self.account_url.read().clone().ok_or_else(|| {
            Error::Protocol("no account URL known; create or locate an account first".to_owned())
        })
    }

    fn set_account_url(&self, url: String) {
        *self.account_url.write() = Some(url);
    }

    async fn request<T>(
        &self,
        target: Target<'_>,
        payload: &T,
        allowed: &[u16],
        key_id_mode: bool,
    ) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        let url = match target {
            Target::Url(url) => url.to_owned(),
            Target::Resource(resource) => self.transport.directory().url_of(resource).await?,
        };

        let res = if key_id_mode {
            let kid = self.account_url()?;
            self.transport.call_kid(&kid, &url, payload).await?
        } else {
            self.transport.call_jwk(&url, payload).await?
        };

        let status = res.status().as_u16();
        if allowed.contains(&status) {
            Ok(res)
        } else {
            Err(Error::Api(problem_from_response(res).await))
        }
    }

    /// Create a new account, or fetch the existing one for this key.
    ///
    /// 201 means created, 200 means the key was already registered; either
    /// way the server-issued account URL from the `Location` header becomes
    /// the key ID for all subsequent requests.
    pub(crate) async fn create_account(&self, account: &api::Account) -> Result<reqwest::Response> {
        let res = self
            .request(
                Target::Resource(Resource::NewAccount),
                account,
                &[200, 201],
                false,
            )
            .await?;

        let kid = req_expect_header(&res, "location").map_err(|_| {
            Error::Protocol("newAccount response carries no Location header".to_owned())
        })?;
        log::debug!("account key ID: {kid}");
        self.set_account_url(kid);

        Ok(res)
    }

    /// Signed POST to the account URL (update, deactivate, POST-as-GET).
    pub(crate) async fn update_account<T>(&self, payload: &T) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        let url = self.account_url()?;
        self.request(Target::Url(&url), payload, &[200, 202], true)
            .await
    }

    /// Submit a key-rollover envelope (the inner JWS signed by the new key).
    pub(crate) async fn key_change(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        self.request(Target::Resource(Resource::KeyChange), body, &[200], true)
            .await
    }

    pub(crate) async fn new_order(
        &self,
        payload: &api::NewOrderPayload,
    ) -> Result<reqwest::Response> {
        self.request(Target::Resource(Resource::NewOrder), payload, &[201], true)
            .await
    }

    pub(crate) async fn finalize_order(
        &self,
        finalize_url: &str,
        payload: &api::Finalize,
    ) -> Result<reqwest::Response> {
        self.request(Target::Url(finalize_url), payload, &[200], true)
            .await
    }

    /// Idempotent read of any resource object (POST-as-GET).
    pub(crate) async fn post_as_get(&self, url: &str) -> Result<reqwest::Response> {
        self.request(Target::Url(url), &api::EmptyString, &[200], true)
            .await
    }

    pub(crate) async fn update_authorization<T>(
        &self,
        authz_url: &str,
        payload: &T,
    ) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        self.request(Target::Url(authz_url), payload, &[200], true)
            .await
    }

    /// Notify the server to begin validating a challenge.
    pub(crate) async fn complete_challenge(
        &self,
        challenge_url: &str,
    ) -> Result<reqwest::Response> {
        self.request(Target::Url(challenge_url), &api::EmptyObject, &[200], true)
            .await
    }

    pub(crate) async fn revoke_cert(&self, payload: &api::Revocation) -> Result<reqwest::Response> {
        self.request(Target::Resource(Resource::RevokeCert), payload, &[200], true)
            .await
    }
}
