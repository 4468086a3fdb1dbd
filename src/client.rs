//! Account-scoped protocol orchestration.

use std::sync::Arc;

use parking_lot::RwLock;
use x509_cert::{der::Encode as _, request::CertReq};

use crate::{
    api::{self, PollTarget},
    cert::Certificate,
    dir::{DirectoryUrl, Resource, ResourceDirectory},
    error::{Error, Result},
    jws::{sign_jws, ExternalAccountBinding, Jwk, ProtectedHeader},
    key::AccountKey,
    resources::ResourceApi,
    retry::{retry, BackoffConfig},
    trans::Transport,
    util::{base64url, parse_link_header},
    verify::ChallengeVerifier,
};

/// Parameters for [`AcmeClient::create_account`].
#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    /// Contact URIs, e.g. `mailto:admin@example.com`.
    pub contact: Vec<String>,

    /// Agreement to the CA's terms of service; most CAs refuse accounts
    /// without it.
    pub terms_of_service_agreed: bool,

    /// Look up the account for this key instead of creating one; the server
    /// answers `accountDoesNotExist` if the key is unknown.
    pub only_return_existing: bool,
}

/// Enumeration of reasons for revocation.
///
/// The reason codes are taken from [RFC 5280 §5.3.1].
///
/// [RFC 5280 §5.3.1]: https://tools.ietf.org/html/rfc5280#section-5.3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified = 0,
    KeyCompromise = 1,
    CACompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    // value 7 is not used
    RemoveFromCRL = 8,
    PrivilegeWithdrawn = 9,
    AACompromise = 10,
}

/// Builder for [`AcmeClient`].
pub struct AcmeClientBuilder {
    directory_url: String,
    account_key: Option<AccountKey>,
    account_url: Option<String>,
    backoff: BackoffConfig,
    eab: Option<ExternalAccountBinding>,
    http: Option<reqwest::Client>,
    http_challenge_port: u16,
}

impl AcmeClientBuilder {
    /// Use a previously saved account key instead of generating a fresh one.
    pub fn account_key(mut self, key: AccountKey) -> Self {
        self.account_key = Some(key);
        self
    }

    /// Use a previously saved account URL (key ID), skipping the newAccount
    /// round trip on the first key-ID request.
    pub fn account_url(mut self, url: impl Into<String>) -> Self {
        self.account_url = Some(url.into());
        self
    }

    /// Retry schedule for polling and challenge pre-flight.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// External account binding material, for CAs that require it.
    pub fn external_account_binding(mut self, eab: ExternalAccountBinding) -> Self {
        self.eab = Some(eab);
        self
    }

    /// Replace the HTTP client, e.g. to configure proxies or timeouts.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Port to contact during `http-01` pre-flight checks. Defaults to 80.
    pub fn http_challenge_port(mut self, port: u16) -> Self {
        self.http_challenge_port = port;
        self
    }

    pub fn build(self) -> Result<AcmeClient> {
        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder().build()?,
        };

        let directory = Arc::new(ResourceDirectory::new(http.clone(), &self.directory_url));

        let account_key = self.account_key.unwrap_or_else(AccountKey::generate);
        let transport = Transport::new(http.clone(), Arc::clone(&directory), account_key);
        let resources = ResourceApi::new(transport, self.account_url);

        let verifier = ChallengeVerifier::new(http.clone(), self.http_challenge_port)?;

        Ok(AcmeClient {
            http,
            directory,
            resources: RwLock::new(Arc::new(resources)),
            backoff: self.backoff,
            verifier,
            eab: self.eab,
        })
    }
}

/// Client for one directory and one account key.
///
/// All certificate lifecycle operations hang off this type; the lower layers
/// (signing transport, nonce handling, resource URL lookup) are internal.
pub struct AcmeClient {
    http: reqwest::Client,
    directory: Arc<ResourceDirectory>,
    resources: RwLock<Arc<ResourceApi>>,
    backoff: BackoffConfig,
    verifier: ChallengeVerifier,
    eab: Option<ExternalAccountBinding>,
}

impl AcmeClient {
    pub fn builder(directory_url: DirectoryUrl<'_>) -> AcmeClientBuilder {
        AcmeClientBuilder {
            directory_url: directory_url.to_url().to_owned(),
            account_key: None,
            account_url: None,
            backoff: BackoffConfig::default(),
            eab: None,
            http: None,
            http_challenge_port: 80,
        }
    }

    fn resources(&self) -> Arc<ResourceApi> {
        Arc::clone(&self.resources.read())
    }

    /// The current account key, e.g. for persisting across runs.
    pub fn account_key(&self) -> AccountKey {
        self.resources().transport().account_key().clone()
    }

    /// The account URL (key ID), once known.
    pub fn account_url(&self) -> Result<String> {
        self.resources().account_url()
    }

    /// URL of the CA's current terms of service, if it publishes one.
    pub async fn terms_of_service_url(&self) -> Result<Option<String>> {
        self.directory.terms_of_service_url().await
    }

    /// Register an account for this key, or resume the existing one.
    ///
    /// The operation is idempotent: a 200 response means the key was already
    /// registered and the existing account is returned unchanged.
    pub async fn create_account(&self, new_account: &NewAccount) -> Result<api::Account> {
        let resources = self.resources();

        let external_account_binding = match &self.eab {
            Some(eab) => {
                let url = self.directory.url_of(Resource::NewAccount).await?;
                let envelope = eab.sign(resources.transport().account_key(), &url)?;
                Some(envelope.to_value()?)
            }
            None => None,
        };

        let payload = api::Account {
            contact: (!new_account.contact.is_empty()).then(|| new_account.contact.clone()),
            terms_of_service_agreed: Some(new_account.terms_of_service_agreed),
            only_return_existing: new_account.only_return_existing.then_some(true),
            external_account_binding,
            ..Default::default()
        };

        let res = resources.create_account(&payload).await?;
        if res.status().as_u16() == 200 {
            log::debug!("account key already registered; resuming existing account");
        }

        Ok(res.json().await?)
    }

    /// Fetch the current account object.
    pub async fn fetch_account(&self) -> Result<api::Account> {
        let res = self.resources().update_account(&api::EmptyString).await?;
        Ok(res.json().await?)
    }

    /// Update mutable account fields, e.g. the contact list.
    pub async fn update_account(&self, account: &api::Account) -> Result<api::Account> {
        let res = self.resources().update_account(account).await?;
        Ok(res.json().await?)
    }

    /// Permanently deactivate the account. There is no undo.
    pub async fn deactivate_account(&self) -> Result<api::Account> {
        let payload = serde_json::json!({ "status": "deactivated" });
        let res = self.resources().update_account(&payload).await?;
        Ok(res.json().await?)
    }

    /// Roll the account over to `new_key`.
    ///
    /// Sends the doubly signed key-change envelope (inner JWS by the new key
    /// over the old key's JWK, outer by the old key) and, only once the
    /// server accepts it, swaps the signing context so subsequent requests
    /// use the new key. A rejected rollover leaves the client on the old key.
    pub async fn update_account_key(&self, new_key: AccountKey) -> Result<()> {
        let resources = self.resources();
        let kid = resources.account_url()?;
        let key_change_url = self.directory.url_of(Resource::KeyChange).await?;

        let payload = api::KeyChange {
            account: kid.clone(),
            old_key: Jwk::try_from(resources.transport().account_key())?,
        };
        let inner = sign_jws(
            ProtectedHeader::inner_jwk_mode(Jwk::try_from(&new_key)?, &key_change_url),
            &new_key,
            &payload,
        )?;

        resources.key_change(&inner.to_value()?).await?;

        let transport = Transport::new(self.http.clone(), Arc::clone(&self.directory), new_key);
        *self.resources.write() = Arc::new(ResourceApi::new(transport, Some(kid)));

        log::info!("account key rolled over");
        Ok(())
    }

    /// Create an order for `domains`. Duplicates are dropped.
    pub async fn create_order(&self, domains: &[&str]) -> Result<api::Order> {
        let mut identifiers: Vec<api::Identifier> = vec![];
        for domain in domains {
            if !identifiers.iter().any(|id| id.value == *domain) {
                identifiers.push(api::Identifier::dns(domain));
            }
        }

        let payload = api::NewOrderPayload { identifiers };
        let res = self.resources().new_order(&payload).await?;

        let url = crate::req::req_expect_header(&res, "location").map_err(|_| {
            Error::Protocol("newOrder response carries no Location header".to_owned())
        })?;

        let mut order: api::Order = res.json().await?;
        order.url = url;
        Ok(order)
    }

    /// Fetch all authorizations of an order.
    pub async fn get_authorizations(&self, order: &api::Order) -> Result<Vec<api::Authorization>> {
        let resources = self.resources();
        let mut authorizations = Vec::with_capacity(order.authorizations.len());

        for url in &order.authorizations {
            let res = resources.post_as_get(url).await?;
            let mut authz: api::Authorization = res.json().await?;
            authz.url = url.clone();
            authorizations.push(authz);
        }

        Ok(authorizations)
    }

    /// Relinquish an authorization without completing it.
    pub async fn deactivate_authorization(
        &self,
        authz: &api::Authorization,
    ) -> Result<api::Authorization> {
        let payload = serde_json::json!({ "status": "deactivated" });
        let res = self
            .resources()
            .update_authorization(&authz.url, &payload)
            .await?;

        let mut authz_out: api::Authorization = res.json().await?;
        authz_out.url = authz.url.clone();
        Ok(authz_out)
    }

    /// The value the challenge response must publish, in the form the
    /// challenge type expects (`token.thumbprint` for `http-01`, its SHA-256
    /// digest for `dns-01`).
    pub fn key_authorization(&self, challenge: &api::Challenge) -> Result<String> {
        let resources = self.resources();
        crate::jws::key_authorization(
            &challenge.token,
            resources.transport().account_key(),
            challenge.kind()?,
        )
    }

    /// Check from here that the challenge response is in place, retrying on
    /// the configured backoff schedule. DNS propagation in particular can
    /// take a while.
    pub async fn verify_challenge(&self, identifier: &str, challenge: &api::Challenge) -> Result<()> {
        let kind = challenge.kind()?;
        let expected = self.key_authorization(challenge)?;

        retry(self.backoff, |_token| {
            self.verifier
                .verify(kind, identifier, &challenge.token, &expected)
        })
        .await
    }

    /// Tell the server the challenge response is ready for validation.
    pub async fn complete_challenge(&self, challenge: &api::Challenge) -> Result<api::Challenge> {
        let res = self.resources().complete_challenge(&challenge.url).await?;
        Ok(res.json().await?)
    }

    /// Poll `url` until the object reaches `valid`.
    ///
    /// A terminal `invalid` aborts the schedule immediately and surfaces the
    /// server's problem document; running out of attempts while the object is
    /// still in flight is a poll timeout.
    pub async fn wait_for_valid_status<T: PollTarget>(&self, url: &str) -> Result<T> {
        retry(self.backoff, |token| async move {
            let res = self.resources().post_as_get(url).await?;
            let mut item: T = res.json().await?;
            item.set_source_url(url);

            if item.is_valid() {
                return Ok(item);
            }

            if item.is_invalid() {
                token.abort();
                let problem = item.problem().cloned().unwrap_or_else(|| {
                    api::Problem::from_parts(
                        "urn:ietf:params:acme:error:serverInternal",
                        format!("{url} reached status invalid"),
                    )
                });
                return Err(Error::Aborted(problem));
            }

            Err(Error::PollTimeout(format!(
                "{url} has not reached a terminal status"
            )))
        })
        .await
    }

    /// Submit the CSR for a ready order.
    pub async fn finalize_order(&self, order: &api::Order, csr: &CertReq) -> Result<api::Order> {
        let payload = api::Finalize {
            csr: base64url(&csr.to_der()?),
        };

        let res = self
            .resources()
            .finalize_order(&order.finalize, &payload)
            .await?;

        // a server re-stating a different order URL on finalize is a bug on
        // one side or the other; refuse to continue on mismatched tracking
        if let Ok(url) = crate::req::req_expect_header(&res, "location") {
            if url != order.url {
                return Err(Error::Protocol(format!(
                    "finalize answered for order {url}, expected {}",
                    order.url,
                )));
            }
        }

        let mut order_out: api::Order = res.json().await?;
        order_out.url = order.url.clone();
        Ok(order_out)
    }

    /// Download the certificate for an order, polling it to `valid` first if
    /// needed.
    ///
    /// When `preferred_chain` is given, alternate chains advertised via
    /// `Link: rel="alternate"` are fetched and the first whose issuer Common
    /// Names include the preference is returned; if none matches, the default
    /// chain is used.
    pub async fn get_certificate(
        &self,
        order: &api::Order,
        preferred_chain: Option<&str>,
    ) -> Result<Certificate> {
        let order = if order.status == api::OrderStatus::Valid {
            order.clone()
        } else {
            self.wait_for_valid_status::<api::Order>(&order.url).await?
        };

        let cert_url = order.certificate.ok_or_else(|| {
            Error::Protocol("valid order carries no certificate URL".to_owned())
        })?;

        let resources = self.resources();
        let res = resources.post_as_get(&cert_url).await?;

        let alternate_urls: Vec<String> = res
            .headers()
            .get_all("link")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_link_header)
            .filter(|(_, rel)| rel == "alternate")
            .map(|(url, _)| url)
            .collect();

        let default_chain = Certificate::parse(res.text().await?)?;

        let Some(wanted) = preferred_chain else {
            return Ok(default_chain);
        };

        if chain_matches(&default_chain, wanted)? {
            return Ok(default_chain);
        }

        for alt_url in alternate_urls {
            let res = resources.post_as_get(&alt_url).await?;
            let chain = Certificate::parse(res.text().await?)?;

            if chain_matches(&chain, wanted)? {
                log::debug!("using alternate chain from {alt_url}");
                return Ok(chain);
            }
        }

        log::debug!("no offered chain is issued by {wanted:?}, using the default chain");
        Ok(default_chain)
    }

    /// Revoke a certificate for the reason given.
    pub async fn revoke_certificate(
        &self,
        cert: &Certificate,
        reason: RevocationReason,
    ) -> Result<()> {
        let reason = match reason {
            // > the reason code CRL entry extension SHOULD be absent instead of
            // > using the unspecified (0) reasonCode value
            // see <https://datatracker.ietf.org/doc/html/rfc5280#section-5.3.1>
            RevocationReason::Unspecified => None,

            reason => Some(reason as usize),
        };

        let payload = api::Revocation {
            certificate: base64url(&cert.certificate_der()?),
            reason,
        };

        self.resources().revoke_cert(&payload).await?;
        Ok(())
    }
}

fn chain_matches(cert: &Certificate, wanted: &str) -> Result<bool> {
    Ok(cert
        .issuer_common_names()?
        .iter()
        .any(|cn| cn == wanted))
}
