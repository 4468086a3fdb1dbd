//! End-to-end certificate issuance driven by a CSR.
//!
//! [`AcmeClient::issue_certificate`] runs the whole order flow: account
//! setup, order creation, challenge selection and completion through a
//! caller-supplied [`ChallengeSolver`], finalization, and download.

use x509_cert::request::CertReq;

use crate::{
    api,
    cert::{read_csr_domains, Certificate},
    client::{AcmeClient, NewAccount},
    error::{Error, Result},
};

/// Publishes and removes challenge responses.
///
/// Implementations own the side effects of validation: writing the
/// `.well-known` file or installing the TXT record for `publish`, and
/// undoing that in `cleanup`. `cleanup` runs for every selected challenge,
/// whether or not publishing and validation succeeded, so it must tolerate
/// a response that was never installed.
#[allow(async_fn_in_trait)]
pub trait ChallengeSolver {
    async fn publish(
        &self,
        identifier: &str,
        challenge: &api::Challenge,
        key_authorization: &str,
    ) -> Result<()>;

    async fn cleanup(&self, identifier: &str, challenge: &api::Challenge) -> Result<()>;
}

/// Options for [`AcmeClient::issue_certificate`].
#[derive(Debug, Clone)]
pub struct AutoOptions {
    /// The CSR to submit. The domains to order are read from its Common Name
    /// and Subject Alternative Name extension.
    pub csr: CertReq,

    /// Contact URIs for account creation.
    pub contact: Vec<String>,

    /// Agreement to the CA's terms of service.
    pub terms_of_service_agreed: bool,

    /// Challenge types to try, in order of preference.
    pub challenge_priority: Vec<api::ChallengeKind>,

    /// Skip the local pre-flight check and hand challenges straight to the
    /// server. Useful when the validation endpoint is not reachable from
    /// where the client runs.
    pub skip_challenge_verification: bool,

    /// Issuer Common Name of the chain to prefer, if the CA offers
    /// alternates.
    pub preferred_chain: Option<String>,
}

impl AutoOptions {
    pub fn new(csr: CertReq) -> Self {
        AutoOptions {
            csr,
            contact: vec![],
            terms_of_service_agreed: true,
            challenge_priority: vec![api::ChallengeKind::Http01, api::ChallengeKind::Dns01],
            skip_challenge_verification: false,
            preferred_chain: None,
        }
    }
}

impl AcmeClient {
    /// Obtain a certificate for the domains named in the CSR.
    pub async fn issue_certificate<S: ChallengeSolver>(
        &self,
        solver: &S,
        options: &AutoOptions,
    ) -> Result<Certificate> {
        self.create_account(&NewAccount {
            contact: options.contact.clone(),
            terms_of_service_agreed: options.terms_of_service_agreed,
            ..Default::default()
        })
        .await?;

        let domains = read_csr_domains(&options.csr)?.all();
        if domains.is_empty() {
            return Err(Error::Protocol("the CSR names no domains".to_owned()));
        }
        log::info!("ordering a certificate for {domains:?}");

        let domain_refs: Vec<&str> = domains.iter().map(String::as_str).collect();
        let order = self.create_order(&domain_refs).await?;

        for authz in self.get_authorizations(&order).await? {
            self.satisfy_authorization(solver, options, &authz).await?;
        }

        let order = self.finalize_order(&order, &options.csr).await?;

        self.get_certificate(&order, options.preferred_chain.as_deref())
            .await
    }

    async fn satisfy_authorization<S: ChallengeSolver>(
        &self,
        solver: &S,
        options: &AutoOptions,
        authz: &api::Authorization,
    ) -> Result<()> {
        if authz.status == api::AuthorizationStatus::Valid {
            log::debug!("authorization for {} already valid", authz.identifier.value);
            return Ok(());
        }

        let identifier = &authz.identifier.value;
        let challenge = select_challenge(authz, &options.challenge_priority)?;
        let key_authorization = self.key_authorization(challenge)?;

        log::info!("satisfying {} challenge for {identifier}", challenge.kind_str);

        let validation = async {
            solver
                .publish(identifier, challenge, &key_authorization)
                .await?;

            if !options.skip_challenge_verification {
                self.verify_challenge(identifier, challenge).await?;
            }

            self.complete_challenge(challenge).await?;
            self.wait_for_valid_status::<api::Challenge>(&challenge.url)
                .await?;

            Ok(())
        }
        .await;

        if let Err(err) = solver.cleanup(identifier, challenge).await {
            log::warn!("challenge cleanup for {identifier} failed: {err}");
        }

        validation
    }
}

fn select_challenge<'a>(
    authz: &'a api::Authorization,
    priority: &[api::ChallengeKind],
) -> Result<&'a api::Challenge> {
    for kind in priority {
        if let Some(challenge) = authz.challenge(*kind) {
            return Ok(challenge);
        }
    }

    let offered = authz
        .challenges
        .iter()
        .map(|c| c.kind_str.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    Err(Error::UnknownChallengeType(format!(
        "no usable challenge for {}; server offered: {offered}",
        authz.identifier.value,
    )))
}
