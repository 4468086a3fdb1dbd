//! Provisioning certificates from ACME (Automatic Certificate Management Environment) providers
//! such as [Let's Encrypt](https://letsencrypt.org/).
//!
//! It follows the [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555) spec, using ACME v2 to
//! issue, renew and revoke certificates.
//!
//! # Usage
//!
//! Build an [`AcmeClient`] against a directory, then either drive the order flow step by step
//! ([`AcmeClient::create_order`], [`AcmeClient::complete_challenge`], and friends) or hand a CSR
//! and a [`ChallengeSolver`] to [`AcmeClient::issue_certificate`] and let it run the whole flow.
//!
//! ```no_run
//! use acme_client::{create_csr, create_p256_key, AcmeClient, AutoOptions, DirectoryUrl};
//! # struct MySolver;
//! # impl acme_client::ChallengeSolver for MySolver {
//! #     async fn publish(&self, _: &str, _: &acme_client::api::Challenge, _: &str) -> acme_client::Result<()> { Ok(()) }
//! #     async fn cleanup(&self, _: &str, _: &acme_client::api::Challenge) -> acme_client::Result<()> { Ok(()) }
//! # }
//!
//! # async fn run() -> acme_client::Result<()> {
//! let client = AcmeClient::builder(DirectoryUrl::LetsEncryptStaging).build()?;
//!
//! let cert_key = create_p256_key();
//! let csr = create_csr(&cert_key, &["example.com", "www.example.com"])?;
//!
//! let cert = client.issue_certificate(&MySolver, &AutoOptions::new(csr)).await?;
//! println!("{}", cert.certificate());
//! # Ok(())
//! # }
//! ```
//!
//! # Domain Ownership
//!
//! Website TLS certificates prove ownership/control over the domain they are issued for. For
//! ACME, this means proving you control either:
//!
//! - a server answering HTTP requests for that domain (`http-01`);
//! - the DNS server answering name lookups against the domain (`dns-01`).
//!
//! A [`ChallengeSolver`] implementation is the place where that modification happens: `publish`
//! installs the challenge response, `cleanup` removes it again. Before a challenge is handed to
//! the server for validation, the client checks the response is observable from where it runs,
//! so misconfigurations fail fast instead of burning validation attempts.
//!
//! # Rate Limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being abused.
//! It might be tempting to configure a really low [`BackoffConfig::min_delay`], but balance this
//! against the real risk of having access cut off.
//!
//! ## Use Staging For Development!
//!
//! Especially take care to use the Let's Encrypt staging environment for development where the
//! rate limits are more relaxed. See [`DirectoryUrl::LetsEncryptStaging`].
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod auto;
mod cert;
mod client;
mod dir;
mod error;
mod jws;
mod key;
mod req;
mod resources;
mod retry;
mod trans;
mod util;
mod verify;

pub mod api;

#[cfg(test)]
mod test;

pub use crate::{
    auto::{AutoOptions, ChallengeSolver},
    cert::{create_csr, read_csr_domains, Certificate, CertificateInfo, CsrDomains},
    client::{AcmeClient, AcmeClientBuilder, NewAccount, RevocationReason},
    dir::DirectoryUrl,
    error::{Error, Result},
    jws::ExternalAccountBinding,
    key::{create_p256_key, AccountKey},
    retry::BackoffConfig,
};
