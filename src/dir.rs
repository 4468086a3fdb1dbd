use tokio::sync::OnceCell;

use crate::{
    api,
    error::{Error, Result},
    req::{req_get, req_safe_read_body},
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory.
    ///
    /// Not appropriate for testing / development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory.
    ///
    /// Use for testing and development. Doesn't issue "valid" certificates.
    LetsEncryptStaging,

    /// An arbitrary directory URL to connect to.
    Other(&'a str),
}

impl DirectoryUrl<'_> {
    pub(crate) fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

/// Symbolic names for the URLs a directory document publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resource {
    NewNonce,
    NewAccount,
    NewOrder,
    RevokeCert,
    KeyChange,
}

/// Resolves symbolic resource names to URLs.
///
/// The directory document is fetched on first use and cached for the
/// lifetime of the client; construct a new client to refresh it.
#[derive(Debug)]
pub(crate) struct ResourceDirectory {
    http: reqwest::Client,
    url: String,
    doc: OnceCell<api::Directory>,
}

impl ResourceDirectory {
    pub(crate) fn new(http: reqwest::Client, url: &str) -> Self {
        ResourceDirectory {
            http,
            url: url.to_owned(),
            doc: OnceCell::new(),
        }
    }

    /// The cached directory document, fetching it if this is the first use.
    pub(crate) async fn document(&self) -> Result<&api::Directory> {
        self.doc.get_or_try_init(|| self.fetch()).await
    }

    async fn fetch(&self) -> Result<api::Directory> {
        log::debug!("fetching directory document from {}", self.url);

        let res = req_get(&self.http, &self.url)
            .await
            .map_err(|err| Error::Directory(format!("{}: {err}", self.url)))?;

        if !res.status().is_success() {
            return Err(Error::Directory(format!(
                "{}: HTTP {}",
                self.url,
                res.status()
            )));
        }

        let body = req_safe_read_body(res).await;
        serde_json::from_str(&body)
            .map_err(|err| Error::Directory(format!("malformed directory document: {err}")))
    }

    /// Resolves a symbolic resource name to its URL.
    pub(crate) async fn url_of(&self, resource: Resource) -> Result<String> {
        let doc = self.document().await?;

        let url = match resource {
            Resource::NewNonce => &doc.new_nonce,
            Resource::NewAccount => &doc.new_account,
            Resource::NewOrder => &doc.new_order,
            Resource::RevokeCert => &doc.revoke_cert,
            Resource::KeyChange => &doc.key_change,
        };

        Ok(url.clone())
    }

    /// The terms-of-service URL from directory metadata, if published.
    pub(crate) async fn terms_of_service_url(&self) -> Result<Option<String>> {
        let doc = self.document().await?;
        Ok(doc
            .meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.clone()))
    }
}
