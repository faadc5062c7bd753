//! Outbound HTTPS client whose TLS identity follows bundle "remote".
//!
//! An [`OutboundClient`] is immutable: it is one `reqwest::Client` built
//! from one client TLS context. Rotation happens by wrapping an
//! [`OutboundClientFactory`] in a [`Reloader`] and fetching
//! [`Reloader::current`] for each request.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tls_hot_reload::client::OutboundClientFactory;
//! use tls_hot_reload::{Bundles, ContextBuilder, Reloader, RustlsCryptoProvider};
//!
//! # async fn demo(bundles: Arc<Bundles>) -> Result<(), tls_hot_reload::Error> {
//! let builder = ContextBuilder::new(RustlsCryptoProvider::get().crypto_provider());
//! let factory = OutboundClientFactory::new(builder, "https://backend.example:8443/")?;
//! let client = Arc::new(Reloader::new(factory, &*bundles.get_bundle("remote")?)?);
//! client.watch(&bundles)?;
//!
//! let body = client.current().get("/api/health").await?;
//! # Ok(())
//! # }
//! ```

use reqwest::Url;
use std::sync::Arc;

use crate::bundle::{Bundle, Bundles};
use crate::context::{ClientContext, ContextBuilder};
use crate::reloader::{DependentFactory, Reloader};
use crate::{Error, REMOTE_BUNDLE};

/// Command line arguments for the outbound client.
#[derive(clap::Args, Debug, Default)]
#[group(id = "tls_hot_reload_client_args")]
pub struct Args {
    #[arg(
        long,
        help = "Base URL for outbound HTTPS requests. If unset, no outbound client is built."
    )]
    remote_url: Option<String>,
}

fn parse_url(url: &str) -> Result<Url, Error> {
    let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
    if parsed.cannot_be_a_base() {
        return Err(Error::InvalidUrl(format!("{}: cannot be a base URL", url)));
    }
    Ok(parsed)
}

/// One HTTP client bound to one version of a client TLS context.
#[derive(Debug)]
pub struct OutboundClient {
    http: reqwest::Client,
    base_url: Url,
    context: ClientContext,
}

impl OutboundClient {
    /// Build a client that presents and verifies credentials according to
    /// `context`.
    pub fn new(context: ClientContext, base_url: Url) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .use_preconfigured_tls((**context.config()).clone())
            .build()?;
        Ok(Self {
            http,
            base_url,
            context,
        })
    }

    /// The TLS context this client was built from.
    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    /// The URL that request paths are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// GET `path` relative to the base URL and return the response body.
    /// Any status other than 2xx is an error.
    pub async fn get(&self, path: &str) -> Result<String, Error> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", path, e)))?;
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.text().await?)
    }
}

/// Builds [`OutboundClient`]s for a [`Reloader`].
#[derive(Debug)]
pub struct OutboundClientFactory {
    builder: ContextBuilder,
    base_url: Url,
}

impl OutboundClientFactory {
    /// Clients will use contexts from `builder` and send requests to
    /// `base_url`.
    pub fn new(builder: ContextBuilder, base_url: &str) -> Result<Self, Error> {
        Ok(Self {
            builder,
            base_url: parse_url(base_url)?,
        })
    }

    /// Factory for `--remote-url`, or `None` if the flag is unset.
    pub fn from_args(builder: ContextBuilder, args: &Args) -> Result<Option<Self>, Error> {
        args.remote_url
            .as_deref()
            .map(|url| Self::new(builder, url))
            .transpose()
    }

    /// Build the first client from bundle "remote" and keep it up to date.
    pub fn into_reloader(self, bundles: &Bundles) -> Result<Arc<Reloader<Self>>, Error> {
        let bundle = bundles.get_bundle(REMOTE_BUNDLE)?;
        let reloader = Arc::new(Reloader::new(self, &bundle)?);
        reloader.watch(bundles)?;
        Ok(reloader)
    }
}

impl DependentFactory for OutboundClientFactory {
    type Object = OutboundClient;

    fn describe(&self) -> &str {
        "outbound HTTPS client"
    }

    fn create(&self, bundle: &Bundle) -> Result<OutboundClient, Error> {
        let context = self.builder.build_client(bundle)?;
        OutboundClient::new(context, self.base_url.clone())
    }
}
