//! Inbound HTTPS listener whose TLS identity follows bundle "self".
//!
//! [`InboundTls`] owns the `axum_server` TLS acceptor configuration. When
//! hot reload is enabled, every time the bundle changes a new server
//! context is built and pushed into the acceptor, so that new handshakes
//! use the new credentials while established connections carry on with
//! the ones they negotiated. When it is disabled the listener keeps its
//! initial context for its whole life.
//!
//! # Command line flags
//!
//! | Flag                  | Default    | Meaning                 |
//! |-----------------------|------------|-------------------------|
//! | `--https-port`        | *none*     | TCP port number for the HTTPS server. If unset, HTTPS is not served. |
//! | `--https-bind-addr`   | `::`       | Binding IP address for HTTPS. Used only if `--https-port` is set. |
//! | `--server-hot-reload` | `true`     | Rebuild the listener's TLS context when its bundle changes. |

use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::bundle::{Bundle, Bundles};
use crate::context::{ClientAuthEnabled, ClientAuthMode, ContextBuilder, ServerContext};
use crate::reloader::{DependentFactory, Reloader};
use crate::{Error, SELF_BUNDLE};

/// Command line arguments for the inbound listener.
#[derive(clap::Args, Debug)]
#[group(id = "tls_hot_reload_server_args")]
pub struct Args {
    #[arg(
        long,
        help = "TCP port number for HTTPS server. If unset, HTTPS is not served."
    )]
    https_port: Option<u16>,

    #[arg(
        long,
        default_value = "::",
        help = "Binding IP address for HTTPS. Used only if --https-port is set."
    )]
    https_bind_addr: IpAddr,

    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Rebuild the HTTPS server's TLS context when the \"self\" bundle changes."
    )]
    server_hot_reload: bool,
}

impl Args {
    /// Where to listen, if anywhere.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.https_port
            .map(|port| SocketAddr::from((self.https_bind_addr, port)))
    }

    /// Whether the listener follows bundle changes.
    pub fn hot_reload(&self) -> bool {
        self.server_hot_reload
    }
}

/// Builds server contexts and installs each one published into the
/// listener's acceptor.
pub struct ServerTlsFactory<CA> {
    builder: ContextBuilder,
    acceptor: RustlsConfig,
    _ca: PhantomData<CA>,
}

impl<CA> std::fmt::Debug for ServerTlsFactory<CA> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("ServerTlsFactory")
            .field("builder", &self.builder)
            .finish_non_exhaustive()
    }
}

impl<CA> DependentFactory for ServerTlsFactory<CA>
where
    CA: ClientAuthMode + Send + Sync + 'static,
{
    type Object = ServerContext;

    fn describe(&self) -> &str {
        "HTTPS server TLS context"
    }

    fn create(&self, bundle: &Bundle) -> Result<ServerContext, Error> {
        self.builder.build_server::<CA>(bundle)
    }

    fn published(&self, instance: &Arc<ServerContext>) {
        self.acceptor
            .reload_from_config(Arc::clone(instance.config()));
    }
}

/// TLS for an HTTPS listener, bound to one bundle.
pub struct InboundTls<CA = ClientAuthEnabled>
where
    CA: ClientAuthMode + Send + Sync + 'static,
{
    reloader: Arc<Reloader<ServerTlsFactory<CA>>>,
    acceptor: RustlsConfig,
    hot_reload: bool,
}

impl<CA> Clone for InboundTls<CA>
where
    CA: ClientAuthMode + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            reloader: Arc::clone(&self.reloader),
            acceptor: self.acceptor.clone(),
            hot_reload: self.hot_reload,
        }
    }
}

impl<CA> std::fmt::Debug for InboundTls<CA>
where
    CA: ClientAuthMode + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("InboundTls")
            .field("reloader", &self.reloader)
            .field("hot_reload", &self.hot_reload)
            .finish()
    }
}

impl<CA> InboundTls<CA>
where
    CA: ClientAuthMode + Send + Sync + 'static,
{
    /// Build the listener's first context from bundle `name`. With
    /// `hot_reload`, register for changes of that bundle.
    pub fn new(
        bundles: &Bundles,
        name: &str,
        builder: ContextBuilder,
        hot_reload: bool,
    ) -> Result<Self, Error> {
        let bundle = bundles.get_bundle(name)?;
        let builder = builder.with_alpn_protocols(vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        let initial = builder.build_server::<CA>(&bundle)?;
        let acceptor = RustlsConfig::from_config(Arc::clone(initial.config()));
        let factory = ServerTlsFactory {
            builder,
            acceptor: acceptor.clone(),
            _ca: PhantomData,
        };
        let reloader = Arc::new(Reloader::with_initial(factory, &bundle, initial));
        if hot_reload {
            reloader.watch(bundles)?;
        }
        log::info!(
            "HTTPS server TLS context built from bundle {} version {}, hot reload {}",
            bundle.name(),
            bundle.version(),
            if hot_reload { "enabled" } else { "disabled" }
        );
        Ok(Self {
            reloader,
            acceptor,
            hot_reload,
        })
    }

    /// Listener TLS for bundle "self" configured by command line flags.
    /// Returns the address to serve on, or `None` if `--https-port` is
    /// unset.
    pub fn from_args(
        bundles: &Bundles,
        builder: ContextBuilder,
        args: &Args,
    ) -> Result<Option<(SocketAddr, Self)>, Error> {
        let Some(addr) = args.listen_addr() else {
            return Ok(None);
        };
        let tls = Self::new(bundles, SELF_BUNDLE, builder, args.hot_reload())?;
        Ok(Some((addr, tls)))
    }

    /// The context new handshakes currently use.
    pub fn context(&self) -> Arc<ServerContext> {
        self.reloader.current()
    }

    /// The reloader that owns the context.
    pub fn reloader(&self) -> &Arc<Reloader<ServerTlsFactory<CA>>> {
        &self.reloader
    }

    /// Whether the listener follows bundle changes.
    pub fn hot_reload(&self) -> bool {
        self.hot_reload
    }

    /// Serve `router` over HTTPS on `addr` until `handle` is shut down.
    pub async fn serve(&self, addr: SocketAddr, router: Router, handle: Handle) -> Result<(), Error> {
        log::info!("Secure HTTP server listening on {}", addr);
        axum_server::bind_rustls(addr, self.acceptor.clone())
            .handle(handle)
            .serve(router.into_make_service())
            .await?;
        Ok(())
    }
}
