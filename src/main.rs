//! honeycomb - TLS-terminating reverse proxy for container fleets
//!
//! Startup wires the pipeline together: certificate providers (file, ACME,
//! ad-hoc) behind the SNI-driven TLS state, locators (static, catalog)
//! behind the single-flight cache, and the two listeners. Exit codes: 0 on
//! clean shutdown, 1 on fatal startup errors, 2 on unrecoverable runtime
//! errors.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use honeycomb::acme::{AcmeManager, AcmeProvider};
use honeycomb::adhoc::{AdhocGenerator, AdhocProvider};
use honeycomb::backend::AggregateLocator;
use honeycomb::cache::CacheLocator;
use honeycomb::catalog::{connect_docker, CatalogLocator, CatalogPoller};
use honeycomb::cert::{CertificateProvider, FileProvider, ProviderChain};
use honeycomb::config::{Args, GatewayConfig};
use honeycomb::health::HealthChecker;
use honeycomb::http_listener::{
    drain_connections, run_redirect_server, run_secure_listener, GatewayState,
};
use honeycomb::proxy::HttpProxy;
use honeycomb::tls::{load_default_certificate, root_ca_pool, TlsState};
use honeycomb::websocket::WebSocketProxy;

const EXIT_STARTUP_FAILURE: i32 = 1;
const EXIT_RUNTIME_FAILURE: i32 = 2;

fn main() {
    // Install the rustls CryptoProvider before any TLS operations. Required
    // when both ring and aws-lc-rs features end up in the dependency tree.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level, args.json_logs) {
        eprintln!("failed to initialise logging: {}", e);
        std::process::exit(EXIT_STARTUP_FAILURE);
    }

    info!("starting honeycomb v{}", env!("CARGO_PKG_VERSION"));

    let config = match GatewayConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };

    if args.validate {
        info!("configuration validated successfully, exiting");
        return;
    }

    let runtime = tokio::runtime::Runtime::new().expect("failed to start runtime");
    let exit_code = runtime.block_on(async {
        let gateway = match Gateway::setup(&config).await {
            Ok(gateway) => gateway,
            Err(e) => {
                error!("startup failed: {:#}", e);
                return EXIT_STARTUP_FAILURE;
            }
        };

        match gateway.serve(&config).await {
            Ok(()) => {
                info!("clean shutdown");
                0
            }
            Err(e) => {
                error!("unrecoverable runtime error: {:#}", e);
                EXIT_RUNTIME_FAILURE
            }
        }
    });

    std::process::exit(exit_code);
}

fn init_logging(level: &str, json_logs: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("honeycomb={},info", level)));

    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }

    Ok(())
}

/// Everything assembled during startup.
struct Gateway {
    tls_state: Arc<TlsState>,
    state: Arc<GatewayState>,
    acme_manager: Option<Arc<AcmeManager>>,
    poller: CatalogPoller,
    secure_listener: TcpListener,
    insecure_listener: TcpListener,
}

impl Gateway {
    /// Build the full pipeline. Every error here is a fatal startup error.
    async fn setup(config: &GatewayConfig) -> anyhow::Result<Gateway> {
        // Default certificate and ad-hoc issuer come from the certificate
        // directory; both are required.
        let default_entry = load_default_certificate(&config.certificate_path)?;
        info!(
            "default certificate loaded from {:?}",
            config.certificate_path
        );

        let generator = AdhocGenerator::from_files(
            &config.certificate_path.join("issuer.crt"),
            &config.certificate_path.join("issuer.key"),
            &config.certificate_path.join("server.key"),
            config.adhoc_ttl_hours,
        )?;

        let file_provider = Arc::new(FileProvider::new(&config.certificate_path));
        let indexed = file_provider.reload()?;
        info!("{} per-domain certificate(s) indexed", indexed);
        if let Err(e) = file_provider.start_watching() {
            warn!("certificate directory watching unavailable: {}", e);
        }

        let acme_manager = config.acme.clone().map(AcmeManager::new);

        let mut providers: Vec<Arc<dyn CertificateProvider>> = vec![file_provider];
        if let Some(manager) = &acme_manager {
            info!("ACME provider enabled");
            providers.push(Arc::new(AcmeProvider::new(manager.clone())));
            manager.start_renewal_sweep();
        }
        providers.push(Arc::new(AdhocProvider::new(generator)));

        let tls_state = Arc::new(TlsState::new(default_entry, ProviderChain::new(providers))?);

        // Upstream transports share one root-CA pool
        let roots = root_ca_pool(&config.ca_bundles)?;

        // Locator chain: cache in front of static-then-catalog
        let docker = connect_docker()?;
        let static_locator = config.static_locator()?;
        info!("{} static endpoint(s) configured", static_locator.len());

        let catalog_locator = Arc::new(CatalogLocator::new());
        let aggregate = AggregateLocator::new(vec![
            Arc::new(static_locator),
            catalog_locator.clone(),
        ]);
        let cache = Arc::new(CacheLocator::new(Arc::new(aggregate)));

        let mut poller = CatalogPoller::new(
            docker.clone(),
            catalog_locator.clone(),
            config.catalog_poll_interval,
        )
        .invalidating(cache.clone());
        poller.start();

        let state = Arc::new(GatewayState {
            locator: cache,
            http_proxy: HttpProxy::new(&roots)?,
            websocket_proxy: WebSocketProxy::new(&roots)?,
            health: HealthChecker::new(docker, catalog_locator),
        });

        // Bind both ports now so failures are startup errors
        let secure_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let secure_listener = TcpListener::bind(secure_addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", secure_addr, e))?;

        let insecure_addr = SocketAddr::from(([0, 0, 0, 0], config.insecure_port));
        let insecure_listener = TcpListener::bind(insecure_addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", insecure_addr, e))?;

        Ok(Gateway {
            tls_state,
            state,
            acme_manager,
            poller,
            secure_listener,
            insecure_listener,
        })
    }

    /// Serve until a shutdown signal arrives or a listener dies.
    async fn serve(mut self, config: &GatewayConfig) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let mut secure_task = tokio::spawn(run_secure_listener(
            self.secure_listener,
            self.tls_state.clone(),
            self.state.clone(),
            config.proxy_protocol,
            active_connections.clone(),
            shutdown_rx.clone(),
        ));

        let mut redirect_task = tokio::spawn(run_redirect_server(
            self.insecure_listener,
            config.port,
            self.acme_manager.clone(),
            config.proxy_protocol,
            shutdown_rx,
        ));

        let failure = tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                None
            }
            result = &mut secure_task => {
                Some(flatten_task("secure listener", result))
            }
            result = &mut redirect_task => {
                Some(flatten_task("redirect listener", result))
            }
        };

        // Stop accepting, then give in-flight requests the grace period.
        let _ = shutdown_tx.send(true);
        drain_connections(&active_connections, config.shutdown_grace).await;

        self.poller.stop().await;
        if let Some(manager) = &self.acme_manager {
            manager.stop_renewal_sweep().await;
        }

        secure_task.abort();
        redirect_task.abort();

        match failure {
            None => Ok(()),
            Some(Ok(())) => Err(anyhow::anyhow!("listener exited unexpectedly")),
            Some(Err(e)) => Err(e),
        }
    }
}

fn flatten_task(
    name: &str,
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match result {
        Ok(inner) => inner.map_err(|e| anyhow::anyhow!("{} failed: {}", name, e)),
        Err(e) => Err(anyhow::anyhow!("{} panicked: {}", name, e)),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
