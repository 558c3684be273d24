use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use switchyard::{
    adapters::{ElasticsearchWriter, EtcdStore, HttpClientAdapter, HttpHandler},
    config::{
        COLLECTOR_SWITCH_ES, GatewayConfig, GatewayConfigValidator, load_config,
        load_validated_config,
    },
    core::{
        AdmissionChain, BalancerRegistry, Dispatcher, DispatcherOptions, RegistryOptions,
        ServiceBalancers, ServiceRegistry, TelemetryHandle, TelemetryOptions, TelemetrySink,
    },
    ports::http_client::HttpClient,
    tracing_setup,
    utils::GracefulShutdown,
};
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG: &str = include_str!("../config.example.yaml");

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,

    /// Human readable logs instead of JSON
    #[clap(long)]
    pretty: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Write a starter configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let config_path = match args.command {
        Some(Commands::Validate { config }) => return validate_config_command(&config),
        Some(Commands::Init { config }) => return init_config_command(&config),
        Some(Commands::Serve { config }) => config,
        None => args.config,
    };

    if args.pretty {
        tracing_setup::init_console_tracing("info")?;
    } else {
        tracing_setup::init_tracing("info")?;
    }

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already.",
            e
        );
    }

    tracing::info!("Loading configuration from {config_path}");
    let config = load_validated_config(&config_path)?;

    serve(config).await
}

async fn serve(config: GatewayConfig) -> Result<()> {
    let shutdown = Arc::new(GracefulShutdown::with_timeout(config.shutdown_timeout()));
    let service_names = config.service_names();

    let store = EtcdStore::connect(&config.etcd)
        .await
        .wrap_err("Failed to connect to etcd")?;
    let registry = Arc::new(ServiceRegistry::new(
        Arc::new(store),
        RegistryOptions {
            cache_expiration: config.etcd.cache_expiration(),
            clean_up_interval: config.etcd.clean_up_interval(),
            stop_timeout: config.shutdown_timeout(),
        },
    ));

    let balancers = ServiceBalancers::from_config(&config, &BalancerRegistry::with_builtin())
        .wrap_err("Failed to build load balancers")?;
    let admission = AdmissionChain::from_config(&config)?;

    registry.start(&service_names).await;

    let sink = start_telemetry(&config, config.shutdown_timeout())?;
    let telemetry = sink
        .as_ref()
        .map(TelemetrySink::handle)
        .unwrap_or_else(TelemetryHandle::inactive);

    let http_client: Arc<dyn HttpClient> = Arc::new(
        HttpClientAdapter::new(&config.http_transport)
            .wrap_err("Failed to create HTTP client adapter")?,
    );

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        balancers,
        admission,
        http_client,
        telemetry,
        DispatcherOptions::from_config(&config),
    ));
    let janitor_cancel = CancellationToken::new();
    let route_janitor = dispatcher.spawn_route_janitor(janitor_cancel.clone());

    let app = HttpHandler::new(dispatcher).router();

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .wrap_err("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind to {addr}"))?;

    tracing::info!(
        services = service_names.len(),
        load_balance_mode = %config.load_balance_mode,
        collector = config.open_collector,
        "Switchyard gateway listening on {}",
        addr
    );

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { shutdown.run_signal_handler().await });
    }

    let mut server = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown.wait_for_shutdown_signal().await;
            })
            .await
        })
    };

    let exited = tokio::select! {
        result = &mut server => Some(result),
        reason = shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}", reason);
            None
        }
    };
    let server_result = match exited {
        Some(Ok(served)) => served.wrap_err("Server error"),
        Some(Err(e)) => Err(eyre!("Server task failed: {e}")),
        None => {
            let drained = shutdown
                .bounded("HTTP server", async {
                    if let Ok(Err(e)) = (&mut server).await {
                        tracing::error!("Server error during drain: {}", e);
                    }
                })
                .await;
            if !drained {
                server.abort();
            }
            Ok(())
        }
    };

    janitor_cancel.cancel();
    let _ = route_janitor.await;
    shutdown.bounded("Service registry", registry.stop()).await;
    if let Some(sink) = &sink {
        shutdown.bounded("Telemetry sink", sink.stop()).await;
    }

    tracing::info!("Graceful shutdown completed");
    server_result
}

fn start_telemetry(
    config: &GatewayConfig,
    stop_timeout: std::time::Duration,
) -> Result<Option<TelemetrySink>> {
    if !config.open_collector {
        tracing::info!("Telemetry collection is disabled");
        return Ok(None);
    }
    if config.collector.switch != COLLECTOR_SWITCH_ES {
        return Err(eyre!(
            "collector '{}' does not exist",
            config.collector.switch
        ));
    }

    let writer = ElasticsearchWriter::new(&config.collector.es)
        .wrap_err("Failed to create Elasticsearch writer")?;
    Ok(Some(TelemetrySink::spawn(
        Arc::new(writer),
        TelemetryOptions::from_config(&config.collector.es, stop_timeout),
    )))
}

/// Validate configuration file and exit
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Services: {}", config.reverse_host.len());
            for host in &config.reverse_host {
                println!(
                    "       - {} ({})",
                    host.service_name,
                    config.mode_for(&host.service_name)
                );
            }
            println!("   • etcd Endpoints: {}", config.etcd.endpoints.join(", "));
            println!(
                "   • Fallback Host: {}",
                if config.default_url.is_empty() {
                    "none"
                } else {
                    &config.default_url
                }
            );
            println!("   • Blacklisted IPs: {}", config.ip_table.len());
            println!("   • Rate Limiting: {}", config.restrictor.open);
            println!("   • Telemetry: {}", config.open_collector);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • List at least one service under reverse_host");
            println!("   • Use one of: random, ip_hash, weight, round_robin");
            println!("   • Verify listen address format (e.g., '0.0.0.0:8080')");
            println!("   • Give the restrictor a non-zero rate and max_token when open");
            std::process::exit(1);
        }
    }
}

/// Write the starter configuration file
fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    std::fs::write(path, DEFAULT_CONFIG)
        .wrap_err_with(|| format!("Failed to write {config_path}"))?;
    println!("✅ Created configuration file: {config_path}");
    println!("   Edit reverse_host and etcd.endpoints, then run:");
    println!("   switchyard serve --config {config_path}");
    Ok(())
}
