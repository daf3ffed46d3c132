//! polyglot-gatewayd — multi-tenant gRPC gateway unifying OpenAI,
//! Anthropic, and Gemini behind one wire protocol.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::info;

mod auth;
mod catalog;
mod config;
mod config_merge;
mod dispatch;
mod error;
mod files;
mod grpc;
mod pricing;
mod providers;
mod rag;
mod stream;
mod tenant;
mod vault;

use auth::{Authenticator, KeyStore, RateLimiter};
use config::{GatewayConfig, TenantTable, TenantTableHandle};
use dispatch::{DispatchEngine, ProviderRegistry};
use grpc::pb::admin_service_server::AdminServiceServer;
use grpc::pb::chat_service_server::ChatServiceServer;
use grpc::pb::file_service_server::FileServiceServer;
use grpc::{AdminServiceImpl, ChatServiceImpl, FileServiceImpl};
use providers::ChatProvider;
use rag::HttpRetrievalClient;
use tenant::TenantResolver;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::load(std::env::var("GATEWAY_CONFIG").ok().map(std::path::PathBuf::from).as_deref())
        .context("failed to load gateway configuration")?;

    init_tracing(&config);

    info!(grpc_port = config.grpc_port, "starting polyglot-gatewayd");

    if let Some(parent) = config.key_store_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create key store directory")?;
    }
    let key_store = Arc::new(KeyStore::open(&config.key_store_path).context("failed to open key store")?);

    let tenant_table = TenantTable::load_dir(
        &config.tenants_dir,
        config.key_store_password.as_deref().map(str::as_bytes),
    )
    .context("failed to load tenant configuration")?;
    info!(count = tenant_table.len(), dir = %config.tenants_dir.display(), "loaded tenant configuration");
    let tenants = TenantTableHandle::new(tenant_table);

    let pricing = Arc::new(
        pricing::PricingTable::load_dir(&config.pricing_dir).context("failed to load pricing tables")?,
    );

    let mut provider_map: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
    provider_map.insert("openai".into(), Arc::new(providers::openai::OpenAIProvider::new()));
    provider_map.insert("anthropic".into(), Arc::new(providers::anthropic::AnthropicProvider::new()));
    provider_map.insert("gemini".into(), Arc::new(providers::gemini::GeminiProvider::new()));
    let registry = ProviderRegistry::new(provider_map);

    let retrieval: Arc<dyn rag::RetrievalClient> = Arc::new(HttpRetrievalClient::new(
        std::env::var("RETRIEVAL_SERVICE_URL").unwrap_or_else(|_| "http://127.0.0.1:7900".to_string()),
    ));

    let dispatch = Arc::new(DispatchEngine::new(registry, retrieval, Arc::clone(&pricing)));

    let authenticator = Arc::new(Authenticator::new(Arc::clone(&key_store)));
    let rate_limiter = Arc::new(RateLimiter::new(Arc::clone(&key_store)));
    let tenant_resolver = Arc::new(TenantResolver::new(tenants.clone()));

    let file_catalog = Arc::new(catalog::FileCatalog::new());
    let upload_dir = config
        .key_store_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("uploads");

    let chat_service = ChatServiceImpl {
        authenticator: Arc::clone(&authenticator),
        rate_limiter: Arc::clone(&rate_limiter),
        tenant_resolver: Arc::clone(&tenant_resolver),
        dispatch: Arc::clone(&dispatch),
        key_store: Arc::clone(&key_store),
    };

    let file_service = FileServiceImpl {
        authenticator: Arc::clone(&authenticator),
        rate_limiter: Arc::clone(&rate_limiter),
        catalog: Arc::clone(&file_catalog),
        upload_dir,
    };

    let admin_service = AdminServiceImpl {
        key_store: Arc::clone(&key_store),
        tenants: tenants.clone(),
    };

    let addr = format!("0.0.0.0:{}", config.grpc_port)
        .parse()
        .context("invalid grpc listen address")?;

    let mut builder = Server::builder();

    if config.tls_enabled {
        let cert_path = config
            .tls_cert_file
            .as_ref()
            .context("tls_enabled is set but tls_cert_file is missing")?;
        let key_path = config
            .tls_key_file
            .as_ref()
            .context("tls_enabled is set but tls_key_file is missing")?;
        let cert = std::fs::read(cert_path).context("failed to read TLS certificate")?;
        let key = std::fs::read(key_path).context("failed to read TLS private key")?;
        let identity = tonic::transport::Identity::from_pem(cert, key);
        builder = builder
            .tls_config(tonic::transport::ServerTlsConfig::new().identity(identity))
            .context("failed to configure TLS")?;
    }

    info!(%addr, tls = config.tls_enabled, "gRPC server listening");

    builder
        .add_service(ChatServiceServer::new(chat_service))
        .add_service(FileServiceServer::new(file_service))
        .add_service(AdminServiceServer::new(admin_service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await
        .context("gRPC server terminated unexpectedly")?;

    info!("gateway shut down cleanly");
    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Waits for SIGINT or SIGTERM so in-flight RPCs drain before the process
/// exits, rather than being cut off mid-response.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, draining in-flight requests"),
        _ = terminate => info!("received SIGTERM, draining in-flight requests"),
    }
}
