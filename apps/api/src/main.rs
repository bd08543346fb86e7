mod config;
mod routes;

use config::{load_config, StoreKind};
use dotenv::dotenv;
use persona_core::Repository;
use persona_fetch::ReqwestFetch;
use persona_llm::make_providers;
use persona_rag::{ChatPipeline, Ingestor};
use persona_store::{MemoryRepository, SledRepository};
use routes::{build_router, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG may come from .env
    dotenv().ok();
    init_tracing();

    let cfg = load_config()?;

    let providers = make_providers(
        cfg.chat_provider.to_provider_config()?,
        cfg.embedding_provider.to_provider_config()?,
    )
    .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let repo: Arc<dyn Repository> = match cfg.store.kind {
        StoreKind::Memory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Arc::new(MemoryRepository::new())
        }
        StoreKind::Sled => {
            info!(path = %cfg.store.path, "Opening sled store");
            Arc::new(SledRepository::open(&cfg.store.path)?)
        }
    };
    // 预先创建默认身份，未带 x-user-id 的请求落到该用户
    let default_user_id = repo.ensure_user(&cfg.identity.default_user).await?;
    info!(identity = %cfg.identity.default_user, user_id = %default_user_id, "Default identity ready");

    let fetch = Arc::new(ReqwestFetch::new(cfg.limits.allow_loopback_tools)?);
    let limits = cfg.limits.clone();
    if limits.allow_loopback_tools {
        tracing::warn!("Loopback tool endpoints are allowed");
    }

    let state = AppState {
        pipeline: Arc::new(ChatPipeline::new(
            repo.clone(),
            providers.chat.clone(),
            providers.embed.clone(),
            fetch.clone(),
            &limits,
        )),
        ingestor: Arc::new(Ingestor::new(
            repo.clone(),
            providers.chat,
            providers.embed,
            fetch,
            limits.clone(),
        )),
        repo,
        limits,
        default_user: cfg.identity.default_user.clone(),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    info!(%addr, "persona-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let subscriber = Registry::default().with(env_filter()).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rust_log_from_dotenv_reaches_filter() {
        if std::env::var("RUST_LOG").is_ok() {
            // an inherited RUST_LOG wins over .env
            return;
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "RUST_LOG=warn,persona_api=debug").unwrap();
        dotenv::from_path(file.path()).unwrap();

        let filter = env_filter().to_string();
        std::env::remove_var("RUST_LOG");
        assert!(filter.contains("persona_api=debug"), "{filter}");
    }
}
