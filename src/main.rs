//! Agent firewall entry point: configuration, wiring, transport dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agent_firewall::{
    AuditLogger, EmitSinks, EscalationHub, FirewallConfig, FirewallEngine, ProxyState,
    SessionStore, StdioProxy, TransportMode,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Arc::new(FirewallConfig::from_env());

    let sessions = Arc::new(SessionStore::new(
        config.session_ring_buffer_size,
        config.session_ttl(),
    ));
    sessions.start();

    let hub = Arc::new(EscalationHub::new());

    let audit = Arc::new(AuditLogger::new(&config.audit_log_path));
    if let Err(err) = audit.start().await {
        error!(error = %err, "audit logger failed to start; continuing without audit");
    }

    let sinks = EmitSinks::default()
        .with_audit({
            let audit = Arc::clone(&audit);
            Arc::new(move |entry| audit.try_log(entry))
        })
        .with_operator({
            let hub = Arc::clone(&hub);
            Arc::new(move |event| {
                hub.publish(event);
                Ok(())
            })
        });

    let engine = Arc::new(FirewallEngine::from_config(&config, sinks));

    info!(
        listen = %config.listen_addr(),
        upstream = %config.upstream_http_url(),
        mode = %config.transport_mode,
        l1 = config.l1_enabled,
        l2 = config.l2_enabled,
        "agent firewall starting"
    );

    let outcome = match config.transport_mode {
        TransportMode::Stdio => {
            let proxy = StdioProxy::new(
                &config,
                Arc::clone(&engine),
                Arc::clone(&sessions),
                Arc::clone(&hub),
            );
            proxy.run().await
        }
        TransportMode::Sse | TransportMode::Websocket => {
            serve_http(
                Arc::clone(&config),
                engine,
                Arc::clone(&sessions),
                Arc::clone(&hub),
                Arc::clone(&audit),
            )
            .await
        }
    };

    if let Err(err) = outcome {
        error!(error = %err, "transport terminated with error");
    }

    sessions.stop().await;
    audit.stop().await;
    info!("agent firewall shut down");
}

async fn serve_http(
    config: Arc<FirewallConfig>,
    engine: Arc<FirewallEngine>,
    sessions: Arc<SessionStore>,
    hub: Arc<EscalationHub>,
    audit: Arc<AuditLogger>,
) -> agent_firewall::Result<()> {
    let state = ProxyState::new(config.clone(), engine, sessions, hub, Some(audit));
    let app = agent_firewall::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    info!(addr = %config.listen_addr(), "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    Ok(())
}
