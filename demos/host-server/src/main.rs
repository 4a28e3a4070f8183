//! Workspace host serving the bus over WebSocket.
//!
//! Run with: cargo run -p host-server
//!
//! Then open http://localhost:3000 in your browser. Settings come from
//! `WORKSPACE_BUS_*` environment variables.

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    Router,
    http::HeaderValue,
    response::Html,
    routing::get,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspace_bus_agent::HttpAgentBackend;
use workspace_bus_core::{BusConfig, FsFileLoader, Store, traits::ChannelNavigator};
use workspace_bus_host::Dispatcher;
use workspace_bus_transport::{OriginPolicy, websocket::create_ws_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = BusConfig::from_env().context("Invalid WORKSPACE_BUS_* configuration")?;
    let policy = OriginPolicy::from_config(&config);
    if policy.is_empty() {
        tracing::warn!("No allowed origins configured, every connection will be refused");
    }

    let (navigator, mut routes) = ChannelNavigator::new();
    tokio::spawn(async move {
        while let Some(path) = routes.recv().await {
            tracing::info!(%path, "Embedded content asked to navigate");
        }
    });

    let dispatcher = Dispatcher::new(
        Store::new(),
        Arc::new(HttpAgentBackend::from_config(&config)),
        policy.clone(),
    )
    .with_files(Arc::new(FsFileLoader::new(config.files_root.clone())))
    .with_navigator(Arc::new(navigator));

    let cors_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_ws_router(
            Arc::new(dispatcher),
            config.host_origin.clone(),
            policy,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::new().allow_origin(AllowOrigin::list(cors_origins))),
        );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(
        addr = %config.listen_addr,
        agents = %config.agent_base_url,
        files = %config.files_root.display(),
        "Workspace host listening"
    );
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Workspace Bus</title>
    <style>
        body { margin: 0; padding: 20px; background: #1e1e1e; color: #d4d4d4; font-family: system-ui, sans-serif; }
        h1 { color: #fff; margin-bottom: 10px; }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        input, button { font-size: 14px; margin: 4px 4px 4px 0; }
        #log { white-space: pre-wrap; font-family: Menlo, Monaco, monospace; font-size: 13px; }
    </style>
</head>
<body>
    <h1>Workspace Bus</h1>
    <div class="status" id="status">Connecting...</div>
    <div>
        <input id="agent" placeholder="agent name" />
        <input id="query" placeholder="ask the agent" size="40" />
        <button id="run">Run</button>
        <button id="context">Get context</button>
    </div>
    <div id="answer"></div>
    <div id="log"></div>

    <script>
        const status = document.getElementById('status');
        const log = document.getElementById('log');
        const answer = document.getElementById('answer');
        let ws;

        function send(message) {
            if (ws && ws.readyState === WebSocket.OPEN) {
                ws.send(JSON.stringify(message));
            }
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws`);

            ws.onopen = () => {
                status.textContent = 'Connected';
                status.className = 'status connected';
                send({ type: 'workspace-subscribe', payload: { key: 'demo' } });
            };

            ws.onclose = () => {
                status.textContent = 'Disconnected - reconnecting...';
                status.className = 'status disconnected';
                setTimeout(connect, 2000);
            };

            ws.onmessage = (event) => {
                const msg = JSON.parse(event.data);
                if (msg.type === 'workspace-execute-agent-response') {
                    const p = msg.payload;
                    if (p.type === 'chunk' || p.type === 'text_delta') {
                        answer.textContent += p.content ?? p.text ?? '';
                    } else if (p.type === 'complete') {
                        answer.textContent = p.fullResponse ?? answer.textContent;
                    } else if (p.type === 'error') {
                        answer.textContent = `[Error: ${p.error}]`;
                    }
                    return;
                }
                log.textContent = JSON.stringify(msg, null, 2) + '\n' + log.textContent;
            };
        }

        document.getElementById('run').onclick = () => {
            answer.textContent = '';
            const requestId = crypto.randomUUID();
            send({
                type: 'workspace-execute-agent',
                payload: {
                    agentName: document.getElementById('agent').value,
                    query: document.getElementById('query').value,
                    requestId,
                },
                requestId,
            });
        };

        document.getElementById('context').onclick = () => {
            send({ type: 'workspace-get-context', payload: {}, requestId: crypto.randomUUID() });
        };

        connect();
    </script>
</body>
</html>
"#;
