use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    anyhow::Context,
    axum::{
        Router,
        body::Bytes,
        extract::{ConnectInfo, Path, Query, RawQuery, State, WebSocketUpgrade, rejection::QueryRejection},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Json},
        routing::{any, get, post},
    },
    pubrelay_broker::{Broker, MemoryBroker},
    pubrelay_config::{BrokerBackend, BrokerConfig, PublishConfig, RelayConfig},
    pubrelay_plugins::ProviderRegistry,
    pubrelay_protocol::{
        REFRESH_HEADER, RelayMode, refresh_token,
        routes::{HEALTH, LIST_DIR, PUBLISH_DIR, REFRESH, STREAM, SUBSCRIBE_DIR},
    },
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{debug, info, warn},
};

use crate::{
    auth::IdentityGate,
    error::GatewayError,
    list,
    publish::{ChannelMap, PublishGateway},
    state::{GatewayState, StateOptions},
    ws::handle_stream,
};

type AppState = Arc<GatewayState>;

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router for `state.mode` (shared between production
/// startup and tests).
pub fn build_gateway_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::AUTHORIZATION]);

    let api = match state.mode {
        RelayMode::Publish => {
            Router::new().route(&format!("{PUBLISH_DIR}{{id}}"), post(publish_handler))
        },
        RelayMode::Subscribe => Router::new()
            .route(
                &format!("{SUBSCRIBE_DIR}{{channel}}"),
                get(subscribe_handler).post(subscribe_handler),
            )
            .route(&format!("{LIST_DIR}{{key}}"), get(list_handler)),
    }
    .layer(cors);

    let mut router = Router::new().route(HEALTH, get(health_handler));
    if state.mode == RelayMode::Subscribe {
        router = router
            .route(STREAM, get(stream_handler))
            .route(REFRESH, any(refresh_handler));
    }

    router
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

async fn connect_broker(cfg: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match cfg.backend {
        BrokerBackend::Memory => {
            warn!("using the in-memory broker, nothing is shared with other processes");
            Ok(Arc::new(MemoryBroker::new()))
        },
        #[cfg(feature = "redis")]
        BrokerBackend::Redis => {
            use pubrelay_broker::{RedisBroker, RedisOptions};

            let password = cfg.resolve_password().with_context(|| {
                format!(
                    "broker password required: set broker.password or {}",
                    BrokerConfig::PASSWORD_ENV
                )
            })?;
            let opts = RedisOptions {
                host: cfg.host.clone(),
                port: cfg.port,
                db: cfg.db,
                password: Some(secrecy::Secret::new(password)),
            };
            let broker = RedisBroker::connect(&opts)
                .await
                .with_context(|| format!("broker unreachable at {}", opts.display_addr()))?;
            Ok(Arc::new(broker))
        },
        #[cfg(not(feature = "redis"))]
        BrokerBackend::Redis => anyhow::bail!("this build has no redis support"),
    }
}

/// Publish mode is on when the channels file exists and loads.
fn open_publisher(cfg: &PublishConfig, broker: &Arc<dyn Broker>) -> Option<PublishGateway> {
    if !cfg.channels_file.exists() {
        debug!(path = %cfg.channels_file.display(), "no channels file, subscribe mode");
        return None;
    }
    match ChannelMap::load(&cfg.channels_file, &cfg.prefix) {
        Ok(channels) => {
            let (gateway, _task) = PublishGateway::start(channels, Arc::clone(broker), cfg.queue);
            Some(gateway)
        },
        Err(e) => {
            warn!(error = %e, "channels file unusable, falling back to subscribe mode");
            None
        },
    }
}

/// Start the gateway HTTP + WebSocket server.
pub async fn start_gateway(config: RelayConfig) -> anyhow::Result<()> {
    let broker = connect_broker(&config.broker).await?;
    let identities = IdentityGate::load(&config.identity.users_file)?;

    let plugins = ProviderRegistry::builtin().load(&config.plugins);
    let plugin_summary = if plugins.is_empty() {
        "none".to_string()
    } else {
        plugins
            .describe()
            .iter()
            .map(|(name, version)| format!("{name} {version}"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let publisher = open_publisher(&config.publish, &broker);
    let published = publisher.as_ref().map_or(0, |p| p.channels().len());

    let state = GatewayState::new(identities, broker, plugins, publisher, StateOptions {
        ticket_ttl_secs: config.tickets.ttl_secs,
        write_queue: config.connections.write_queue,
    });
    let app = build_gateway_app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind((config.server.bind.as_str(), config.server.port))
        .await
        .with_context(|| {
            format!(
                "cannot bind {}:{}",
                config.server.bind, config.server.port
            )
        })?;
    let addr = listener.local_addr()?;

    // Startup banner.
    let mut lines = vec![
        format!("pubrelay v{}", state.version),
        format!(
            "protocol v{}, {} mode, listening on {}",
            pubrelay_protocol::PROTOCOL_VERSION,
            state.mode.as_str(),
            addr
        ),
        format!("{} users", state.identities.user_count().await),
        format!("plugins: {plugin_summary}"),
    ];
    if state.mode == RelayMode::Publish {
        lines.push(format!("{published} publish channels"));
    }
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// Anonymous callers get counts only. The per-stream snapshot names
/// principals and peer addresses, so it needs valid credentials.
async fn health_handler(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let mut health = serde_json::json!({
        "status": "ok",
        "version": state.version,
        "mode": state.mode,
        "connections": state.connections.count().await,
    });
    if headers.contains_key(header::AUTHORIZATION)
        && state.identities.authenticate(&headers).await.is_ok()
    {
        health["streams"] = serde_json::json!(state.connections.snapshot().await);
    }
    Json(health)
}

async fn subscribe_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(channel): Path<String>,
    headers: HeaderMap,
) -> Result<String, GatewayError> {
    let principal = state.identities.authenticate(&headers).await?;
    let ticket = state.tickets.issue(channel, addr, principal).await;
    Ok(ticket.to_string())
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, state, addr, query))
}

async fn list_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    state.identities.authenticate(&headers).await?;
    let Query(pairs) = query.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    // A repeated parameter keeps its first value.
    let mut params = HashMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        params.entry(name).or_insert(value);
    }
    let body = list::serve_list(state.broker.as_ref(), &state.plugins, &key, params).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body))
}

async fn publish_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, GatewayError> {
    let principal = state.identities.authenticate(&headers).await?;
    let Some(publisher) = &state.publisher else {
        return Err(GatewayError::BadRequest("not in publish mode".into()));
    };
    let body = String::from_utf8(body.to_vec())
        .map_err(|_| GatewayError::BadRequest("body is not utf-8".into()))?;
    publisher.publish(id, body, principal).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn refresh_handler(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let presented = headers.get(REFRESH_HEADER).and_then(|v| v.to_str().ok());
    if presented == Some(refresh_token(now).as_str()) {
        if let Ok(users) = state.identities.reload().await {
            info!(users, "identity table refreshed");
        }
    } else {
        debug!("refresh without a valid token ignored");
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use {
        super::*,
        axum::{body::Body, extract::connect_info::MockConnectInfo, http::Request},
        base64::{Engine, engine::general_purpose::STANDARD},
        tower::ServiceExt,
        uuid::Uuid,
    };

    fn peer() -> SocketAddr {
        "1.2.3.4:9999".parse().unwrap()
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    fn subscribe_state(broker: Arc<MemoryBroker>) -> AppState {
        GatewayState::new(
            IdentityGate::from_pairs([("alice", "s3cret")]),
            broker,
            ProviderRegistry::builtin().load(&[]),
            None,
            StateOptions::default(),
        )
    }

    fn app(state: AppState) -> Router {
        build_gateway_app(state).layer(MockConnectInfo(peer()))
    }

    async fn body_text(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn subscribe_issues_ticket_bound_to_caller() {
        let state = subscribe_state(Arc::new(MemoryBroker::new()));
        let resp = app(Arc::clone(&state))
            .oneshot(
                Request::post("/sub/temps")
                    .header(header::AUTHORIZATION, basic("alice", "s3cret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let ticket = Uuid::parse_str(&body_text(resp).await).unwrap();
        let other_port: SocketAddr = "1.2.3.4:5555".parse().unwrap();
        let redeemed = state.tickets.consume(ticket, other_port).await.unwrap();
        assert_eq!(redeemed.channel, "temps");
        assert_eq!(redeemed.principal.user(), "alice");
    }

    #[tokio::test]
    async fn bad_credentials_get_an_empty_400() {
        let state = subscribe_state(Arc::new(MemoryBroker::new()));
        for auth in [None, Some(basic("alice", "nope")), Some("Basic %%%".to_string())] {
            let mut req = Request::get("/sub/temps");
            if let Some(auth) = auth {
                req = req.header(header::AUTHORIZATION, auth);
            }
            let resp = app(Arc::clone(&state))
                .oneshot(req.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert!(body_text(resp).await.is_empty());
        }
        assert_eq!(state.tickets.pending_count().await, 0);
    }

    #[tokio::test]
    async fn list_returns_json_slice() {
        let broker = Arc::new(MemoryBroker::new());
        for i in 0..5 {
            broker.push_front("readings", format!("r{i}")).await;
        }
        let resp = app(subscribe_state(Arc::clone(&broker)))
            .oneshot(
                Request::get("/list/readings?start=1&end=3")
                    .header(header::AUTHORIZATION, basic("alice", "s3cret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let entries: Vec<String> = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(entries, ["r3", "r2"]);
    }

    #[tokio::test]
    async fn repeated_list_parameter_keeps_first_value() {
        let broker = Arc::new(MemoryBroker::new());
        for i in 0..5 {
            broker.push_front("readings", format!("r{i}")).await;
        }
        let resp = app(subscribe_state(Arc::clone(&broker)))
            .oneshot(
                Request::get("/list/readings?start=1&start=3&end=3")
                    .header(header::AUTHORIZATION, basic("alice", "s3cret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let entries: Vec<String> = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(entries, ["r3", "r2"]);
    }

    #[tokio::test]
    async fn list_rejects_bad_range_and_missing_auth() {
        let state = subscribe_state(Arc::new(MemoryBroker::new()));
        let resp = app(Arc::clone(&state))
            .oneshot(
                Request::get("/list/readings?start=4&end=2")
                    .header(header::AUTHORIZATION, basic("alice", "s3cret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app(state)
            .oneshot(Request::get("/list/readings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn preflight_is_answered() {
        let state = subscribe_state(Arc::new(MemoryBroker::new()));
        let resp = app(state)
            .oneshot(
                Request::options("/sub/temps")
                    .header(header::ORIGIN, "https://dash.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn refresh_reloads_only_with_current_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, r#"{"alice":"one"}"#).unwrap();
        let state = GatewayState::new(
            IdentityGate::load(&path).unwrap(),
            Arc::new(MemoryBroker::new()),
            ProviderRegistry::builtin().load(&[]),
            None,
            StateOptions::default(),
        );
        std::fs::write(&path, r#"{"alice":"one","bob":"two"}"#).unwrap();

        let resp = app(Arc::clone(&state))
            .oneshot(
                Request::get("/refresh")
                    .header(REFRESH_HEADER, "12")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.identities.user_count().await, 1);

        // The token rotates every ten seconds; retry once across a boundary.
        for _ in 0..2 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs();
            let resp = app(Arc::clone(&state))
                .oneshot(
                    Request::post("/refresh")
                        .header(REFRESH_HEADER, refresh_token(now))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            if state.identities.user_count().await == 2 {
                break;
            }
        }
        assert_eq!(state.identities.user_count().await, 2);
    }

    #[tokio::test]
    async fn health_reports_mode_and_connections() {
        let state = subscribe_state(Arc::new(MemoryBroker::new()));
        let resp = app(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["mode"], "subscribe");
        assert_eq!(health["connections"], 0);
    }

    struct IdleWriter;

    #[async_trait::async_trait]
    impl crate::connections::StreamWriter for IdleWriter {
        async fn write_text(&mut self, _text: String) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct IdleReader;

    #[async_trait::async_trait]
    impl crate::connections::StreamReader for IdleReader {
        async fn read_frame(&mut self) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn health_shows_streams_only_to_authenticated_callers() {
        let broker = Arc::new(MemoryBroker::new());
        let state = subscribe_state(Arc::clone(&broker));
        let sub = broker.subscribe("secret-channel").await.unwrap();
        state
            .connections
            .register(
                "10.0.0.7:4444".parse().unwrap(),
                "secret-channel",
                crate::auth::Principal::new("alice"),
                IdleWriter,
                IdleReader,
                sub,
            )
            .await;

        let resp = app(Arc::clone(&state))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_text(resp).await;
        let health: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["connections"], 1);
        assert!(health.get("streams").is_none());
        for secret in ["alice", "10.0.0.7", "secret-channel"] {
            assert!(!body.contains(secret), "{secret} exposed in {body}");
        }

        let resp = app(Arc::clone(&state))
            .oneshot(
                Request::get("/health")
                    .header(header::AUTHORIZATION, basic("alice", "wrong"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(!body_text(resp).await.contains("10.0.0.7"));

        let resp = app(state)
            .oneshot(
                Request::get("/health")
                    .header(header::AUTHORIZATION, basic("alice", "s3cret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        let streams = health["streams"].as_array().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0]["principal"], "alice");
        assert_eq!(streams[0]["addr"], "10.0.0.7:4444");
        assert_eq!(streams[0]["channel"], "secret-channel");
    }

    #[tokio::test]
    async fn publish_mode_serves_only_publish_routes() {
        let broker = Arc::new(MemoryBroker::new());
        let channels = ChannelMap::build(
            [("foo".to_string(), "pub-foo".to_string())].into(),
            "rhp",
            "host1",
        );
        let mut sub = broker.subscribe("rhp:host1::foo").await.unwrap();
        let (publisher, _task) = PublishGateway::start(channels, broker.clone(), 8);
        let state = GatewayState::new(
            IdentityGate::from_pairs([("alice", "s3cret")]),
            broker,
            ProviderRegistry::builtin().load(&[]),
            Some(publisher),
            StateOptions::default(),
        );

        let resp = app(Arc::clone(&state))
            .oneshot(
                Request::post("/pub/pub-foo")
                    .header(header::AUTHORIZATION, basic("alice", "s3cret"))
                    .body(Body::from("42"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let got = tokio::time::timeout(Duration::from_secs(2), sub.next_message())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("42"));

        let resp = app(Arc::clone(&state))
            .oneshot(
                Request::post("/pub/pub-foo")
                    .header(header::AUTHORIZATION, basic("alice", "bad"))
                    .body(Body::from("43"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app(state)
            .oneshot(
                Request::get("/sub/temps")
                    .header(header::AUTHORIZATION, basic("alice", "s3cret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
