//! Delivery Gateway - real-time WebSocket server
//!
//! `serve` runs the WebSocket and push gateway servers; `push` is a small
//! client for the push gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use delivery_gateway::auth::TokenVerifier;
use delivery_gateway::config::{Config, PUSH_RPC_POLICY, WS_INBOUND_POLICY};
use delivery_gateway::dispatch::{Dispatcher, EventSink, MemorySink};
use delivery_gateway::gateway::{self, AppState};
use delivery_gateway::hub::Hub;
use delivery_gateway::protocol::CLOSE_GOING_AWAY;
use delivery_gateway::push::{PushGatewayServer, PushGatewayService};
use delivery_gateway::ratelimit::{
    LimiterBackend, Limiters, MemoryRateLimiter, RateLimitPolicy, RateLimiter, spawn_sweeper,
};
use delivery_gateway::registry::{self, ConnectionRegistry, MemoryRegistry};
use delivery_gateway::rpc_client::PushClient;
use delivery_gateway::worker::{self, WorkerContext};

#[cfg(feature = "redis")]
use delivery_gateway::ratelimit::RedisRateLimiter;
#[cfg(feature = "redis")]
use delivery_gateway::registry::{RedisRegistry, connect_redis};

#[cfg(feature = "kafka")]
use delivery_gateway::dispatch::KafkaSink;

#[derive(Parser, Debug)]
#[command(name = "delivery-gateway")]
#[command(about = "Real-time WebSocket delivery gateway")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// Push a payload to one connection through a running gateway
    Push {
        /// Push gateway address
        #[arg(long, default_value = "127.0.0.1:50061")]
        addr: String,
        /// Target connection id
        #[arg(long)]
        connection: String,
        /// Payload, sent as-is
        #[arg(long)]
        payload: String,
    },
}

/// Shared Redis connection, when configured
#[derive(Clone, Default)]
struct RedisBackend {
    #[cfg(feature = "redis")]
    conn: Option<redis::aio::ConnectionManager>,
}

impl RedisBackend {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        #[cfg(feature = "redis")]
        {
            let conn = match &config.redis_url {
                Some(url) => {
                    let conn = connect_redis(url).await?;
                    info!(prefix = %config.redis_prefix, "redis connected");
                    Some(conn)
                }
                None => None,
            };
            return Ok(Self { conn });
        }

        #[cfg(not(feature = "redis"))]
        {
            if config.redis_url.is_some() {
                warn!("WSD_REDIS_URL is set but the redis feature is disabled");
            }
            Ok(Self::default())
        }
    }

    fn registry(&self, config: &Config) -> Arc<dyn ConnectionRegistry> {
        #[cfg(feature = "redis")]
        {
            if let Some(conn) = &self.conn {
                return Arc::new(RedisRegistry::new(
                    conn.clone(),
                    &config.redis_prefix,
                    config.registry_ttl,
                ));
            }
        }

        warn!("connection registry is process-local (no redis)");
        Arc::new(MemoryRegistry::new(config.registry_ttl))
    }

    fn limiter(&self, config: &Config, policy: &RateLimitPolicy) -> Option<Arc<dyn RateLimiter>> {
        #[cfg(feature = "redis")]
        {
            if let Some(conn) = &self.conn {
                return Some(Arc::new(RedisRateLimiter::new(
                    conn.clone(),
                    policy.clone(),
                    &config.redis_prefix,
                )));
            }
        }

        let _ = (config, policy);
        None
    }
}

fn build_limiters(config: &Config, redis: &RedisBackend, shutdown: &CancellationToken) -> Limiters {
    let mut limiters = Limiters::new();

    for policy in &config.rate_limits {
        if policy.backend == LimiterBackend::Redis {
            if let Some(limiter) = redis.limiter(config, policy) {
                limiters.insert(limiter);
                continue;
            }
            warn!(policy = %policy.name, "redis unavailable, using in-memory limiter");
        }

        let limiter = Arc::new(MemoryRateLimiter::new(policy.clone()));
        spawn_sweeper(limiter.clone(), policy.window.max(Duration::from_secs(1)), shutdown.clone());
        limiters.insert(limiter);
    }

    info!(limiters = ?limiters, "rate limiters ready");
    limiters
}

fn build_sink(config: &Config) -> anyhow::Result<Arc<dyn EventSink>> {
    #[cfg(feature = "kafka")]
    {
        if let Some(brokers) = &config.kafka_brokers {
            return Ok(Arc::new(KafkaSink::new(brokers, config.publish_timeout)?));
        }
    }

    #[cfg(not(feature = "kafka"))]
    {
        if config.kafka_brokers.is_some() {
            warn!("WSD_KAFKA_BROKERS is set but the kafka feature is disabled");
        }
    }

    warn!("events are published to the in-memory sink only");
    Ok(Arc::new(MemorySink::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize JSON logging
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Push {
            addr,
            connection,
            payload,
        } => push(&addr, &connection, payload).await,
    }
}

async fn push(addr: &str, connection: &str, payload: String) -> anyhow::Result<()> {
    let client = PushClient::connect(addr, Some(Duration::from_secs(5))).await?;
    let response = client.send_message(connection, payload.into_bytes()).await?;
    info!(success = response.success, message = %response.message, "push sent");
    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    info!("delivery-gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().context("failed to load config")?;
    let secret = config
        .token_secret
        .clone()
        .context("token secret missing")?;

    info!(
        instance = %config.instance_id,
        http = %config.http_addr,
        grpc = %config.grpc_addr,
        workers = config.worker_count,
        "starting gateway"
    );

    let shutdown = CancellationToken::new();

    let redis = RedisBackend::connect(&config).await?;
    let registry = redis.registry(&config);
    let limiters = build_limiters(&config, &redis, &shutdown);
    let dispatcher = Arc::new(Dispatcher::new(
        build_sink(&config)?,
        config.routes.clone(),
        config.publish_retries,
        config.publish_backoff,
    ));

    let (hub, lanes) = Hub::new(config.worker_count, config.channel_capacity, config.register_timeout);
    let hub = Arc::new(hub);

    let mut tasks = worker::spawn_pool(
        WorkerContext {
            hub: hub.clone(),
            registry: registry.clone(),
            dispatcher,
            instance_id: config.instance_id.clone(),
            max_connections_per_user: config.max_connections_per_user,
        },
        lanes,
        shutdown.clone(),
    );
    tasks.push(registry::spawn_heartbeat(
        registry.clone(),
        config.instance_id.clone(),
        config.registry_heartbeat,
        shutdown.clone(),
    ));

    let state = AppState {
        hub: hub.clone(),
        limiter: limiters.get(WS_INBOUND_POLICY),
        verifier: Arc::new(TokenVerifier::new(&secret)),
        client: config.client_settings(),
        socket: config.socket_limits(),
        instance_id: config.instance_id.clone(),
        shutdown: shutdown.clone(),
    };

    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!(addr = %config.http_addr, "websocket gateway listening");

    let http_shutdown = shutdown.clone();
    let http = tokio::spawn(async move {
        axum::serve(
            listener,
            gateway::router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
        .await
    });

    let grpc_addr: SocketAddr = config
        .grpc_addr
        .parse()
        .with_context(|| format!("invalid grpc address {}", config.grpc_addr))?;
    let push_service = PushGatewayService::new(hub.clone(), registry.clone(), limiters.get(PUSH_RPC_POLICY));
    let grpc_shutdown = shutdown.clone();
    let grpc = tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(PushGatewayServer::new(push_service))
            .serve_with_shutdown(grpc_addr, async move { grpc_shutdown.cancelled().await }),
    );
    info!(addr = %grpc_addr, "push gateway listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    // Close clients while workers still run, so unregisters reach the registry
    let closing = hub.close_all(CLOSE_GOING_AWAY, "server shutting down");
    info!(clients = closing, "closing client connections");
    let deadline = tokio::time::Instant::now() + config.write_timeout;
    while hub.client_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();

    // Anything still listed under this instance would otherwise wait for TTL expiry
    match registry.list_connections_for_instance(&config.instance_id).await {
        Ok(leftover) => {
            for conn_id in leftover {
                if let Err(e) = registry.remove_connection(&conn_id).await {
                    error!(conn_id = %conn_id, error = %e, "registry cleanup failed");
                }
            }
        }
        Err(e) => error!(error = %e, "registry cleanup failed"),
    }

    match http.await {
        Ok(Err(e)) => error!(error = %e, "http server error"),
        Err(e) => error!(error = %e, "http server task failed"),
        Ok(Ok(())) => {}
    }
    match grpc.await {
        Ok(Err(e)) => error!(error = %e, "grpc server error"),
        Err(e) => error!(error = %e, "grpc server task failed"),
        Ok(Ok(())) => {}
    }
    for task in tasks {
        let _ = task.await;
    }

    info!("gateway stopped");
    Ok(())
}
