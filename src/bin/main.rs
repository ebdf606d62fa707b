use std::sync::Arc;

use huddle::groups::{GroupLayer, LocalGroups, NatsConnection, NatsGroups};
use huddle::identity::{CachedIdentityResolver, IdentityResolver, JwtIdentityResolver};
use huddle::room::{DistributedLock, RedisLockBackend, RedisRoomStore, RoomRegistry};
use huddle::server::{load_tls_config, serve};
use huddle::settings::load_config;
use huddle::signaling::SignalingContext;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio_native_tls::TlsAcceptor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = load_config()?;
    let jwt_secret = settings
        .jwt_secret
        .clone()
        .ok_or("JWT_SECRET must be set")?;

    // Set up TLS if not disabled
    let tls_acceptor = if settings.tls_enabled {
        Some(TlsAcceptor::from(load_tls_config(
            &settings.tls_cert_path,
            &settings.tls_key_path,
        )?))
    } else {
        None
    };

    // Room store and creation lock share one Redis client
    let redis_client = Arc::new(redis::Client::open(settings.redis_url.as_str())?);
    let lock = DistributedLock::new(Arc::new(RedisLockBackend::new(redis_client.clone())))
        .with_blocking_timeout(settings.lock_timeout)
        .with_lease(settings.lock_lease);
    let registry = Arc::new(RoomRegistry::new(
        Arc::new(RedisRoomStore::new(redis_client)),
        lock,
        settings.room_namespace.clone(),
    ));

    let groups: Arc<dyn GroupLayer> = match &settings.nats_url {
        Some(url) => {
            let nats_connection = Arc::new(NatsConnection::new(url.clone()));
            nats_connection.spawn_reconnect();
            Arc::new(NatsGroups::new(
                nats_connection,
                settings.nats_subject_prefix.clone(),
            ))
        }
        None => {
            warn!("NATS_URL not set; groups are local to this process");
            Arc::new(LocalGroups::new())
        }
    };

    let identity: Arc<dyn IdentityResolver> = Arc::new(CachedIdentityResolver::new(
        Arc::new(JwtIdentityResolver::new(jwt_secret.as_bytes())),
        settings.identity_cache_ttl,
    ));

    let context = SignalingContext {
        registry,
        groups,
        identity,
    };

    // Bind the server
    let listener = TcpListener::bind(format!("0.0.0.0:{}", settings.port)).await?;
    info!("Listening on: 0.0.0.0:{}", settings.port);

    serve(listener, tls_acceptor, context).await;

    Ok(())
}
