use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use notification_pipeline::{
    api::{self, AppState, RateLimit},
    clients::{
        bus::MessageBus,
        circuit_breaker::CircuitBreakerRegistry,
        database::PostgresAuditSink,
        email::{SmtpEmailClient, SmtpSettings},
        fcm::FcmClient,
        health::HealthChecker,
        lookup::LookupClient,
        provider::DeliveryProvider,
        rbmq::RabbitMqBus,
        redis::RedisStatusStore,
        store::StatusStore,
        template::TemplateServiceClient,
        user::UserServiceClient,
    },
    config::Config,
    dispatcher::Dispatcher,
    models::notification::Channel,
    status::{NullStatusSink, StatusSink, StatusTracker},
    worker::{ChannelWorker, RetryCounters, WorkerSettings},
};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn connect_audit_sink(config: &Config) -> Option<Arc<PostgresAuditSink>> {
    let url = config.database_url.as_deref()?;

    match PostgresAuditSink::connect(url).await {
        Ok(sink) => Some(Arc::new(sink)),
        Err(e) => {
            warn!(error = %e, "Audit database unavailable, status events will not be persisted");
            None
        }
    }
}

async fn push_provider(config: &Config) -> Result<Arc<dyn DeliveryProvider>, Error> {
    let client = match &config.fcm_access_token {
        Some(token) => FcmClient::with_static_token(
            &config.fcm_base_url,
            &config.fcm_project_id,
            config.http_timeout(),
            token.clone(),
        )?,
        None => {
            FcmClient::new(
                &config.fcm_base_url,
                &config.fcm_project_id,
                config.http_timeout(),
            )
            .await?
        }
    };

    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_json);

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let store: Arc<dyn StatusStore> = Arc::new(RedisStatusStore::connect(&config.redis_url).await?);
    let bus: Arc<dyn MessageBus> =
        Arc::new(RabbitMqBus::connect(&config.rabbitmq_url, config.topology()).await?);
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker_config()));

    let database = connect_audit_sink(&config).await;
    let sink: Arc<dyn StatusSink> = match &database {
        Some(database) => Arc::clone(database) as Arc<dyn StatusSink>,
        None => Arc::new(NullStatusSink),
    };
    let tracker = StatusTracker::new(Arc::clone(&store), sink, config.status_ttl());

    let users = UserServiceClient::new(LookupClient::new(
        &config.user_service_url,
        config.http_timeout(),
        config.lookup_retry_config(),
        breakers.get_or_create("user-service"),
    )?);
    let templates = TemplateServiceClient::new(LookupClient::new(
        &config.template_service_url,
        config.http_timeout(),
        config.lookup_retry_config(),
        breakers.get_or_create("template-service"),
    )?);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::new(users),
        Arc::new(templates),
        tracker.clone(),
        config.idempotency_ttl(),
    ));

    let email: Arc<dyn DeliveryProvider> = Arc::new(SmtpEmailClient::new(&SmtpSettings {
        host: config.smtp_host.clone(),
        port: config.smtp_port,
        username: config.smtp_username.clone(),
        password: config.smtp_password.clone(),
        from: config.smtp_from.clone(),
    })?);
    let push = push_provider(&config).await?;

    let shutdown = CancellationToken::new();
    let counters = Arc::new(RetryCounters::new());
    let settings = WorkerSettings {
        retry: config.retry_config(),
        concurrency: config.worker_concurrency,
        prefetch: config.prefetch_count,
    };

    let mut workers = JoinSet::new();
    for (channel, provider) in [(Channel::Email, email), (Channel::Push, push)] {
        let worker = Arc::new(ChannelWorker::new(
            channel,
            Arc::clone(&bus),
            tracker.clone(),
            provider,
            breakers.get_or_create(channel.provider_name()),
            Arc::clone(&counters),
            settings.clone(),
        ));
        workers.spawn(worker.run(shutdown.clone()));
    }

    let state = Arc::new(AppState {
        dispatcher,
        tracker,
        store: Arc::clone(&store),
        breakers: Arc::clone(&breakers),
        health_checker: HealthChecker::new(store, bus, breakers, database),
        rate_limit: RateLimit {
            max: config.rate_limit_max,
            window: std::time::Duration::from_secs(config.rate_limit_window_seconds),
        },
    });

    let listener = TcpListener::bind(("0.0.0.0", config.server_port)).await?;
    let server = tokio::spawn(api::serve(listener, state, shutdown.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
        Some(finished) = workers.join_next() => {
            error!(?finished, "Channel worker exited unexpectedly, shutting down");
        }
    }

    shutdown.cancel();

    while let Some(finished) = workers.join_next().await {
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Channel worker failed"),
            Err(e) => error!(error = %e, "Channel worker task aborted"),
        }
    }

    server.await??;
    info!("Shutdown complete");

    Ok(())
}
