//! Wiring of each fleet component from configuration
//!
//! Every builder returns the component's HTTP router together with the
//! background services it needs; `main` serves the router and runs the
//! services until shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use kuba_fleet::{
    broker::{LogBroker, MemoryBroker, RestBroker},
    client::{
        ConfigServiceClient, HttpLeafClient, RangeAssignerClient, RootMixerClient,
        ZoneIndexClient, ZoneMixerClient,
    },
    config::{ApplicationConfig, SinkKind},
    index::{FieldHintsIndex, HintsIndex},
    ingestion::IngestionRouter,
    leaf::{
        AssignmentSyncTask, GraceSweepTask, HeartbeatTask, HintFlushTask, LeafAgent, LeafStore,
        RemoteConfigTask,
    },
    mixer::{RootMixer, ZoneClient, ZoneMixer},
    range::{AssignmentSource, FailureDetector, RangeAssigner, SnapshotCache, SnapshotRefresher},
    scheduler::{
        BrokerSink, ResultSink, SchedulerTicker, StandingQueryScheduler, SystemClock, TracingSink,
    },
    server::{
        self, AssignerState, IndexState, IngestState, LeafState, RootMixerState, SchedulerState,
        ServerContext, ZoneMixerState,
    },
    services::{Periodic, Service, ServiceManager},
    Error, Result,
};
use tracing::{info, warn};

/// A component ready to serve
pub struct Component {
    pub router: Router,
    pub services: ServiceManager,
    /// Set for leaves, which leave the fleet on shutdown
    pub agent: Option<Arc<LeafAgent>>,
}

impl Component {
    fn new(router: Router, services: ServiceManager) -> Self {
        Self {
            router,
            services,
            agent: None,
        }
    }
}

fn service_manager(config: &ApplicationConfig) -> ServiceManager {
    ServiceManager::new(Duration::from_secs(config.server.shutdown_timeout_secs))
}

fn context(component: &'static str, config: &ApplicationConfig) -> Result<ServerContext> {
    ServerContext::new(component, config.default_deadline())
}

/// Recovery log broker: REST when configured, in-memory otherwise
pub fn recovery_broker(config: &ApplicationConfig) -> Result<Arc<dyn LogBroker>> {
    match &config.cluster.recovery_log_broker {
        Some(url) => {
            info!(broker = %url, "Using REST recovery log broker");
            Ok(Arc::new(RestBroker::new(url)?))
        },
        None => {
            warn!("RECOVERY_LOG_BROKER is not set; using an in-memory log that does not survive restarts");
            Ok(Arc::new(MemoryBroker::default()))
        },
    }
}

/// Pull remote overrides at start-up; failures only cost the overrides
pub async fn apply_remote_config(config: &mut ApplicationConfig) -> Option<Arc<ConfigServiceClient>> {
    let url = config.cluster.config_url.clone()?;
    let client = match ConfigServiceClient::new(&url) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!(error = %e, "Remote configuration client unavailable");
            return None;
        },
    };
    match client.apply_to(config).await {
        Ok(applied) => info!(applied, config_url = %url, "Remote configuration applied"),
        Err(e) => warn!(error = %e, config_url = %url, "Remote configuration not reachable; keeping local values"),
    }
    Some(client)
}

fn assignment_cache(config: &ApplicationConfig, services: &ServiceManager) -> Result<Arc<SnapshotCache>> {
    let source: Arc<dyn AssignmentSource> =
        Arc::new(RangeAssignerClient::new(&config.cluster.range_assigner_url)?);
    let cache = Arc::new(SnapshotCache::new(source));
    let refresher = SnapshotRefresher::new(
        cache.clone(),
        Duration::from_secs(config.router.refresh_interval_secs.max(1)),
    );
    register(services, Periodic::service(Arc::new(refresher)))?;
    Ok(cache)
}

fn register(services: &ServiceManager, service: Arc<dyn Service>) -> Result<()> {
    services
        .register(service)
        .map_err(|e| Error::Internal(e.to_string()))
}

// =============================================================================
// Builders
// =============================================================================

pub fn range_assigner(config: &ApplicationConfig) -> Result<Component> {
    let index: Arc<dyn HintsIndex> = Arc::new(ZoneIndexClient::new(&config.cluster.zone_index_url)?);
    let assigner =
        Arc::new(RangeAssigner::new(config.range_assigner.clone()).with_hints_index(index));

    let services = service_manager(config);
    register(&services, Periodic::service(Arc::new(FailureDetector::new(assigner.clone()))))?;

    let state = Arc::new(AssignerState {
        context: context("range-assigner", config)?,
        assigner,
    });
    Ok(Component::new(server::assigner::router(state), services))
}

pub async fn leaf(
    config: &ApplicationConfig,
    remote: Option<Arc<ConfigServiceClient>>,
) -> Result<Component> {
    let store = Arc::new(LeafStore::new(&config.leaf, recovery_broker(config)?));
    let source: Arc<dyn AssignmentSource> =
        Arc::new(RangeAssignerClient::new(&config.cluster.range_assigner_url)?);
    let index: Arc<dyn HintsIndex> = Arc::new(ZoneIndexClient::new(&config.cluster.zone_index_url)?);
    let agent = Arc::new(LeafAgent::new(
        store.clone(),
        source,
        index,
        config.leaf_advertise_addr(),
    ));

    match agent.register().await {
        Ok(registration) => info!(
            leaf = %registration.leaf_id,
            generation = registration.generation,
            ranges = registration.assigned_ranges.len(),
            "Leaf registered"
        ),
        Err(e) => warn!(error = %e, "Initial registration failed; heartbeat will retry"),
    }

    let services = service_manager(config);
    let heartbeat = Duration::from_millis(config.range_assigner.heartbeat_interval_ms);
    register(&services, Periodic::service(Arc::new(HeartbeatTask::new(agent.clone(), heartbeat))))?;
    register(
        &services,
        Periodic::service(Arc::new(AssignmentSyncTask::new(
            agent.clone(),
            Duration::from_millis(config.leaf.assignment_poll_ms.max(1)),
        ))),
    )?;
    register(
        &services,
        Periodic::service(Arc::new(HintFlushTask::new(
            agent.clone(),
            Duration::from_millis(config.leaf.hint_flush_interval_ms.max(1)),
        ))),
    )?;
    register(&services, Periodic::service(Arc::new(GraceSweepTask::new(agent.clone()))))?;
    if let Some(client) = remote {
        register(
            &services,
            Periodic::service(Arc::new(RemoteConfigTask::new(
                store.clone(),
                client,
                Duration::from_secs(config.leaf.remote_config_poll_secs.max(1)),
            ))),
        )?;
    }

    let state = Arc::new(LeafState {
        context: context("leaf", config)?,
        store,
    });
    Ok(Component {
        router: server::leaf::router(state),
        services,
        agent: Some(agent),
    })
}

pub fn zone_index(config: &ApplicationConfig) -> Result<Component> {
    let state = Arc::new(IndexState {
        context: context("zone-index", config)?,
        index: Arc::new(FieldHintsIndex::new()),
    });
    Ok(Component::new(server::index::router(state), service_manager(config)))
}

pub fn ingest_router(config: &ApplicationConfig) -> Result<Component> {
    let services = service_manager(config);
    let cache = assignment_cache(config, &services)?;
    let router = Arc::new(IngestionRouter::new(
        cache,
        Arc::new(HttpLeafClient::new()?),
        config.router.clone(),
    ));
    let state = Arc::new(IngestState {
        context: context("ingest-router", config)?,
        router,
    });
    Ok(Component::new(server::ingest::router(state), services))
}

pub fn zone_mixer(config: &ApplicationConfig) -> Result<Component> {
    let services = service_manager(config);
    let cache = assignment_cache(config, &services)?;
    let mixer = Arc::new(ZoneMixer::new(
        config.cluster.zone_id.clone(),
        cache,
        Arc::new(ZoneIndexClient::new(&config.cluster.zone_index_url)?),
        Arc::new(HttpLeafClient::new()?),
        config.mixer.clone(),
    ));
    let state = Arc::new(ZoneMixerState {
        context: context("zone-mixer", config)?,
        mixer,
    });
    Ok(Component::new(server::mixer::zone_router(state), services))
}

pub fn root_mixer(config: &ApplicationConfig) -> Result<Component> {
    let zones = config
        .cluster
        .zone_mixers
        .iter()
        .map(|endpoint| {
            let client: Arc<dyn ZoneClient> = Arc::new(ZoneMixerClient::new(&endpoint.url)?);
            Ok((endpoint.zone.clone(), client))
        })
        .collect::<Result<Vec<_>>>()?;
    if zones.is_empty() {
        warn!("No zone mixers configured; every query will return an empty result");
    }
    let state = Arc::new(RootMixerState {
        context: context("root-mixer", config)?,
        mixer: Arc::new(RootMixer::new(zones, config.mixer.clone())),
    });
    Ok(Component::new(server::mixer::root_router(state), service_manager(config)))
}

pub fn scheduler(config: &ApplicationConfig) -> Result<Component> {
    let sink: Arc<dyn ResultSink> = match config.scheduler.sink {
        SinkKind::Log => Arc::new(TracingSink),
        SinkKind::Broker => Arc::new(BrokerSink::new(recovery_broker(config)?)),
    };
    let scheduler = Arc::new(StandingQueryScheduler::new(
        &config.scheduler,
        Arc::new(RootMixerClient::new(&config.cluster.root_mixer_url)?),
        sink,
        Arc::new(SystemClock),
    ));

    let services = service_manager(config);
    register(
        &services,
        Periodic::service(Arc::new(SchedulerTicker::new(
            scheduler.clone(),
            Duration::from_millis(config.scheduler.tick_ms),
        ))),
    )?;

    let state = Arc::new(SchedulerState {
        context: context("scheduler", config)?,
        scheduler,
    });
    Ok(Component::new(server::scheduler::router(state), services))
}
