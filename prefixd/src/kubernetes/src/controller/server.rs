use std::{sync::Arc, time::Duration};

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use prefixd_trace::init::{prepare_tracing, TraceConfig};
use prometheus::{Encoder, TextEncoder};

use crate::{
    context::State,
    crd::{
        prefix::{ClusterPrefix, Prefix},
        prefix_allocation::{ClusterPrefixAllocation, PrefixAllocation},
    },
};

use super::{
    allocator::Allocator, backoff::Backoff, config::Config, error::Error, metrics::Metrics,
    reconciler,
};

pub fn start(config: Config, trace: TraceConfig) -> Result<(), Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::StdIo)?
        .block_on(run(config, trace))
}

#[tracing::instrument(skip_all)]
async fn run(config: Config, trace_config: TraceConfig) -> Result<(), Error> {
    prepare_tracing(trace_config).map_err(Error::Trace)?;
    config.validate()?;

    // Initiatilize Kubernetes controller state
    let state = State::new("prefixd-controller");
    let metrics = Metrics::default()
        .register(&state.registry)
        .map_err(Error::Metrics)?;

    // Start web server
    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .service(index)
            .service(health)
            .service(ready)
            .service(metrics_)
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
    })
    .bind(format!("0.0.0.0:{}", config.http_port))?
    .shutdown_timeout(5);

    let backoff = Arc::new(Backoff::new(
        Duration::from_secs(config.backoff_initial),
        Duration::from_secs(config.backoff_max),
    ));
    let allocator = Arc::new(Allocator::new(backoff, config.allocation_timeout()));

    // Start reconcilers
    let prefix_state = state.clone();
    let prefix_config = config.clone();
    let prefix_allocator = allocator.clone();
    let prefix_metrics = metrics.clone();
    tokio::spawn(async move {
        reconciler::prefix::run::<Prefix>(
            prefix_state,
            prefix_config,
            prefix_allocator,
            prefix_metrics,
        )
        .await;
    });

    let ip_state = state.clone();
    let ip_config = config.clone();
    let ip_allocator = allocator.clone();
    let ip_metrics = metrics.clone();
    tokio::spawn(async move {
        reconciler::ip::run(ip_state, ip_config, ip_allocator, ip_metrics).await;
    });

    let scheduler_state = state.clone();
    let scheduler_config = config.clone();
    let scheduler_metrics = metrics.clone();
    tokio::spawn(async move {
        reconciler::prefix_allocation_scheduler::run::<PrefixAllocation>(
            scheduler_state,
            scheduler_config,
            scheduler_metrics,
        )
        .await;
    });

    if config.enable_cluster_prefix {
        let cluster_prefix_state = state.clone();
        let cluster_prefix_config = config.clone();
        let cluster_prefix_allocator = allocator.clone();
        let cluster_prefix_metrics = metrics.clone();
        tokio::spawn(async move {
            reconciler::prefix::run::<ClusterPrefix>(
                cluster_prefix_state,
                cluster_prefix_config,
                cluster_prefix_allocator,
                cluster_prefix_metrics,
            )
            .await;
        });

        let cluster_scheduler_state = state.clone();
        let cluster_scheduler_config = config.clone();
        let cluster_scheduler_metrics = metrics.clone();
        tokio::spawn(async move {
            reconciler::prefix_allocation_scheduler::run::<ClusterPrefixAllocation>(
                cluster_scheduler_state,
                cluster_scheduler_config,
                cluster_scheduler_metrics,
            )
            .await;
        });
    } else {
        tracing::info!(kind = "ClusterPrefix", "cluster scoped prefixes are disabled");
    }

    tracing::info!(port = config.http_port, "start server");
    server.run().await?;
    Ok(())
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}
