mod resolver;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{any, get, Router};
use clap::{crate_authors, crate_description, crate_version, Parser};
use guildnet_core::controller::State as ControllerState;
use guildnet_core::telemetry;
use guildnet_db::testing::FakeBackend;
use guildnet_db::DbManager;
use guildnet_rbac::Rbac;
use guildnet_runtime::{DbDialer, Registry as ClusterRegistry};
use kube::Config;
use prometheus_client::registry::Registry as MetricsRegistry;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use resolver::{FileKubeconfigResolver, NoMeshFactory, WorkspaceResolver};

#[derive(Parser, Debug)]
#[command(
    name = "guildnetd",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,guildnet=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// Directory of per-cluster state (KV store buckets)
    #[arg(long, default_value = "/var/lib/guildnetd", env)]
    state_dir: PathBuf,

    /// Directory of `<cluster-id>.yaml` kubeconfig files for member clusters
    #[arg(long, default_value = "/etc/guildnetd/kubeconfigs", env)]
    kubeconfig_dir: PathBuf,

    /// Namespace Workspace custom resources are reconciled in
    #[arg(long, default_value = "guildnet-workspaces", env)]
    workspace_namespace: String,

    /// Normalized id of the cluster this process primarily serves the API for
    #[arg(long, default_value = "local", env)]
    cluster_id: String,

    /// RethinkDB address for the primary cluster's database manager. Left
    /// empty, an in-memory fake backend is used (single-process dev mode).
    #[arg(long, default_value = "", env = "RDB_ADDR")]
    rdb_addr: String,

    #[arg(long, default_value = "admin", env = "RDB_USER")]
    rdb_user: String,

    #[arg(long, default_value = "", env = "RDB_PASS")]
    rdb_pass: String,

    /// Origin allowed to call the API/proxy from a browser (CORS). Left
    /// empty, any origin is mirrored back (development mode).
    #[arg(long, default_value = "", env)]
    frontend_origin: String,
}

fn cors_layer(frontend_origin: &str) -> tower_http::cors::CorsLayer {
    use axum::http::Method;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
    use tower_http::cors::{AllowOrigin, CorsLayer};

    let allow_origin = if frontend_origin.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::exact(
            HeaderValue::from_str(frontend_origin).expect("FRONTEND_ORIGIN is a valid header value"),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            "x-request-id".parse().unwrap(),
            "x-principal".parse().unwrap(),
            "x-org-id".parse().unwrap(),
        ])
}

async fn metrics(State(state): State<ControllerState>) -> impl IntoResponse {
    match state.metrics_text() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(msg = "failed to encode metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn livez() -> impl IntoResponse {
    Json("ok")
}

/// Unlike `livez` (process is alive), this reflects whether the process is
/// still accepting new work: flipped to `false` the moment graceful
/// shutdown begins, so a load balancer stops routing new requests here
/// while in-flight ones drain.
async fn readyz(State(ready): State<Arc<AtomicBool>>) -> impl IntoResponse {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json("ok")).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json("draining")).into_response()
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn rdb_dialer() -> DbDialer {
    Arc::new(|addr: String, user: String, pass: String| {
        Box::pin(async move {
            let backend = guildnet_db::RethinkDbBackend::connect(&addr, &user, &pass).await?;
            Ok(DbManager::new(Arc::new(backend)))
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<DbManager, guildnet_db::Error>> + Send>>
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(&args.log_filter, args.log_format);

    let mut registry = MetricsRegistry::default();
    let kube_config = Config::infer().await?;
    let client = guildnet_k8s_util::client::new_client_with_metrics(kube_config, &mut registry).await?;
    let api_metrics = guildnet_api::ApiMetrics::register(&mut registry);

    let controllers = [guildnet_workspace::controller::CONTROLLER_ID];
    let state = ControllerState::new(registry, &controllers);

    let workspace_controller = guildnet_workspace::controller::run(state.clone(), client.clone(), now_unix);

    let cluster_registry = ClusterRegistry::new(
        args.state_dir.clone(),
        Arc::new(FileKubeconfigResolver::new(args.kubeconfig_dir.clone())),
        Arc::new(NoMeshFactory),
        rdb_dialer(),
        guildnet_runtime::DEFAULT_RDB_PING_INTERVAL,
        Arc::new(tokio::sync::Mutex::new(MetricsRegistry::default())),
    );

    let (db, mesh) = if args.rdb_addr.is_empty() {
        tracing::warn!(msg = "no rdb_addr configured, serving the API against an in-memory fake backend");
        (Arc::new(DbManager::new(Arc::new(FakeBackend::new()))), None)
    } else {
        let instance = cluster_registry.get(&args.cluster_id).await?;
        instance.ensure_rdb(&args.rdb_addr, &args.rdb_user, &args.rdb_pass).await?;
        let db = instance.rdb().await.expect("ensure_rdb just connected it");
        (db, instance.mesh.clone())
    };

    let rbac = Arc::new(Rbac::new());
    let app_state = guildnet_api::AppState::new(db, rbac, api_metrics);

    let proxy_state = Arc::new(guildnet_proxy::ProxyState {
        mesh,
        resolver: Arc::new(WorkspaceResolver {
            client: client.clone(),
            namespace: args.workspace_namespace.clone(),
        }),
        // No cluster in this deployment has wired a `kube::Client` up as an
        // `ApiServerProxyTransport` yet; `/api/`, `/apis/` requests fall
        // back to the mesh or direct transport like any other path.
        api_proxy: None,
    });

    let proxy_router = Router::new()
        .route("/proxy", any(guildnet_proxy::proxy_handler))
        .route("/proxy/{*rest}", any(guildnet_proxy::proxy_handler))
        .with_state(proxy_state);

    let admin_router = Router::new()
        .route("/metrics", get(metrics))
        .route("/livez", get(livez))
        .with_state(state.clone());

    let ready = Arc::new(AtomicBool::new(true));
    let readyz_router = Router::new()
        .route("/readyz", get(readyz))
        .with_state(ready.clone());

    let app = guildnet_api::router(app_state)
        .merge(proxy_router)
        .merge(admin_router)
        .merge(readyz_router)
        .layer(cors_layer(&args.frontend_origin));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(ready.clone()));

    tokio::select! {
        _ = workspace_controller => {},
        result = server => { result?; },
    }
    Ok(())
}

async fn shutdown_signal(ready: Arc<AtomicBool>) {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
    ready.store(false, Ordering::SeqCst);
}
