//! # braid-server
//!
//! Serves in-memory text resources at any path over Braid-HTTP.
//!
//! - `GET` returns the resource as an update (`[{"text": ...}]`); with
//!   `Subscribe` the response stays open and receives every later `PUT`.
//! - `PUT` takes a plain body, or from a peer exactly one `json` patch with
//!   range `[-0:-0]` whose content is `{"text": ...}`.
//!
//! ```text
//! curl -H 'Subscribe: true' -H 'Peer: a' http://127.0.0.1:8888/note
//! curl -X PUT -H 'Peer: b' --data 'hi' http://127.0.0.1:8888/note
//! ```

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use braid_http::server::{MemorySubscriptionStore, SubscriptionRegistry, SubscriptionStore};
use braid_http::{
    BraidLayer, BraidRequest, BraidResponse, Result, ServerConfig, SubscriptionOptions, Update,
    Version,
};
use clap::Parser;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "braid-server")]
#[command(about = "Serve in-memory resources over Braid-HTTP")]
struct Cli {
    #[arg(short, long, default_value = "8888")]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Do not serve multiplexers
    #[arg(long)]
    no_multiplex: bool,

    /// Close direct responses idle for this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
}

struct Resource {
    text: String,
    version: u64,
}

#[derive(Clone)]
struct AppState {
    resources: Arc<RwLock<HashMap<String, Resource>>>,
    subscriptions: SubscriptionRegistry,
    store: Arc<dyn SubscriptionStore>,
}

fn representation(text: &str, version: u64) -> Update {
    Update::body(json!([{ "text": text }]).to_string()).with_version(Version::new(version.to_string()))
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}

async fn resource(State(app): State<AppState>, res: BraidResponse, req: BraidRequest) -> Result<Response> {
    match *req.method() {
        Method::GET => get(app, res, req).await,
        Method::PUT => put(app, req).await,
        _ => Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    }
}

async fn get(app: AppState, res: BraidResponse, req: BraidRequest) -> Result<Response> {
    let path = req.uri().path().to_string();
    let current = app
        .resources
        .read()
        .get(&path)
        .map(|r| (r.text.clone(), r.version));
    let Some((text, version)) = current else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    if let Some(mode) = req.subscribe() {
        let peer = req
            .peer()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let cookie = req
            .headers()
            .get(axum::http::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&peer)
            .to_string();

        let on_close = {
            let (subscriptions, store) = (app.subscriptions.clone(), app.store.clone());
            let (peer, path, cookie, res) = (peer.clone(), path.clone(), cookie.clone(), res.clone());
            move || {
                subscriptions.remove(&peer, &path, &res);
                tracing::info!("Subscription closed for {} at {}", peer, path);
                tokio::spawn(async move {
                    if let Err(e) = store.delete(&cookie, &path).await {
                        tracing::warn!("Could not forget subscription: {}", e);
                    }
                });
            }
        };
        res.start_subscription(SubscriptionOptions::new().on_close(on_close))?;
        app.subscriptions.insert(&peer, &path, res.clone());
        app.store.set(&cookie, &path, mode.as_header_value()).await?;
        tracing::info!("Subscribing {} at {}", peer, path);
    }

    res.send_update(&representation(&text, version))?;
    Ok(().into_response())
}

async fn put(app: AppState, req: BraidRequest) -> Result<Response> {
    let path = req.uri().path().to_string();
    let update = req.parse_update().await?;

    let text = match (req.peer(), update.patches.as_deref()) {
        (_, None) => update.body_text().unwrap_or_default(),
        (None, Some(_)) => return Ok(bad_request("Patches require a Peer header")),
        (Some(_), Some([patch])) => {
            if patch.range != "[-0:-0]" {
                return Ok(bad_request("Patch range must be '[-0:-0]'"));
            }
            if patch.unit != "json" {
                return Ok(bad_request("Patch unit must be 'json'"));
            }
            match patch.content_json()?.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => return Ok(bad_request("Patch content must be {\"text\": ...}")),
            }
        }
        (Some(_), Some(_)) => return Ok(bad_request("Expected one patch")),
    };

    let (created, version) = {
        let mut resources = app.resources.write();
        let created = !resources.contains_key(&path);
        let entry = resources.entry(path.clone()).or_insert(Resource {
            text: String::new(),
            version: 0,
        });
        entry.text = text.clone();
        entry.version += 1;
        (created, entry.version)
    };

    let sent = app
        .subscriptions
        .broadcast(&path, req.peer(), &representation(&text, version));
    tracing::info!("{} updated to version {}, sent to {} subscribers", path, version, sent);

    Ok(if created {
        StatusCode::CREATED.into_response()
    } else {
        StatusCode::OK.into_response()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ServerConfig {
        enable_multiplex: !cli.no_multiplex,
        idle_timeout: cli.idle_timeout_secs.map(Duration::from_secs),
        ..Default::default()
    };

    let state = AppState {
        resources: Arc::new(RwLock::new(HashMap::new())),
        subscriptions: SubscriptionRegistry::new(),
        store: Arc::new(MemorySubscriptionStore::from_config(&config)),
    };
    let layer = BraidLayer::with_config(config);
    let app = Router::new()
        .fallback(resource)
        .layer(layer.middleware())
        .with_state(state);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
