//! Offramp Gateway - Main Entry Point
//!
//! Hosts the HTTP surface around a worker pool. Embedders normally build
//! their own pool with `Supervisor::start` and their own callables; run
//! standalone, this binary binds a demo model to each worker so the
//! endpoints can be exercised end to end.

use offramp_common::{OfframpConfig, Result};
use offramp_core::{CallOutcome, Callable, ChunkPayload, Supervisor};
use offramp_gateway::AppState;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Demo model: generates token text, dummy audio bytes, or a single
/// greeting, selected by the `mode` named argument
struct DemoModel;

impl Callable for DemoModel {
    fn invoke(&mut self, args: &[Value], kwargs: &Map<String, Value>) -> Result<CallOutcome> {
        let input = args
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        match kwargs.get("mode").and_then(|v| v.as_str()) {
            Some("text") => {
                let steps = kwargs.get("steps").and_then(|v| v.as_u64()).unwrap_or(5);
                let mut produced = 0;
                let mut prefixed = false;
                Ok(CallOutcome::Stream(Box::new(std::iter::from_fn(
                    move || {
                        if !prefixed {
                            prefixed = true;
                            return Some(Ok(ChunkPayload::Text(format!(
                                "Response to '{}': ",
                                input
                            ))));
                        }
                        if produced >= steps {
                            return None;
                        }
                        std::thread::sleep(Duration::from_millis(500));
                        let token = format!("token_{} ", produced);
                        produced += 1;
                        Some(Ok(ChunkPayload::Text(token)))
                    },
                ))))
            }
            Some("audio") => Ok(CallOutcome::Stream(Box::new((0..20).map(|_| {
                std::thread::sleep(Duration::from_millis(100));
                Ok(ChunkPayload::Binary(vec![0u8; 50]))
            })))),
            _ => Ok(CallOutcome::Value(json!({
                "message": format!("Hello, {}!", if input.is_empty() { "world" } else { input.as_str() })
            }))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "offramp_gateway=info,offramp_core=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Offramp Gateway");

    // Load configuration
    let config = match std::env::var("OFFRAMP_CONFIG") {
        Ok(path) => OfframpConfig::from_file(path)?,
        Err(_) => OfframpConfig::from_env()?,
    };
    config.validate()?;

    info!(
        "Gateway configuration loaded: bind={}:{}, workers={}, policy={:?}",
        config.bind_address, config.port, config.dispatch.workers, config.dispatch.policy
    );

    // One callable instance per worker; instance count is the parallelism.
    let callables: Vec<Box<dyn Callable>> = (0..config.dispatch.workers)
        .map(|_| Box::new(DemoModel) as Box<dyn Callable>)
        .collect();

    let supervisor = Arc::new(Supervisor::start(callables, &config.dispatch)?);
    let state = AppState::new(supervisor.clone(), &config);

    tokio::select! {
        result = offramp_gateway::serve(state, &config) => {
            result?;
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    supervisor.shutdown(config.shutdown_grace()).await;

    info!("Offramp Gateway shutdown complete");
    Ok(())
}
