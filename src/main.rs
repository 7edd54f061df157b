//! wasm-sandbox CLI entry point.
//!
//! Loads a guest module and delivers events to it through the instance
//! store, with a small in-process handler registry standing in for the
//! application.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use dashmap::{DashMap, DashSet};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasm_sandbox_common::{
    ConfigFile, EventRecord, GuestEvent, HandlerRegistry, HostEvent, HostFunctionError,
    LoggingConfig,
};
use wasm_sandbox_core::{FsLoader, ModuleLoader};
use wasm_sandbox_host::create_instance_store;

/// Run sandboxed WebAssembly room modules.
#[derive(Debug, Parser)]
#[command(name = "wasm-sandbox", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "WASM_SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Directory searched for `<instance>.wasm`
    #[arg(long, env = "WASM_SANDBOX_MODULE_DIR")]
    module_dir: Option<PathBuf>,

    /// Instance to deliver events to
    #[arg(short, long)]
    instance: String,

    /// Room the connection belongs to
    #[arg(long, default_value = "lobby")]
    room: String,

    /// Connection id (random if omitted)
    #[arg(long)]
    connection: Option<String>,

    /// Event to deliver
    #[arg(short, long, value_enum, default_value_t = EventArg::Message)]
    event: EventArg,

    /// Number of times to deliver the event
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    /// Payload fields
    payload: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EventArg {
    Message,
    Join,
    Leave,
}

impl From<EventArg> for GuestEvent {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Message => Self::OnMessage,
            EventArg::Join => Self::OnJoin,
            EventArg::Leave => Self::OnLeave,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConfigFile::default(),
    };

    init_tracing(&config.logging, cli.json_logs);
    info!("Starting wasm-sandbox");

    let mut loader = FsLoader::from_config(&config);
    if let Some(dir) = &cli.module_dir {
        loader = loader.with_module_dir(dir);
    }
    let loader: Arc<dyn ModuleLoader> = Arc::new(loader);

    let store = create_instance_store(&config.sandbox, loader, Arc::new(demo_registry()))
        .context("Failed to create instance store")?;

    let connection = cli
        .connection
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let kind = GuestEvent::from(cli.event);

    info!(
        instance_id = %cli.instance,
        room_id = %cli.room,
        connection_id = %connection,
        event = %kind,
        "Configuration loaded"
    );

    let mut result = Ok(());
    for attempt in 1..=cli.repeat {
        let event = EventRecord::new(
            connection.as_str(),
            cli.room.as_str(),
            cli.instance.as_str(),
            kind.code(),
            cli.payload.clone(),
        );

        if let Err(e) = store.dispatch(event).await {
            warn!(attempt, error = %e, "Dispatch failed");
            result = Err(e).with_context(|| format!("Failed to deliver {kind} to {}", cli.instance));
            break;
        }
        info!(attempt, "Event delivered");
    }

    store.close().await;
    result
}

fn init_tracing(logging: &LoggingConfig, json_logs: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);

    if json_logs || logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// In-process stand-in for the application's handlers.
///
/// GET/SET use a shared map, `getUsers` lists every connection seen so far,
/// and outbound fetch is refused.
fn demo_registry() -> HandlerRegistry {
    let kv: Arc<DashMap<String, String>> = Arc::default();
    let users: Arc<DashSet<String>> = Arc::default();

    let announce = |kind: HostEvent| {
        let users = Arc::clone(&users);
        move |event: &EventRecord<HostEvent>| {
            users.insert(event.connection_id.clone());
            info!(
                instance_id = %event.instance_id,
                room_id = %event.room_id,
                payload = ?event.payload,
                "{kind}"
            );
            Ok::<_, HostFunctionError>(String::new())
        }
    };

    HandlerRegistry::new()
        .with_handler(HostEvent::Broadcast, announce(HostEvent::Broadcast))
        .with_handler(HostEvent::SendMessage, announce(HostEvent::SendMessage))
        .with_handler(HostEvent::Log, announce(HostEvent::Log))
        .with_handler(HostEvent::Debug, announce(HostEvent::Debug))
        .with_handler(HostEvent::Set, {
            let kv = Arc::clone(&kv);
            move |event: &EventRecord<HostEvent>| match event.payload.as_slice() {
                [key, value, ..] => {
                    kv.insert(key.clone(), value.clone());
                    Ok(String::new())
                }
                _ => Err(HostFunctionError::InvalidArgument {
                    reason: "set expects a key and a value".into(),
                }),
            }
        })
        .with_handler(HostEvent::Get, {
            let kv = Arc::clone(&kv);
            move |event: &EventRecord<HostEvent>| {
                let key = event.payload.first().map_or("", String::as_str);
                kv.get(key)
                    .map(|value| value.value().clone())
                    .ok_or_else(|| HostFunctionError::handler(format!("no value for '{key}'")))
            }
        })
        .with_handler(HostEvent::GetUsers, {
            let users = Arc::clone(&users);
            move |_: &EventRecord<HostEvent>| {
                let mut list: Vec<String> = users.iter().map(|user| user.key().clone()).collect();
                list.sort_unstable();
                serde_json::to_string(&list).map_err(|e| HostFunctionError::handler(e.to_string()))
            }
        })
        .with_handler(HostEvent::Fetch, |_: &EventRecord<HostEvent>| {
            Err(HostFunctionError::handler("outbound fetch is disabled"))
        })
}
