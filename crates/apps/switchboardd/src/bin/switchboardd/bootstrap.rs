use super::Args;
use std::rc::Rc;
use switchboard_core::{BusTransport, InhibitSlot, Transport};
use switchboard_daemon::account::AccountFeature;
use switchboard_daemon::config::{ConfigError, DaemonConfig};
use switchboard_daemon::connectivity::ConnectivityMonitor;
use switchboard_daemon::loopback::LoopbackBus;
use switchboard_daemon::manager::{pump_storage_events, AccountManager};
use switchboard_daemon::storage::{StorageError, StorageRegistry};
use switchboard_ipc::{BrokerError, StorageEvent};
use tokio::sync::{broadcast, oneshot, watch};

#[derive(Debug, thiserror::Error)]
pub(super) enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot seed storage: {0}")]
    Storage(#[from] StorageError),

    #[error("account manager unavailable: {0}")]
    Manager(#[from] BrokerError),
}

pub(super) struct BootstrapContext {
    storage: Rc<StorageRegistry>,
    loopback: Rc<LoopbackBus>,
    manager: AccountManager,
    monitor: ConnectivityMonitor,
    events: broadcast::Receiver<StorageEvent>,
    start_online: bool,
}

fn init_logging(config: &DaemonConfig, verbose: bool) {
    let env = env_logger::Env::default().default_filter_or(config.daemon.log_filter.as_str());
    let mut builder = env_logger::Builder::from_env(env);
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    if builder.try_init().is_err() {
        eprintln!("[switchboardd] logger already initialised");
    }
}

async fn wait_for<F>(start: F) -> Result<(), BrokerError>
where
    F: FnOnce(Box<dyn FnOnce(Result<(), BrokerError>)>),
{
    let (tx, rx) = oneshot::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.await
        .map_err(|_| BrokerError::transport("completion dropped"))?
}

pub(super) async fn bootstrap(args: &Args) -> Result<BootstrapContext, StartupError> {
    let config = match &args.config {
        Some(path) => DaemonConfig::from_path(path)?,
        None => DaemonConfig::default(),
    };
    init_logging(&config, args.verbose);

    let storage = Rc::new(StorageRegistry::from_config(&config)?);
    let events = storage.subscribe();
    let loopback = Rc::new(LoopbackBus::new(storage.clone()));
    let transport: Rc<dyn Transport> = Rc::new(BusTransport::new(loopback.clone()));
    let inhibit = InhibitSlot::new();
    let manager = AccountManager::new(transport, inhibit.clone());

    wait_for(|done| {
        manager.prepare(done);
    })
    .await?;
    if let Err(err) = wait_for(|done| {
        manager.prepare_accounts(&AccountFeature::ALL, done);
    })
    .await
    {
        log::warn!("switchboardd: some accounts are not ready: {}", err);
    }

    log::info!(
        "switchboardd: {} accounts across storage {:?}",
        manager.len(),
        storage.plugin_names()
    );
    for account in manager.accounts() {
        log::info!(
            "switchboardd: {} name={:?} enabled={} valid={}",
            account.id(),
            account.display_name().unwrap_or_default(),
            account.enabled().unwrap_or(false),
            account.valid().unwrap_or(false),
        );
    }

    let monitor =
        ConnectivityMonitor::new(manager.root().clone(), inhibit, config.inhibit_timeout());
    Ok(BootstrapContext {
        storage,
        loopback,
        manager,
        monitor,
        events,
        start_online: config.daemon.start_online,
    })
}

pub(super) async fn run(context: BootstrapContext) {
    let BootstrapContext {
        storage,
        loopback,
        manager,
        monitor,
        events,
        start_online,
    } = context;

    let mirror = loopback.clone();
    tokio::task::spawn_local(pump_storage_events(manager.clone(), events, move |event| {
        mirror.handle_storage_event(event)
    }));

    let (online, online_rx) = watch::channel(start_online);
    tokio::select! {
        _ = monitor.run(online_rx) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                log::warn!("switchboardd: cannot listen for ctrl-c: {}", err);
            }
        }
    }
    drop(online);

    if !monitor.shutdown().await {
        log::warn!("switchboardd: shutdown went ahead with missions still holding");
    }
    if let Err(err) = storage.commit(None) {
        log::warn!("switchboardd: final commit failed: {}", err);
    }
    log::info!("switchboardd: stopped, {} accounts left", manager.len());
}
