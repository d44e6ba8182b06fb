//! geotrace node binary.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use geotrace_node::cli::{Cli, Subcommand};
use geotrace_node::clock::{Clock, SystemClock};
use geotrace_node::config::NodeConfig;
use geotrace_node::ephid::{DerivedEphidSource, EphidSource};
use geotrace_node::exposure::ExposureBatch;
use geotrace_node::host::{HeldWakeLease, LogPresence};
use geotrace_node::location::{
    LocationProvider, MockLocationConfig, MockLocationProvider, StaticLocationProvider,
    UnavailableLocationProvider,
};
use geotrace_node::radio::{BluetoothRadio, MockRadio, NullRadio, Radio, RadioMode};
use geotrace_node::scheduler::TokioScheduler;
use geotrace_node::store::{self, FileStore, MemoryStore, Persistence, SharedStore, StoreWriter};
use geotrace_node::{logging, Capabilities, NodeError};
use geotrace_primitives::MILLISECONDS_PER_EPOCH;

const SECRET_FILE: &str = "ephid.key";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), NodeError> {
    let cli = Cli::parse();
    logging::init(&cli.run.log_level)?;
    let config = NodeConfig::resolve(&cli.run)?;

    match cli.subcommand {
        Some(Subcommand::PurgeData) => {
            let store = open_store(config.data_dir.as_deref())?;
            let stats = store.lock().purge_older_than(u64::MAX)?;
            log::info!("Purged {} records", stats.total());
            Ok(())
        }
        Some(Subcommand::Status) => {
            let store = open_store(config.data_dir.as_deref())?;
            let counts = store.lock().counts();
            log::info!(
                "Stored: {} locations, {} token rows, {} handshakes",
                counts.device_locations,
                counts.token_rows,
                counts.handshakes
            );
            Ok(())
        }
        Some(Subcommand::CheckExposure {
            exposed_hashes,
            exposed_list,
        }) => {
            let batch = ExposureBatch::load(
                exposed_hashes.as_deref(),
                exposed_list.as_deref(),
                MILLISECONDS_PER_EPOCH,
            )?;
            let store = open_store(config.data_dir.as_deref())?;
            let report = batch.check(&**store.lock());
            if report.is_exposed() {
                log::warn!(
                    "Exposed: {} token rows, {} handshakes match the batch",
                    report.matched_tokens.len(),
                    report.matched_handshakes.len()
                );
            } else {
                log::info!("No stored record matches the batch");
            }
            Ok(())
        }
        None => run(config).await,
    }
}

fn open_store(data_dir: Option<&Path>) -> Result<SharedStore, NodeError> {
    Ok(match data_dir {
        Some(dir) => store::shared(FileStore::open(dir)?),
        None => {
            log::warn!("No --data-dir given, records are kept in memory only");
            store::shared(MemoryStore::new())
        }
    })
}

async fn radio_for(config: &NodeConfig, clock: Arc<dyn Clock>) -> Arc<dyn Radio> {
    match config.radio_mode {
        RadioMode::Real => match BluetoothRadio::new(clock).await {
            Ok(radio) => Arc::new(radio),
            Err(e) => {
                log::warn!("Bluetooth radio unavailable ({}), tracing without radio", e);
                Arc::new(NullRadio)
            }
        },
        RadioMode::Mock => Arc::new(MockRadio::new(clock, config.mock.clone())),
        RadioMode::Disabled => Arc::new(NullRadio),
    }
}

fn location_for(config: &NodeConfig, clock: Arc<dyn Clock>) -> Box<dyn LocationProvider> {
    match (config.position, config.radio_mode) {
        (Some((latitude, longitude)), _) => {
            Box::new(StaticLocationProvider::new(clock, latitude, longitude))
        }
        (None, RadioMode::Mock) => Box::new(MockLocationProvider::new(
            clock,
            MockLocationConfig {
                seed: config.mock.seed,
                ..MockLocationConfig::default()
            },
        )),
        (None, _) => {
            log::warn!("No position source, location sampling disabled");
            Box::new(UnavailableLocationProvider)
        }
    }
}

async fn run(config: NodeConfig) -> Result<(), NodeError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let ephids: Arc<dyn EphidSource> = match &config.data_dir {
        Some(dir) => Arc::new(DerivedEphidSource::load_or_create(&dir.join(SECRET_FILE))?),
        None => Arc::new(DerivedEphidSource::generate()),
    };
    let writer = StoreWriter::spawn(open_store(config.data_dir.as_deref())?)?;

    let capabilities = Capabilities {
        clock: clock.clone(),
        scheduler: Box::new(TokioScheduler::new(clock.clone())),
        ephids,
        radio: radio_for(&config, clock.clone()).await,
        location: location_for(&config, clock),
        store: writer.clone(),
        wake_lease: Box::<HeldWakeLease>::default(),
        presence: Box::<LogPresence>::default(),
    };

    let handle = geotrace_node::spawn(capabilities, config.tracing.clone());
    handle.start(config.tracing).await?;
    log::info!("geotrace node running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    handle.shutdown().await?;

    let counts = writer.store().lock().counts();
    log::info!(
        "Stored: {} locations, {} token rows, {} handshakes",
        counts.device_locations,
        counts.token_rows,
        counts.handshakes
    );
    Ok(())
}
