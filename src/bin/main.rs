use std::{path::PathBuf, process, time::Duration};

use chithram_fl::{
    procedures::{CommandEvaluator, CommandMerger},
    rest::{self, RestContext},
    settings::Settings,
    state_machine::{AggregatorInitializer, Scheduler},
    storage::{ArtifactStore, JsonStore},
};
use structopt::StructOpt;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        aggregation: aggregation_settings,
        storage: storage_settings,
        procedures: procedure_settings,
        recovery: recovery_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let metadata = JsonStore::open(&storage_settings.metadata_path)
        .await
        .unwrap_or_else(|err| {
            error!("failed to open the metadata store: {}", err);
            process::exit(1);
        });
    let store = ArtifactStore::new(&storage_settings, aggregation_settings.extension.clone());
    let model_name = aggregation_settings.model_name.clone();
    let interval = Duration::from_secs(aggregation_settings.interval);

    let (aggregator, event_subscriber, backfill) = AggregatorInitializer::new(
        aggregation_settings,
        storage_settings,
        recovery_settings,
        store.clone(),
        CommandMerger::new(procedure_settings.merge),
        CommandEvaluator::new(procedure_settings.evaluate),
        metadata.clone(),
    )
    .init()
    .await
    .unwrap_or_else(|err| {
        error!("failed to initialize the aggregator: {}", err);
        process::exit(1);
    });

    tokio::spawn(async move {
        let recorded = backfill.run().await;
        info!("metrics backfill recorded {} evaluations", recorded);
    });

    let (scheduler, trigger) = Scheduler::new(aggregator, interval);
    let context = RestContext::new(store, metadata, &event_subscriber, trigger, model_name);

    tokio::select! {
        _ = scheduler.run() => {
            warn!("shutting down: aggregation scheduler terminated");
        }
        result = rest::serve(api_settings, context) => {
            if let Err(err) = result {
                error!("{}", err);
            }
            warn!("shutting down: REST server terminated");
        }
        _ = signal::ctrl_c() => {}
    }
}
