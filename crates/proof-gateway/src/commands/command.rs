use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use gateway_types::now_unix_s;
use prover_client::ProverClient;
use storage::blobs::{BlobStore, FsBlobStore};
use storage::records::{RecordStore, RocksDbRecordStore};
use tracing::info;

use crate::commands::cli::VERSION;
use crate::config::{Config, APP_HOME, CONFIG_DIR, CONFIG_FILE};
use crate::coordinator::Coordinator;
use crate::pipeline::claim::ClaimConsumer;
use crate::pipeline::dlq;
use crate::pipeline::proof::ProofConsumer;
use crate::queue::Queue;
use crate::relay::RelayClient;
use crate::server::{self, AppState};

pub fn init() -> Result<()> {
    let home_dir = dirs::home_dir()
        .expect("cannot find home directory")
        .join(APP_HOME);

    if !home_dir.exists() {
        info!("creating home directory at {home_dir:?}");
        fs::create_dir_all(&home_dir)?;
    }

    let config_dir = home_dir.join(CONFIG_DIR);
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    let config_path = config_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        info!("creating default config at {config_path:?}");
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config)?;
        fs::write(config_path, yaml)?;
    } else {
        info!("config file already exists at {config_path:?}");
    }

    Ok(())
}

pub async fn start() -> Result<()> {
    let config_path = dirs::home_dir()
        .expect("cannot find home directory")
        .join(APP_HOME)
        .join(CONFIG_DIR)
        .join(CONFIG_FILE);

    let config = if config_path.exists() {
        info!("reading config file at {}", config_path.display());
        Config::load(&config_path)?
    } else {
        info!("no config file found, using defaults and environment");
        Config::from_env()
    };

    let data_dir = config.data_dir();
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    info!(
        "starting proof gateway: bind_addr={} prover={} relay={} max_tape_bytes={} wall_time_secs={} poll_interval_secs={} auth_required={} data_dir={}",
        config.bind_addr,
        config.prover.base_url,
        config.relay.endpoint,
        config.max_tape_bytes,
        config.jobs.max_job_wall_time_secs,
        config.jobs.poll_interval_secs,
        config.api_key.is_some(),
        data_dir.display()
    );

    let records: Arc<dyn RecordStore> =
        Arc::new(RocksDbRecordStore::new(data_dir.join("records.db"))?);
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(data_dir.join("blobs")));
    let prover = Arc::new(ProverClient::new(config.prover_client_config()?)?);
    let relay = Arc::new(RelayClient::new(config.relay_config()?)?);

    let mut proof_queue = Queue::new("proof", config.jobs.max_queue_retries);
    let mut claim_queue = Queue::new("claim", config.jobs.max_claim_attempts);
    let proof_dlq = proof_queue.take_dlq();
    let claim_dlq = claim_queue.take_dlq();

    let coordinator = Coordinator::new(
        records,
        blobs.clone(),
        prover.clone(),
        proof_queue.handle(),
        claim_queue.handle(),
        config.coordinator_config(),
    );

    let proof_consumer = Arc::new(ProofConsumer::new(
        coordinator.clone(),
        blobs.clone(),
        prover.clone(),
        config.jobs.max_queue_retries,
    ));
    tokio::spawn(proof_queue.run(move |delivery| {
        let consumer = proof_consumer.clone();
        async move { consumer.handle(delivery).await }
    }));

    let claim_consumer = Arc::new(ClaimConsumer::new(
        coordinator.clone(),
        blobs.clone(),
        relay,
        config.jobs.max_claim_attempts,
    ));
    tokio::spawn(claim_queue.run(move |delivery| {
        let consumer = claim_consumer.clone();
        async move { consumer.handle(delivery).await }
    }));

    tokio::spawn(dlq::run_proof_dlq(coordinator.clone(), proof_dlq));
    tokio::spawn(dlq::run_claim_dlq(coordinator.clone(), claim_dlq));

    coordinator.recover().await?;

    let state = AppState {
        coordinator,
        blobs,
        prover,
        max_tape_bytes: config.max_tape_bytes,
        api_key: config.api_key.clone(),
        started_at: now_unix_s(),
    };
    server::serve(state, &config.bind_addr, config.cors_allowed_origin.clone()).await
}

pub fn version() {
    println!("version: {VERSION}");
}
