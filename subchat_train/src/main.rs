use anyhow::{ensure, Context, Result};
use clap::Parser;
use tracing::{info, metadata::LevelFilter, warn};

use bots::{
    data::{self, decode_words},
    model::PhraseModel,
    subtitles, train,
};
use plane::ml::{nn::solver::AdamOptimizer, RngStrategy};

use config::TrainConfig;

mod config;

const REPLY_MAX_LEN: usize = 20;

fn main() -> Result<()> {
    configure_logging()?;
    let config = TrainConfig::parse();
    info!(
        "Starting run '{}' with config: {}",
        config.name,
        serde_json::to_string(&config)?
    );
    ensure!(config.batch_size > 0, "batch size must be at least 1");
    ensure!(config.hidden_size > 0, "hidden size must be at least 1");
    if config.cuda {
        warn!("CUDA was requested, but this build only computes on the CPU");
    }

    let rng = RngStrategy::from_seed(config.seed);
    if rng.is_debug() {
        info!("Using seeded rng: {rng:?}");
    }

    let dialogues = subtitles::read_file(&config.data, config.dialog_seconds)?;
    let phrase_count: usize = dialogues.iter().map(|x| x.len()).sum();
    info!(
        "Loaded {} dialogues with {} phrases",
        dialogues.len(),
        phrase_count
    );

    let embeddings = data::read_embeddings(&config.embeddings, config.embeddings_limit, &rng)?;
    let train_data = data::dialogues_to_train(&dialogues, &embeddings);
    info!("Training data converted, got {} samples", train_data.len());
    ensure!(!train_data.is_empty(), "no training samples found in dialogues");

    let mut net = PhraseModel::new(
        embeddings.dimension(),
        embeddings.len(),
        config.hidden_size,
        &rng,
    );
    info!("Model: {net}");
    info!("Model has {} trainable parameters", net.parameter_count());

    let batch = &train_data[..config.batch_size.min(train_data.len())];
    let report = train::train_batch(&net, &embeddings, batch)?;
    info!(
        "Batch loss = {:.6}, steps = {}, samples = {}, gradient norm = {:.6}",
        report.loss, report.steps, report.samples, report.gradient_norm
    );

    if config.apply_gradients {
        let optimizer = AdamOptimizer::new_cache(config.learn_rate);
        net.apply_gradients(&optimizer)?;
        net.reset_gradients();

        let loss = train::batch_loss(&net, &embeddings, batch)?;
        info!(
            "Applied gradients (learn rate = {}), batch loss {:.6} -> {:.6}",
            config.learn_rate, report.loss, loss
        );
    }

    let sample = batch.first().context("batch is empty")?;
    let reply = train::generate_reply(&net, &embeddings, &sample.input, REPLY_MAX_LEN)?;
    info!(
        "Sample reply: '{}' -> '{}'",
        decode_words(&sample.input, &embeddings).join(" "),
        decode_words(&reply, &embeddings).join(" ")
    );

    Ok(())
}

fn configure_logging() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_max_level(LevelFilter::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
