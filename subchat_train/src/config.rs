use clap::Parser;
use serde::{Deserialize, Serialize};

use plane::ml::NodeValue;

pub const DATA_FILE: &str = "data/OpenSubtitles/en/Action/2005/365_100029_136606_sin_city.xml.gz";
pub const EMBEDDINGS_FILE: &str = "data/glove.6B.50d.txt";

/// Runs a single training batch of the subtitle phrase model.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "train")]
pub struct TrainConfig {
    /// accepted for compatibility, computation always runs on the CPU
    #[arg(long, default_value_t = false)]
    #[serde(default)]
    pub cuda: bool,

    /// name of the run
    #[arg(short = 'n', long)]
    pub name: String,

    #[arg(short = 'd', long, default_value = DATA_FILE)]
    pub data: String,

    #[arg(short = 'e', long, default_value = EMBEDDINGS_FILE)]
    pub embeddings: String,

    /// only read the first N rows of the embeddings table
    #[arg(long, default_value = None)]
    #[serde(default)]
    pub embeddings_limit: Option<usize>,

    /// silence in seconds that starts a new dialogue
    #[arg(long, default_value_t = 5)]
    pub dialog_seconds: u64,

    #[arg(long, default_value_t = 32)]
    pub hidden_size: usize,

    #[arg(short = 'b', long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long, default_value = None)]
    #[serde(default)]
    pub seed: Option<u32>,

    /// take one Adam step after the backward pass and report the new loss
    #[arg(long, default_value_t = false)]
    #[serde(default)]
    pub apply_gradients: bool,

    #[arg(short = 'r', long, default_value_t = 1e-3)]
    pub learn_rate: NodeValue,
}
