use deep_conv_mnist::config::{self, TrainConfig};
use deep_conv_mnist::{run, telemetry, train};

use clap::{Args, Parser, Subcommand};

/// Train (default) or run the two-convolution MNIST classifier.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a new model
    Train(TrainArgs),
    /// Run inference on a file
    Run {
        #[arg(long)]
        checkpoint: String,
        /// Raw 28x28 greyscale image, 784 bytes
        #[arg(long)]
        image_path: String,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Directory holding the four MNIST idx files
    #[arg(long, default_value = config::DATA_DIR)]
    data_dir: String,
    #[arg(long, default_value_t = config::BATCH_SIZE)]
    batch_size: usize,
    #[arg(long, default_value_t = config::ITERATIONS)]
    iterations: usize,
    /// Print the training accuracy every this many steps
    #[arg(long, default_value_t = config::LOG_EVERY)]
    log_every: usize,
    #[arg(long, default_value_t = config::LEARNING_RATE)]
    learning_rate: f32,
    /// Dropout keep probability while training
    #[arg(long, default_value_t = config::KEEP_PROB)]
    keep_prob: f32,
    /// Seed every random draw (weights, batches, dropout) for a reproducible run
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    checkpoint_folder: Option<String>,
    /// Every how many logging steps do we checkpoint?
    #[arg(long, default_value_t = config::CHECKPOINT_STRIDE)]
    checkpoint_stride: usize,
    #[arg(long)]
    loss_csv_path: Option<String>,
}

impl From<TrainArgs> for TrainConfig {
    fn from(args: TrainArgs) -> Self {
        TrainConfig {
            data_dir: args.data_dir,
            batch_size: args.batch_size,
            iterations: args.iterations,
            log_every: args.log_every,
            learning_rate: args.learning_rate,
            keep_prob: args.keep_prob,
            seed: args.seed,
            checkpoint_folder: args.checkpoint_folder,
            checkpoint_stride: args.checkpoint_stride,
            loss_csv_path: args.loss_csv_path,
        }
    }
}

fn main() {
    telemetry::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        None => {
            if let Err(e) = train::train(&TrainConfig::default()) {
                eprintln!("Error during training: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Train(args)) => {
            if let Err(e) = train::train(&TrainConfig::from(args)) {
                eprintln!("Error during training: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run {
            checkpoint,
            image_path,
        }) => {
            if let Err(e) = run::run(&checkpoint, &image_path) {
                eprintln!("Error running inference: {}", e);
                std::process::exit(1);
            }
        }
    }
}
