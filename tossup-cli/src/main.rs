mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tossup_core::{LocalWalletService, Storage};
use tossup_game::{TossError, TossManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tossup")]
#[command(about = "Group wagers with escrowed stakes")]
#[command(version)]
struct Cli {
    /// Data directory for toss and wallet storage
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new toss
    Create {
        /// Your participant id (e.g. a chat handle)
        sender: String,
        /// Stake each participant pays
        amount: String,
        /// What the toss is about
        #[arg(long)]
        topic: Option<String>,
        /// Comma-separated options (defaults to yes,no at resolution)
        #[arg(long, value_delimiter = ',')]
        options: Option<Vec<String>>,
    },
    /// Stake and join a toss with a chosen option
    Join {
        sender: String,
        toss_id: String,
        option: String,
    },
    /// Resolve a toss with a random draw
    Execute {
        toss_id: String,
    },
    /// Resolve a toss by naming the winning option (creator only)
    Close {
        sender: String,
        toss_id: String,
        option: String,
    },
    /// Show one toss
    Status {
        toss_id: String,
    },
    /// List open tosses
    List,
    /// Show wallet balance and address
    Balance {
        sender: String,
    },
    /// Cancel an open toss
    Cancel {
        toss_id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Deposit demo funds into a wallet
    Fund {
        sender: String,
        amount: String,
    },
    /// Send a chat message through the command router
    Chat {
        sender: String,
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "tossup={},tossup_core={},tossup_game={}",
            log_level, log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Get data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tossup")
    });
    tokio::fs::create_dir_all(&data_dir).await?;

    let storage = Arc::new(Storage::new(&data_dir.join("tossup.db")).await?);
    let wallets = Arc::new(LocalWalletService::new(storage.clone()));
    let manager = Arc::new(TossManager::new(storage, wallets.clone()));

    let result = match cli.command {
        Commands::Create {
            sender,
            amount,
            topic,
            options,
        } => commands::create_toss(&manager, &sender, &amount, topic, options).await,
        Commands::Join {
            sender,
            toss_id,
            option,
        } => commands::join_toss(&manager, &sender, &toss_id, &option).await,
        Commands::Execute { toss_id } => commands::execute_toss(&manager, &toss_id).await,
        Commands::Close {
            sender,
            toss_id,
            option,
        } => commands::close_toss(&manager, &sender, &toss_id, &option).await,
        Commands::Status { toss_id } => commands::show_status(&manager, &toss_id).await,
        Commands::List => commands::list_tosses(&manager).await,
        Commands::Balance { sender } => commands::show_balance(&manager, &sender).await,
        Commands::Cancel { toss_id, yes } => commands::cancel_toss(&manager, &toss_id, yes).await,
        Commands::Fund { sender, amount } => commands::fund_wallet(&wallets, &sender, &amount).await,
        Commands::Chat { sender, message } => {
            commands::chat(&manager, &sender, &message).await
        }
    };

    if let Err(e) = result {
        match e {
            TossError::TossNotFound(id) => {
                eprintln!("Error: Toss '{}' not found", id);
                eprintln!("Use 'tossup list' to see open tosses");
            }
            TossError::InsufficientBalance { need, available } => {
                eprintln!("Error: Insufficient balance");
                eprintln!("Need: {}, Available: {}", need, available);
                eprintln!("Use 'tossup fund <sender> <amount>' to add demo funds");
            }
            TossError::NotCreator(id) => {
                eprintln!("Error: Only the creator can close toss {}", id);
            }
            _ => {
                eprintln!("Error: {}", e);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
