//! libvault repository administration CLI

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use libvault_core::{
    ItemKey, LibraryStatus, RepositoryConfig, RepositoryManager, VersionScheme,
};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "libvault-admin")]
#[command(author = "libvault Contributors")]
#[command(version = "0.1.0")]
#[command(about = "libvault repository administration tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init {
        path: PathBuf,
        /// Repository identifier
        #[arg(long, default_value = "local")]
        id: String,
        /// Human-readable display name
        #[arg(long, default_value = "Local Repository")]
        name: String,
    },

    /// List items under a namespace
    List {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(short, long)]
        namespace: String,
    },

    /// Show commit history of an item
    History {
        #[command(flatten)]
        item: ItemArgs,
    },

    /// Advance an item's status one step
    Promote {
        #[command(flatten)]
        item: ItemArgs,
        #[arg(short, long)]
        user: String,
    },

    /// Regress an item's status one step
    Demote {
        #[command(flatten)]
        item: ItemArgs,
        #[arg(short, long)]
        user: String,
    },

    /// Jump an item's status to an arbitrary value
    SetStatus {
        #[command(flatten)]
        item: ItemArgs,
        #[arg(short, long)]
        user: String,
        /// One of: draft, review, final, obsolete
        #[arg(short, long)]
        status: String,
    },

    /// Show the repository configuration
    Config {
        #[arg(short, long)]
        repo: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct ItemArgs {
    #[arg(short, long)]
    repo: PathBuf,
    #[arg(short, long)]
    namespace: String,
    #[arg(short, long)]
    filename: String,
    #[arg(short = 'V', long)]
    version: String,
    /// Version scheme: classic or extended
    #[arg(long, default_value = "classic")]
    scheme: String,
}

impl ItemArgs {
    fn key(&self) -> Result<ItemKey> {
        Ok(ItemKey::new(
            &self.namespace,
            &self.filename,
            &self.version,
            parse_scheme(&self.scheme)?,
        ))
    }

    fn open(&self) -> Result<RepositoryManager> {
        open_repository(&self.repo)
    }
}

fn parse_scheme(raw: &str) -> Result<VersionScheme> {
    match raw {
        "classic" => Ok(VersionScheme::Classic),
        "extended" => Ok(VersionScheme::Extended),
        other => Err(anyhow!("unknown version scheme '{}'", other)),
    }
}

fn parse_status(raw: &str) -> Result<LibraryStatus> {
    match raw {
        "draft" => Ok(LibraryStatus::Draft),
        "review" => Ok(LibraryStatus::Review),
        "final" => Ok(LibraryStatus::Final),
        "obsolete" => Ok(LibraryStatus::Obsolete),
        other => Err(anyhow!("unknown status '{}'", other)),
    }
}

fn open_repository(path: &Path) -> Result<RepositoryManager> {
    if !path.join("repository-config.json").exists() {
        return Err(anyhow!("no repository found at {}", path.display()));
    }
    Ok(RepositoryManager::open(path)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path, id, name } => {
            let config = RepositoryConfig {
                repository_id: id,
                display_name: name,
                ..RepositoryConfig::default()
            };
            let mgr = RepositoryManager::init(&path, &config)?;
            println!(
                "Repository '{}' initialized at {}",
                mgr.repository_id(),
                path.display()
            );
        }

        Commands::List { repo, namespace } => {
            let mgr = open_repository(&repo)?;
            let items = mgr.list_items(&namespace).await?;
            if items.is_empty() {
                println!("No items under {}", namespace);
            }
            for item in items {
                println!(
                    "{:<40} {:<10} {:<10} {:<18} {}",
                    item.filename,
                    item.version,
                    item.status,
                    item.state,
                    item.locked_by.as_deref().unwrap_or("-"),
                );
            }
        }

        Commands::History { item } => {
            let mgr = item.open()?;
            let key = item.key()?;
            for entry in mgr.get_history(&key).await? {
                println!(
                    "#{:03}  {}  {:<12} {}",
                    entry.commit_number,
                    entry.effective_on.format("%Y-%m-%d %H:%M:%S"),
                    entry.user,
                    entry.remarks,
                );
            }
        }

        Commands::Promote { item, user } => {
            let mgr = item.open()?;
            let key = item.key()?;
            let metadata = mgr.promote(&key, &user).await?;
            println!("{} promoted to {}", key, metadata.status);
        }

        Commands::Demote { item, user } => {
            let mgr = item.open()?;
            let key = item.key()?;
            let metadata = mgr.demote(&key, &user).await?;
            println!("{} demoted to {}", key, metadata.status);
        }

        Commands::SetStatus { item, user, status } => {
            let mgr = item.open()?;
            let key = item.key()?;
            let new_status = parse_status(&status)?;
            let metadata = mgr.update_status(&key, &user, new_status).await?;
            println!("{} status set to {}", key, metadata.status);
        }

        Commands::Config { repo } => {
            let mgr = open_repository(&repo)?;
            println!("{}", serde_json::to_string_pretty(mgr.config())?);
        }
    }

    Ok(())
}
