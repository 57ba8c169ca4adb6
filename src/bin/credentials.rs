use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use keep_sync::config;
use keep_sync::db;
use keep_sync::model::Credentials;
use keep_sync::vault::TokenCipher;

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage stored Keep and Notion credentials")]
struct Args {
    /// YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store or replace credentials for a user
    Set {
        #[arg(long)]
        user_id: String,

        /// Google master token for the Keep account
        #[arg(long)]
        google_token: String,

        /// Notion integration token
        #[arg(long)]
        notion_token: String,

        /// Notion database the notes land in
        #[arg(long)]
        notion_database: String,
    },
    /// Show stored credentials for a user, tokens redacted
    Show {
        #[arg(long)]
        user_id: String,
    },
    /// Delete credentials for a user
    Delete {
        #[arg(long)]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/keep_sync.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let cipher = TokenCipher::new(&cfg.encryption.key)?;

    match args.command {
        Command::Set {
            user_id,
            google_token,
            notion_token,
            notion_database,
        } => {
            let creds = Credentials {
                google_oauth_token: google_token,
                notion_api_token: notion_token,
                notion_database_id: notion_database,
            };
            db::store_credentials(&pool, &cipher, &user_id, &creds).await?;
            println!("stored credentials for {user_id}");
        }
        Command::Show { user_id } => match db::get_credentials(&pool, &cipher, &user_id).await? {
            Some(creds) => {
                println!("user: {user_id}");
                println!("notion database: {}", creds.notion_database_id);
                println!("google token: [stored]");
                println!("notion token: [stored]");
            }
            None => println!("no credentials stored for {user_id}"),
        },
        Command::Delete { user_id } => {
            if db::delete_credentials(&pool, &user_id).await? {
                println!("deleted credentials for {user_id}");
            } else {
                println!("no credentials stored for {user_id}");
            }
        }
    }
    Ok(())
}
