use anyhow::Result;
use clap::Parser;

use keep_sync::vault;

#[derive(Debug, Parser)]
#[command(author, version, about = "Generate a base64 encryption key for credential storage")]
struct Args {}

fn main() -> Result<()> {
    let _args = Args::parse();
    println!("{}", vault::generate_key()?);
    Ok(())
}
