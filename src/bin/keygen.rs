//! Identity key generation tool.
//!
//! Generates an Ed25519 keypair, prints the derived overlay id and
//! optionally writes the key file a node will pick up from its data
//! directory.
//!
//! Usage:
//!   cargo run --bin keygen
//!   cargo run --bin keygen -- --output ./data

use clap::Parser;
use meridian::Identity;
use std::fs;
use std::path::PathBuf;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Meridian identity generator")]
struct Args {
    /// Write `key` and `id` files into this directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the raw private key as hex (handle with care)
    #[arg(long)]
    show_secret: bool,
}

fn main() {
    let args = Args::parse();

    let identity = Identity::generate();
    let key = Zeroizing::new(identity.private_key());

    println!("id: {}", identity.id());
    println!("id (hex): {}", identity.id().to_hex());
    if args.show_secret {
        println!("private key (hex): {}", hex::encode(key.as_slice()));
    }

    if let Some(dir) = args.output {
        if let Err(e) = fs::create_dir_all(&dir) {
            eprintln!("cannot create {}: {}", dir.display(), e);
            std::process::exit(1);
        }
        let key_path = dir.join("key");
        if key_path.exists() {
            eprintln!("{} already exists, refusing to overwrite", key_path.display());
            std::process::exit(1);
        }
        if let Err(e) = fs::write(&key_path, key.as_slice()) {
            eprintln!("cannot write {}: {}", key_path.display(), e);
            std::process::exit(1);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600));
        }
        if let Err(e) = fs::write(dir.join("id"), format!("{}\n", identity.id())) {
            eprintln!("cannot write id file: {}", e);
            std::process::exit(1);
        }
        println!("key written to {}", key_path.display());
    }
}
