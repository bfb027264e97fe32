//! vigil_decrypt - offline companion for encrypted recordings.
//!
//! `keygen` writes a recipient keypair: the public half goes into the
//! recorder's config (`remote.public_key_path`), the secret half stays
//! off-device with whoever reviews footage. `decrypt` streams downloaded
//! logical files through the envelope decryptor, in order, into one
//! plaintext output.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use vigil::{generate_keypair, FileDecryptor, RecipientSecretKey};

#[derive(Debug, Parser)]
#[command(name = "vigil_decrypt", about = "Key management and decryption for Vigil recordings")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a recipient keypair as hex files.
    Keygen {
        /// Directory to write vigil.pub / vigil.key into.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Decrypt one or more downloaded logical files into a single output.
    Decrypt {
        /// Recipient secret key file (vigil.key).
        #[arg(long)]
        key: PathBuf,
        /// Encrypted input files, in upload order (video0.h264 video1.h264 ...).
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Plaintext output path.
        #[arg(long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match Cli::parse().command {
        Command::Keygen { out_dir } => keygen(&out_dir),
        Command::Decrypt {
            key,
            inputs,
            output,
        } => decrypt(&key, &inputs, &output),
    }
}

fn keygen(out_dir: &PathBuf) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create output directory {}", out_dir.display()))?;
    let public_path = out_dir.join("vigil.pub");
    let secret_path = out_dir.join("vigil.key");
    if public_path.exists() || secret_path.exists() {
        return Err(anyhow!(
            "refusing to overwrite existing key files in {}",
            out_dir.display()
        ));
    }

    let (public, secret) = generate_keypair();
    public.write_hex_file(&public_path)?;
    secret.write_hex_file(&secret_path)?;
    println!("public key:  {}", public_path.display());
    println!("secret key:  {} (keep off the recorder)", secret_path.display());
    Ok(())
}

fn decrypt(key: &PathBuf, inputs: &[PathBuf], output: &PathBuf) -> Result<()> {
    let secret = RecipientSecretKey::from_hex_file(key)?;
    let out_file =
        File::create(output).with_context(|| format!("create output {}", output.display()))?;
    let mut writer = BufWriter::new(out_file);

    let mut total = 0u64;
    for input in inputs {
        let file =
            File::open(input).with_context(|| format!("open input {}", input.display()))?;
        let mut reader = BufReader::new(file);
        let written = FileDecryptor::decrypt_stream(&secret, &mut reader, &mut writer)
            .with_context(|| format!("decrypt {}", input.display()))?;
        log::info!("{}: {} plaintext bytes", input.display(), written);
        total += written;
    }

    writer.flush().context("flush output")?;
    println!("wrote {} bytes to {}", total, output.display());
    Ok(())
}
