use clap::Parser;
use portd_cert::{certgen::generate, constants::DEFAULT_SERVICE_HOST};

const DEFAULT_OUTPUT_DIR: &str = ".";

#[derive(Parser)]
struct Args {
    /// TLS hostname
    #[arg(long, default_value = DEFAULT_SERVICE_HOST)]
    host: String,

    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    out_dir: String,
}

fn main() -> anyhow::Result<()> {
    println!("Generate certificate and key files");

    let arg = Args::parse();
    let (cert, key) = generate(&arg.host, &arg.out_dir)?;

    println!("certificate: {cert}");
    println!("key: {key}");
    Ok(())
}
