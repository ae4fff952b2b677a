use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer};
use clap::{Parser, Subcommand};
use tracing::info;

use ovpnward_api::config::{Config, ServerToml};
use ovpnward_api::middleware::RequestLogger;
use ovpnward_api::pki::OpenSslAuthority;
use ovpnward_api::{app, auth};

const CA_PASSPHRASE_VAR: &str = "OVPNWARD_CA_PASSPHRASE";

#[derive(Parser)]
#[command(name = "ovpnward-api", version = env!("GIT_VERSION"))]
struct Args {
    /// Path to server.toml
    #[arg(short, long, default_value = "/etc/ovpnward/server.toml")]
    config: PathBuf,

    /// Session refresh interval in seconds, overriding the config file
    #[arg(long)]
    refresh_interval: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Create a new certificate authority at the configured paths
    InitCa {
        #[arg(long, default_value = "ovpnward CA")]
        common_name: String,
        #[arg(long, default_value_t = 3650)]
        days: u32,
    },
    /// Read a password from stdin and print its argon2 hash
    HashPassword,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

fn write_new(path: &Path, contents: &str, mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(path)?.write_all(contents.as_bytes())
}

async fn init_ca(config_path: &Path, common_name: &str, days: u32) -> io::Result<()> {
    let server = ServerToml::load(config_path)
        .await
        .map_err(io::Error::other)?;
    let passphrase = std::env::var(CA_PASSPHRASE_VAR)
        .map_err(|_| io::Error::other(format!("{CA_PASSPHRASE_VAR} must be set")))?;
    if passphrase.len() < 4 {
        return Err(io::Error::other("CA passphrase must be at least 4 characters"));
    }

    let (cert, key) =
        OpenSslAuthority::generate(common_name, &passphrase, days).map_err(io::Error::other)?;
    write_new(&server.pki.ca_key, &key, 0o600)?;
    write_new(&server.pki.ca_cert, &cert, 0o644)?;
    info!(
        cert = %server.pki.ca_cert.display(),
        key = %server.pki.ca_key.display(),
        "certificate authority created"
    );
    Ok(())
}

fn hash_password() -> io::Result<()> {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        return Err(io::Error::other("empty password"));
    }
    let hash = auth::hash_password(password).map_err(|e| io::Error::other(e.to_string()))?;
    println!("{hash}");
    Ok(())
}

async fn serve(args: &Args) -> io::Result<()> {
    let mut config = Config::load(&args.config)
        .await
        .expect("failed to load configuration");
    if let Some(secs) = args.refresh_interval {
        config.server.telemetry.refresh_interval_secs = secs;
    }
    info!(addr = %config.server.bind_addr, version = env!("GIT_VERSION"), "starting ovpnward-api");

    let services = app::build(&config)
        .await
        .expect("failed to initialise services");

    let interval = Duration::from_secs(config.server.telemetry.refresh_interval_secs.max(1));
    let refresher = actix_web::rt::spawn(Arc::clone(&services.sessions).run(interval));

    let bind = config.server.bind_addr.clone();
    let result = HttpServer::new(move || {
        let services = services.clone();
        App::new()
            .wrap(RequestLogger)
            .configure(move |cfg| services.configure(cfg))
    })
    .bind(&bind)?
    .run()
    .await;

    refresher.abort();
    result
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    match args.command {
        None | Some(Command::Serve) => serve(&args).await,
        Some(Command::InitCa { ref common_name, days }) => {
            init_ca(&args.config, common_name, days).await
        }
        Some(Command::HashPassword) => hash_password(),
    }
}
