use clap::{Parser, Subcommand};
use flowtap::{CertificateAuthority, ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "flowtap")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Log level used when RUST_LOG is not set
  #[arg(long, default_value = "info", global = true)]
  log_level: String,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the intercepting proxy
  Run {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the listening address
    #[arg(long)]
    listen: Option<SocketAddr>,
  },
  /// Generate a root certificate and key for first-time setup
  GenCa {
    /// Directory receiving ca_cert.pem and ca_key.pem
    #[arg(short, long, default_value = "ca")]
    out: PathBuf,
  },
}

#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt::layer())
    .init();

  let result = match cli.command {
    Command::Run { config, listen } => run(config, listen).await,
    Command::GenCa { out } => gen_ca(out).await,
  };
  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("flowtap: {}", e);
      ExitCode::FAILURE
    }
  }
}

async fn run(config: Option<PathBuf>, listen: Option<SocketAddr>) -> flowtap::Result<()> {
  let mut config = match config {
    Some(path) => ProxyConfig::load(path)?,
    None => ProxyConfig::default(),
  };
  if let Some(listen) = listen {
    config.listen = listen;
  }
  let hooks = flowtap::server::default_hooks(&config);
  if config.log.enabled {
    tracing::info!(
      "logging exchanges for {:?} to {}",
      config.log.hosts,
      config.log.path.display()
    );
  }
  let server = ProxyServer::from_config(&config, hooks).await?;
  server
    .run_until(async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
      }
    })
    .await
}

async fn gen_ca(out: PathBuf) -> flowtap::Result<()> {
  let ca = CertificateAuthority::generate(&out).await?;
  println!("{}", ca.ca_cert_pem());
  tracing::info!(
    "install {} in client trust stores",
    out.join(flowtap::ca::CA_CERT_FILE).display()
  );
  Ok(())
}
