use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, instrument};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use port_mirror::cli::{Cli, LogFormat};
use port_mirror::scanner::CommandScanner;
use port_mirror::{Monitor, Result, SshClient, TunnelRegistry};

/// A writer that wraps stderr and flushes after each write, so log lines are
/// immediately visible when stderr is piped.
struct FlushingStderr;

impl Write for FlushingStderr {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let n = handle.write(buf)?;
        handle.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli).await {
        error!("{e}");
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let base_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.effective_log_level()));

    // russh logs every channel message at debug. Keep it at info unless the
    // user asked for it explicitly.
    let rust_log = std::env::var("RUST_LOG").unwrap_or_default();
    let wants_verbose_ssh = rust_log.contains("russh")
        || rust_log.contains("ssh_key")
        || cli.effective_log_level().eq_ignore_ascii_case("trace");

    let filter = if wants_verbose_ssh {
        base_filter
    } else {
        base_filter
            .add_directive("russh=info".parse().unwrap())
            .add_directive("ssh_key=info".parse().unwrap())
    };

    let use_color = cli.color.should_enable();

    match cli.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_writer(|| FlushingStderr),
                )
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_ansi(use_color)
                        .with_target(false)
                        .with_writer(|| FlushingStderr),
                )
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .pretty()
                        .with_ansi(use_color)
                        .with_target(false)
                        .with_writer(|| FlushingStderr),
                )
                .init();
        }
    }
}

#[instrument(name = "run", skip(cli), fields(host = %cli.host))]
async fn run(cli: Cli) -> Result<()> {
    let config = cli.forward_config()?;

    info!(
        "port-mirror v{} connecting to {}",
        env!("CARGO_PKG_VERSION"),
        cli.host
    );

    let client = SshClient::connect(&cli.host, cli.ssh_port).await?;
    let transport = client.transport();

    let scanner = Arc::new(CommandScanner::new(Arc::clone(&transport)));
    let (mut monitor, _control) =
        Monitor::new(config, scanner, transport, TunnelRegistry::new());

    let result = monitor.run().await;
    client.disconnect().await;
    result
}
