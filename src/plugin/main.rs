// netwarden-cni - container-network plugin wrapping an upstream IP plugin
// stdout belongs to the CNI protocol; all diagnostics go to stderr.

use netwarden::cni::{self, CniArgs};
use std::io::{Read, Write};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Print a CNI error document and exit non-zero
fn fail(err: cni::PluginError) -> ! {
    tracing::error!(code = err.code(), "{}", err);
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{}", err.to_json());
    let _ = stdout.flush();
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    init_logging();

    let args = match CniArgs::from_env() {
        Ok(args) => args,
        Err(e) => fail(e),
    };

    let mut stdin = Vec::new();
    if args.command != cni::Command::Version {
        if let Err(e) = std::io::stdin().read_to_end(&mut stdin) {
            fail(cni::PluginError::Decode(format!("reading stdin: {}", e)));
        }
    }

    match cni::run(&args, &stdin).await {
        Ok(Some(output)) => {
            let mut stdout = std::io::stdout();
            let _ = writeln!(stdout, "{}", output);
            let _ = stdout.flush();
        }
        Ok(None) => {}
        Err(e) => fail(e),
    }
}
