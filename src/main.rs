use std::env;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Usage:\n  costlink serve --config <path>\n  costlink verify-audit --path <path> [--mirror <path>]";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "costlink=info,costlink_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    match cmd.as_str() {
        "serve" => {
            let mut config_path = String::from("./config/example-config.yaml");
            while let Some(arg) = args.next() {
                if arg == "--config" {
                    if let Some(v) = args.next() {
                        config_path = v;
                    }
                }
            }

            let cfg = match costlink_config::load_and_validate(&config_path) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("failed to load config: {e}");
                    std::process::exit(1);
                }
            };
            tracing::info!(config = %config_path, "configuration loaded");

            if let Err(e) = costlink_server::serve(cfg).await {
                eprintln!("server exited with error: {e}");
                std::process::exit(1);
            }
        }
        "verify-audit" => {
            let mut path = None;
            let mut mirror = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--path" => path = args.next(),
                    "--mirror" => mirror = args.next(),
                    _ => {}
                }
            }
            let Some(path) = path else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            match costlink_server::verify_audit_chain_with_mirror(&path, mirror.as_deref()) {
                Ok(summary) => println!("{summary}"),
                Err(e) => {
                    eprintln!("audit verification failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}
