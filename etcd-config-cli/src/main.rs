use std::env;
use std::time::Duration;

use etcd_config::{EtcdConfig, Settings, parse_endpoints};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: etcd-config [ENDPOINTS NAMESPACE] [dump | get KEY | follow]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    // Endpoints and namespace come as a pair; without them the environment
    // supplies every setting.
    let (settings, rest) = match (args.get(1), args.get(2)) {
        (Some(endpoints), Some(namespace)) if !is_mode(endpoints) => (
            Settings::new(parse_endpoints(endpoints), namespace.as_str()),
            &args[3..],
        ),
        _ => match Settings::from_env() {
            Ok(settings) => (settings, &args[args.len().min(1)..]),
            Err(e) => {
                eprintln!("{}", USAGE);
                return Err(e.into());
            }
        },
    };

    let config = EtcdConfig::connect(settings).await?;
    let mode = rest.first().map(String::as_str).unwrap_or("dump");

    match mode {
        "dump" => println!("{}", config),
        "get" => {
            let key = rest.get(1).ok_or(USAGE)?;
            println!("config {} is {:?}", key, config.get(key));
        }
        "follow" => follow(&config).await?,
        _ => {
            eprintln!("{}", USAGE);
            return Err(format!("unknown mode {:?}", mode).into());
        }
    }

    config.shutdown().await;
    Ok(())
}

fn is_mode(arg: &str) -> bool {
    matches!(arg, "dump" | "get" | "follow")
}

/// Reprints the namespace whenever its revision moves, until Ctrl-C.
async fn follow(config: &EtcdConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut last_revision = None;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("interrupted, shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                let revision = config.revision();
                if last_revision != Some(revision) {
                    last_revision = Some(revision);
                    println!("# revision {} ({:?})", revision, config.state());
                    println!("{}", config);
                }
            }
        }
    }
}
