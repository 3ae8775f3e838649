//! simpub-ctl: command-line interface for the simpub daemon and bus.

use std::time::Duration;

use anyhow::{Context, Result};

mod cmd;

const DEFAULT_PORT: u16 = 7723;
const DEFAULT_WAIT_MS: u64 = 3_000;

fn print_usage() {
    println!("Usage: simpub-ctl [--port <port>] [--wait <ms>] <command>");
    println!();
    println!("Daemon commands:");
    println!("  status                               Show daemon status");
    println!("  peers                                List discovered peers");
    println!("  topics                               List published topics");
    println!("  services                             List offered services");
    println!();
    println!("Bus commands:");
    println!("  request <peer> <service> [payload]   Send one request and print the reply");
    println!("  watch <peer> <topic>...              Print frames of topics until Ctrl-C");
    println!("  rename <peer> <new-name>             Ask a peer to change its name");
    println!();
    println!("Options:");
    println!("  --port <port>   Status endpoint port (default: {})", DEFAULT_PORT);
    println!("  --wait <ms>     How long to wait for a peer (default: {})", DEFAULT_WAIT_MS);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut wait = Duration::from_millis(DEFAULT_WAIT_MS);
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--wait" => {
                i += 1;
                let ms: u64 = args
                    .get(i)
                    .context("--wait requires a value")?
                    .parse()
                    .context("--wait must be a number of milliseconds")?;
                wait = Duration::from_millis(ms);
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["peers"] => cmd::status::cmd_peers(port).await,
        ["topics"] => cmd::status::cmd_topics(port).await,
        ["services"] => cmd::status::cmd_services(port).await,
        ["request", peer, service] => cmd::peer::cmd_request(peer, service, "", wait).await,
        ["request", peer, service, payload] => {
            cmd::peer::cmd_request(peer, service, payload, wait).await
        }
        ["watch", peer, topics @ ..] if !topics.is_empty() => {
            cmd::peer::cmd_watch(peer, topics, wait).await
        }
        ["rename", peer, new_name] => cmd::peer::cmd_rename(peer, new_name, wait).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            print_usage();
            std::process::exit(1);
        }
    }
}
