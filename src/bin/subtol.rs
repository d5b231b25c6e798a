use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use subtol_client::oram::{OramConfig, USAGE as CONFIG_USAGE};
use subtol_client::session::{self, ClientConfig, Services};
use subtol_client::{AttestationSession, PollStatus, SecureSession};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Shell arguments use this character in place of a space.
const SPACE_STAND_IN: char = '€';

#[derive(Parser)]
#[command(name = "subtol", about = "Attested client for the subtol substring search service")]
struct Args {
    /// Base URL of the enclave-hosted service
    #[arg(long, env = "SUBTOL_URL", default_value = "http://127.0.0.1:49000")]
    url: String,

    /// Service-provider id (32 hex characters)
    #[arg(long, env = "SUBTOL_SPID")]
    spid: String,

    /// Attestation-service base URL
    #[arg(long, default_value = session::DEFAULT_IAS_URL)]
    ias_url: String,

    /// Subscription-key file (default: <SPID>.key in the working directory)
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Directory holding <dataset>.map character maps
    #[arg(long, default_value = ".")]
    map_dir: PathBuf,

    /// Refuse enclaves whose MRENCLAVE differs (64 hex characters)
    #[arg(long)]
    expected_mr_enclave: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Parser)]
#[command(no_binary_name = true, disable_help_subcommand = true)]
struct Shell {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Subcommand)]
enum ShellCommand {
    /// Server-side state of the session
    Poll,
    /// Identity of the attested enclave
    Info,
    /// Configure the ORAM: <oram_type> <Z> <stash> [S A] [rec_map_size] [sa_block_size]
    Config {
        #[arg(num_args = 0.., allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Load a dataset
    Load { filename: String, password: String },
    /// Look a pattern up, optionally bounding later page fetches
    Query {
        pattern: String,
        /// Pages the bounded fetch loop may request (negative: unbounded)
        #[arg(allow_hyphen_values = true)]
        max_occurrences: Option<i64>,
    },
    /// Fetch the next suffix-array page of the current query
    Suffix,
    /// Repeat a query and its page loop, printing one CSV line per run
    Benchmark {
        pattern: String,
        reps: usize,
        /// Stop each run after this many page fetches (negative: unbounded)
        #[arg(allow_hyphen_values = true)]
        max_occurrences: Option<i64>,
    },
    /// Close the session
    Close,
    /// Attest again after a close
    Restart,
    /// Clear the screen
    Clear,
    /// List commands
    Help,
    /// Close the session and quit
    Exit,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let key_file = args
        .key_file
        .clone()
        .unwrap_or_else(|| session::subscription_key_path(&PathBuf::from("."), &args.spid));
    let subscription_key = session::read_subscription_key(&key_file)
        .await
        .with_context(|| format!("reading subscription key from {}", key_file.display()))?;

    let mut builder = ClientConfig::builder()
        .service_url(&args.url)
        .ias_url(&args.ias_url)
        .spid(&args.spid)
        .subscription_key(subscription_key)
        .map_dir(&args.map_dir)
        .request_timeout(Duration::from_secs(args.timeout));
    if let Some(mr) = &args.expected_mr_enclave {
        builder = builder.expected_mr_enclave(mr);
    }
    let config = Arc::new(builder.build()?);
    let services = Services::http(&config)?;

    tracing::info!(url = %config.service_url, "starting remote attestation");
    let mut session = AttestationSession::establish(config, services).await?;
    println!("[OK] Remote attestation");
    if let Ok(identity) = session.enclave_identity() {
        println!("{identity}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"subtol:~$ ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let words: Vec<String> = line
            .split_whitespace()
            .map(|w| w.replace(SPACE_STAND_IN, " "))
            .collect();
        if words.is_empty() {
            continue;
        }

        let command = match Shell::try_parse_from(&words) {
            Ok(shell) => shell.command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        match command {
            ShellCommand::Exit => {
                if !session.is_closed() {
                    report(session.close().await.map(|()| "session closed".to_string()));
                }
                break;
            }
            ShellCommand::Restart => {
                if !session.is_closed() {
                    println!("session still open; close it first");
                    continue;
                }
                match session.restart().run().await {
                    Ok(fresh) => {
                        println!("[OK] Remote attestation");
                        session = fresh;
                    }
                    Err(e) => {
                        println!("attestation failed: {e}");
                        break;
                    }
                }
            }
            command => run(&mut session, command).await,
        }
    }
    Ok(())
}

async fn run(session: &mut SecureSession, command: ShellCommand) {
    match command {
        ShellCommand::Poll => report(session.poll().await.map(|status| {
            match status {
                PollStatus::Ready => "ready",
                PollStatus::Busy => "busy",
                PollStatus::NotFound => "session not found",
            }
            .to_string()
        })),
        ShellCommand::Info => report(session.enclave_identity().map(ToString::to_string)),
        ShellCommand::Config { args } => match OramConfig::parse_args(&args) {
            Ok(oram) => report(
                session
                    .configure(&oram)
                    .await
                    .map(|()| format!("configured {}", oram.label())),
            ),
            Err(e) => println!("{e}\nusage: config {CONFIG_USAGE}"),
        },
        ShellCommand::Load { filename, password } => report(
            session
                .load(&filename, &password)
                .await
                .map(|()| format!("loaded {filename}")),
        ),
        ShellCommand::Query {
            pattern,
            max_occurrences,
        } => report(session.query(&pattern, bound(max_occurrences)).await.map(|found| {
            format!(
                "start: {}\nend: {}\nmatches: {}\nserver time: {}",
                found.start,
                found.end,
                found.matches(),
                found.server_time
            )
        })),
        ShellCommand::Suffix => report(session.fetch_suffix_page().await.map(|page| {
            let mut out: Vec<String> = page.entries.iter().map(ToString::to_string).collect();
            out.push(format!("server time: {}", page.server_time));
            out.join("\n")
        })),
        ShellCommand::Benchmark {
            pattern,
            reps,
            max_occurrences,
        } => {
            report(session.benchmark(&pattern, reps, bound(max_occurrences)).await.map(|records| {
                records
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n")
            }))
        }
        ShellCommand::Close => report(session.close().await.map(|()| "session closed".to_string())),
        ShellCommand::Clear => print!("\x1b[2J\x1b[H"),
        ShellCommand::Help => match <Shell as clap::CommandFactory>::command().print_help() {
            Ok(()) => println!(),
            Err(e) => println!("error: {e}"),
        },
        ShellCommand::Exit | ShellCommand::Restart => {}
    }
}

/// Negative shell bounds mean unbounded.
fn bound(max_occurrences: Option<i64>) -> Option<u64> {
    max_occurrences.and_then(|m| u64::try_from(m).ok())
}

fn report(result: subtol_client::Result<String>) {
    match result {
        Ok(text) => println!("{text}"),
        Err(e) if e.is_fatal() => println!("error (session closed): {e}"),
        Err(e) => println!("error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ShellCommand {
        Shell::try_parse_from(line.split_whitespace()).unwrap().command
    }

    #[test]
    fn negative_bound_is_unbounded() {
        assert_eq!(bound(Some(-1)), None);
        assert_eq!(bound(Some(3)), Some(3));
        assert_eq!(bound(None), None);
    }

    #[test]
    fn query_takes_optional_bound() {
        assert!(matches!(
            parse("query an -1"),
            ShellCommand::Query { ref pattern, max_occurrences: Some(-1) } if pattern == "an"
        ));
        assert!(matches!(
            parse("query an"),
            ShellCommand::Query { max_occurrences: None, .. }
        ));
    }

    #[test]
    fn help_renders() {
        assert!(matches!(parse("help"), ShellCommand::Help));
        let help = <Shell as clap::CommandFactory>::command().render_help().to_string();
        assert!(help.contains("benchmark"));
    }
}
