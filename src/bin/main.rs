//! Beesigner CLI - hardware-signer wallet from the terminal
//!
//! Every command prints JSON on stdout:
//!   beesigner addresses                       → [{index, address, used}]
//!   beesigner receive                         → {address, index}
//!   beesigner verify-address <index>          → {index, address, matches}
//!   beesigner balance                         → {confirmed, pending, total}
//!   beesigner history                         → [{txid, received, sent, ...}]
//!   beesigner preview <to> <sat> [--fee-rate N]
//!   beesigner send <to> <sat> [--fee-rate N] [--yes]
//!   beesigner sign-message <index> <message>
//!   beesigner verify-message <address> <signature> <message>
//!   beesigner price
//!   beesigner watch-price
//!
//! The device is the seed emulator, keyed by `BEESIGNER_MNEMONIC` (or
//! `--mnemonic`). On-device approval is a stdin prompt unless `--yes`.
//!
//! Configuration comes from `BEESIGNER_*` variables, `.env` included.
//!
//! Output format:
//!   --pretty   Pretty-print JSON (default for tty)

use anyhow::{anyhow, bail, Context};
use beesigner::core::paths::env as env_keys;
use beesigner::device::{ApprovalFn, SigningRequest};
use beesigner::logging::init_logging;
use beesigner::{
    install_signal_handlers, load_dotenv, verify_message, DeviceHandle, EsploraClient, Network, PriceFeed, SeedDevice, SendRequest,
    TransactionDraft, WalletConfig, WalletSession,
};
use bitcoin::address::NetworkUnchecked;
use bitcoin::Address;
use serde_json::{json, Value};
use std::env;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Confirmation target used when `--fee-rate` is not given.
const DEFAULT_TARGET_BLOCKS: u16 = 6;

fn main() {
    let loaded = load_dotenv(Path::new(".env"));

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);
    init_logging(opts.verbose);
    debug!(loaded, "Loaded .env");

    if opts.help {
        print_usage();
        return;
    }

    if opts.version {
        println!("beesigner {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let Some(command) = opts.command.clone() else {
        print_usage();
        return;
    };

    let result = tokio::runtime::Runtime::new()
        .context("starting tokio runtime")
        .and_then(|rt| rt.block_on(run(&command, &opts)));

    let pretty = opts.pretty || io::stdout().is_terminal();
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({"error": format!("{:#}", e)}), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    rendered.unwrap_or_else(|_| value.to_string())
}

async fn run(command: &str, opts: &ParsedArgs) -> anyhow::Result<Value> {
    match command {
        "addresses" => cmd_addresses(opts).await,
        "receive" => cmd_receive(opts).await,
        "verify-address" => cmd_verify_address(opts).await,
        "balance" => cmd_balance(opts).await,
        "history" => cmd_history(opts).await,
        "preview" => cmd_preview(opts).await,
        "send" => cmd_send(opts).await,
        "sign-message" => cmd_sign_message(opts).await,
        "verify-message" => cmd_verify_message(opts),
        "price" => cmd_price(opts).await,
        "watch-price" => cmd_watch_price(opts).await,
        other => Err(anyhow!("Unknown command: {}", other)),
    }
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    positional: Vec<String>,
    mnemonic: Option<String>,
    network: Option<String>,
    explorer: Option<String>,
    /// Raw `--fee-rate` value, checked by `fee_rate()`
    fee_rate: Option<String>,
    yes: bool,
    verbose: bool,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "--pretty" => opts.pretty = true,
                "--verbose" | "-v" => opts.verbose = true,
                "--yes" | "-y" => opts.yes = true,
                "--mnemonic" | "-m" => {
                    if i + 1 < args.len() {
                        opts.mnemonic = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--network" | "-n" => {
                    if i + 1 < args.len() {
                        opts.network = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--explorer" | "-e" => {
                    if i + 1 < args.len() {
                        opts.explorer = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--fee-rate" | "-f" => {
                    opts.fee_rate = Some(args.get(i + 1).cloned().unwrap_or_default());
                    i += 1;
                }
                _ if !arg.starts_with('-') => positional.push(arg.clone()),
                _ => {} // Ignore unknown flags
            }
            i += 1;
        }

        // First positional is command, the rest are its arguments
        if !positional.is_empty() {
            opts.command = Some(positional.remove(0));
        }
        opts.positional = positional;

        // Environment is lower priority than CLI args
        if opts.mnemonic.is_none() {
            opts.mnemonic = env::var(env_keys::MNEMONIC).ok().filter(|s| !s.trim().is_empty());
        }

        opts
    }

    fn arg(&self, n: usize, name: &str) -> anyhow::Result<&str> {
        self.positional.get(n).map(String::as_str).ok_or_else(|| anyhow!("missing argument <{}>", name))
    }

    /// Positional arguments from `n` on, joined: messages may contain spaces.
    fn rest(&self, n: usize, name: &str) -> anyhow::Result<String> {
        if self.positional.len() <= n {
            bail!("missing argument <{}>", name);
        }
        Ok(self.positional[n..].join(" "))
    }

    fn fee_rate(&self) -> anyhow::Result<Option<u64>> {
        self.fee_rate
            .as_deref()
            .map(|raw| raw.trim().parse::<u64>().with_context(|| format!("--fee-rate must be whole sat/vB, got {:?}", raw)))
            .transpose()
    }

    fn config(&self) -> anyhow::Result<WalletConfig> {
        let mut config = WalletConfig::from_env()?;
        if let Some(net) = &self.network {
            let network: Network = net.parse()?;
            config.network = network;
        }
        if let Some(url) = &self.explorer {
            config = config.with_explorer(url.clone());
        }
        Ok(config)
    }
}

async fn open_session(opts: &ParsedArgs) -> anyhow::Result<WalletSession> {
    let config = opts.config()?;
    let words = opts
        .mnemonic
        .as_deref()
        .ok_or_else(|| anyhow!("no device: set {} or pass --mnemonic", env_keys::MNEMONIC))?;

    let approval: ApprovalFn = if opts.yes { Box::new(|_| true) } else { Box::new(prompt_approval) };
    let device = SeedDevice::from_mnemonic(words, "", config.network)?.with_approval(approval);
    let explorer = Arc::new(EsploraClient::from_config(&config)?);

    Ok(WalletSession::connect(config, DeviceHandle::new(device), explorer).await?)
}

/// Stand-in for the device's confirm button.
///
/// Runs while the device lock is held, as a real device would sit waiting
/// for its button. The stdin read goes through `block_in_place`, so this
/// needs the multi-thread runtime `main` builds.
fn prompt_approval(request: &SigningRequest) -> bool {
    let mut stderr = io::stderr();
    let _ = writeln!(stderr, "Sign transaction with {} input(s)?", request.inputs);
    for (address, value) in &request.outputs {
        let _ = writeln!(stderr, "  {} sat -> {}", value, address);
    }
    if let Some(fee) = request.fee {
        let _ = writeln!(stderr, "  fee {} sat", fee);
    }
    let _ = write!(stderr, "Approve? [y/N] ");
    let _ = stderr.flush();

    let mut answer = String::new();
    let read = tokio::task::block_in_place(|| io::stdin().lock().read_line(&mut answer));
    if read.is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn cmd_addresses(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let mut session = open_session(opts).await?;
    session.refresh().await?;
    let addresses: Vec<Value> = session
        .addresses()
        .iter()
        .map(|r| json!({"index": r.index, "address": r.address.to_string(), "used": r.used}))
        .collect();
    Ok(json!({"descriptor": session.descriptor().to_string(), "addresses": addresses}))
}

async fn cmd_receive(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let mut session = open_session(opts).await?;
    session.refresh().await?;
    let (address, index) = session.receive_address().await?;
    Ok(json!({"address": address.to_string(), "index": index}))
}

async fn cmd_verify_address(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let index: u32 = opts.arg(0, "index")?.parse().context("index must be a number")?;
    let session = open_session(opts).await?;
    let matches = session.verify_address(index).await?;
    let address = session.ledger().get(index).map(|r| r.address.to_string());
    Ok(json!({"index": index, "address": address, "matches": matches}))
}

async fn cmd_balance(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let mut session = open_session(opts).await?;
    let balance = session.refresh().await?.balance;
    Ok(json!({"confirmed": balance.confirmed, "pending": balance.pending, "total": balance.total()}))
}

async fn cmd_history(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let mut session = open_session(opts).await?;
    let snapshot = session.refresh().await?;
    let txs: Vec<Value> = snapshot
        .transactions
        .iter()
        .map(|t| {
            json!({
                "txid": t.txid.to_string(),
                "received": t.received,
                "sent": t.sent,
                "net": t.net(),
                "fee": t.fee,
                "confirmed": t.confirmed,
                "block_height": t.block_height,
                "timestamp": t.timestamp,
            })
        })
        .collect();
    Ok(Value::Array(txs))
}

async fn send_request(opts: &ParsedArgs, session: &WalletSession) -> anyhow::Result<SendRequest> {
    let to = opts.arg(0, "to")?;
    let amount: u64 = opts.arg(1, "sat")?.parse().context("amount must be whole satoshis")?;
    let fee_rate = match opts.fee_rate()? {
        Some(rate) => rate,
        None => session.recommended_fee_rate(DEFAULT_TARGET_BLOCKS).await,
    };
    Ok(SendRequest::new(to, amount, fee_rate, session.config().network)?)
}

fn draft_json(draft: &TransactionDraft, fee_rate: u64) -> Value {
    let inputs: Vec<Value> = draft
        .inputs
        .iter()
        .map(|u| json!({"outpoint": u.outpoint.to_string(), "value": u.value, "address": u.address.to_string(), "index": u.address_index}))
        .collect();
    json!({
        "inputs": inputs,
        "recipient": draft.recipient.to_string(),
        "amount": draft.recipient_value,
        "change": draft.change.as_ref().map(|c| json!({"address": c.address.to_string(), "index": c.index, "value": c.value})),
        "fee": draft.fee,
        "fee_rate": fee_rate,
        "vsize": draft.vsize,
    })
}

async fn cmd_preview(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let session = open_session(opts).await?;
    let request = send_request(opts, &session).await?;
    let draft = session.preview(&request).await?;
    Ok(draft_json(&draft, request.fee_rate))
}

async fn cmd_send(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let session = open_session(opts).await?;
    let request = send_request(opts, &session).await?;
    let receipt = session.send(&request).await?;
    Ok(json!({
        "txid": receipt.txid.to_string(),
        "amount": receipt.amount,
        "fee": receipt.fee,
        "change": receipt.change,
        "inputs": receipt.inputs,
    }))
}

async fn cmd_sign_message(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let index: u32 = opts.arg(0, "index")?.parse().context("index must be a number")?;
    let message = opts.rest(1, "message")?;
    let session = open_session(opts).await?;
    let signed = session.sign_message(index, &message).await?;
    Ok(json!({"address": signed.address.to_string(), "message": signed.message, "signature": signed.signature}))
}

fn cmd_verify_message(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let config = opts.config()?;
    let raw = opts.arg(0, "address")?;
    let address = raw
        .parse::<Address<NetworkUnchecked>>()
        .with_context(|| format!("invalid address {}", raw))?
        .require_network(config.network.to_bitcoin())
        .with_context(|| format!("address {} is not for {}", raw, config.network.as_str()))?;
    let signature = opts.arg(1, "signature")?;
    let message = opts.rest(2, "message")?;
    let valid = verify_message(&address, &message, signature)?;
    Ok(json!({"address": address.to_string(), "valid": valid}))
}

async fn cmd_price(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let config = opts.config()?;
    let feed = PriceFeed::new(config.price_sources)?;
    Ok(serde_json::to_value(feed.current_price_usd().await?)?)
}

/// Poll until Ctrl+C, printing each fresh quote as a JSON line.
async fn cmd_watch_price(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let config = opts.config()?;
    let feed = PriceFeed::new(config.price_sources.clone())?;
    let shutdown = install_signal_handlers();
    let poller = feed.spawn_poller(config.price_poll_interval, shutdown.clone());

    let mut ticker = tokio::time::interval(config.price_poll_interval);
    let mut last_printed = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(quote) = feed.cached().await {
                    if last_printed.as_ref() != Some(&quote.fetched_at) {
                        println!("{}", serde_json::to_string(&quote)?);
                        last_printed = Some(quote.fetched_at);
                    }
                }
            }
            _ = shutdown.wait() => break,
        }
    }

    let _ = poller.await;
    Ok(json!({"stopped": true, "last": feed.cached().await}))
}

fn print_usage() {
    println!(
        r#"beesigner - hardware-signer Bitcoin wallet

USAGE:
    beesigner <command> [args] [options]

COMMANDS:
    addresses                         Derived addresses and usage
    receive                           Next unused receive address
    verify-address <index>            Show address on the device and compare
    balance                           Confirmed, pending and total balance
    history                           Wallet transactions, newest first
    preview <to> <sat>                Coin selection and fee, without signing
    send <to> <sat>                   Build, sign on device, broadcast
    sign-message <index> <message>    Sign a message with address <index>
    verify-message <addr> <sig> <msg> Verify a signed message
    price                             Current BTC/USD
    watch-price                       Poll BTC/USD until Ctrl+C

OPTIONS:
    -m, --mnemonic <words>   Emulator seed (or {mnemonic})
    -n, --network <net>      bitcoin, testnet, signet, regtest (or {network})
    -e, --explorer <url>     Esplora base URL (or {explorer})
    -f, --fee-rate <n>       sat/vB (default: explorer estimate for {target} blocks)
    -y, --yes                Approve signing without prompting
    -v, --verbose            Debug logging
    --pretty                 Pretty-print JSON (default for tty)
    -h, --help               Show this help
    -V, --version            Show version"#,
        mnemonic = env_keys::MNEMONIC,
        network = env_keys::NETWORK,
        explorer = env_keys::EXPLORER_URL,
        target = DEFAULT_TARGET_BLOCKS,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ParsedArgs {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        ParsedArgs::parse(&args)
    }

    #[test]
    fn test_fee_rate_parsed() {
        let opts = parse(&["send", "tb1qx", "1000", "--fee-rate", "7", "--yes"]);
        assert_eq!(opts.command.as_deref(), Some("send"));
        assert_eq!(opts.positional, vec!["tb1qx", "1000"]);
        assert_eq!(opts.fee_rate().unwrap(), Some(7));
        assert!(opts.yes);

        assert_eq!(parse(&["preview", "tb1qx", "1000"]).fee_rate().unwrap(), None);
    }

    #[test]
    fn test_malformed_fee_rate_is_error() {
        let err = parse(&["send", "tb1qx", "1000", "--fee-rate", "5x"]).fee_rate().unwrap_err();
        assert!(format!("{:#}", err).contains("--fee-rate must be whole sat/vB, got \"5x\""));

        assert!(parse(&["send", "tb1qx", "1000", "-f", "2.5"]).fee_rate().is_err());
    }

    #[test]
    fn test_trailing_fee_rate_flag_is_error() {
        let opts = parse(&["send", "tb1qx", "1000", "--fee-rate"]);
        assert_eq!(opts.positional, vec!["tb1qx", "1000"]);
        assert!(opts.fee_rate().is_err());
    }
}
