//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::chain::{ChainClient, Explorer, HttpChainClient, LocalSigner, U256};
use crate::config::{mask_url, Config};
use crate::error::Error;
use crate::gate::endpoint::{ChainEndpoint, KNOWN_NETWORKS};
use crate::gate::{parse_address, vault, ProbeOutcome, SecretKey, OVERRIDE_PHRASE};
use crate::redact::mask_address;
use crate::rescue::{Command, Connector, Notice, RunOutcome, SessionController, SessionState};

/// Environment variable checked before prompting for the ephemeral secret
pub const SECRET_ENV: &str = "RESCUE_SECRET_KEY";

const HELP: &str = "commands: status | stop | restart | switch | help";

/// Arm a session and monitor the vault until the rescue lands
pub async fn run(config: &Config, secret_from_env: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_notices(notice_rx));

    let mut controller = SessionController::new(config, connector(config), notice_tx, shutdown.clone());

    let state = controller
        .set_endpoint(&config.chain.endpoint)
        .map_err(|e| anyhow::anyhow!("Endpoint rejected: {}", e.redacted()))?;
    if state == SessionState::UntrustedPending {
        confirm_untrusted(&mut controller, &config.chain.endpoint)?;
    }

    let vault_address = controller.set_vault(&config.vault.address)?;
    info!("Validating vault {}", mask_address(&vault_address.to_string()));
    let asset = controller
        .validate_vault()
        .await
        .map_err(|e| anyhow::anyhow!("Vault validation failed: {}", e.redacted()))?;
    println!("Vault OK, underlying asset {}", mask_address(&asset.to_string()));

    let destination = match &config.session.destination {
        Some(destination) => destination.clone(),
        None => Input::<String>::new()
            .with_prompt("Destination address")
            .validate_with(|raw: &String| parse_address(raw).map(|_| ()).map_err(|e| e.to_string()))
            .interact_text()?,
    };

    let secret = read_secret(secret_from_env)?;
    arm_and_start(&mut controller, &secret, &destination).await?;
    drop(secret);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                shutdown.cancel();
            }
        });
    }

    let mut lines = spawn_line_reader();
    let (command_tx, mut command_rx) = mpsc::channel(16);
    let mut lines_open = true;
    println!("{}", HELP);

    loop {
        let outcome = {
            let run = controller.run(&mut command_rx);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    line = lines.recv(), if lines_open => match line {
                        Some(line) => forward_command(&line, &command_tx),
                        None => {
                            debug!("stdin closed, operator commands disabled");
                            lines_open = false;
                        }
                    },
                }
            }
        };

        match outcome {
            RunOutcome::Rescued => {
                info!("Rescue complete");
                break;
            }
            RunOutcome::IdleExpired => {
                warn!("Session expired after inactivity");
                break;
            }
            RunOutcome::Shutdown => break,
            RunOutcome::Switched => {
                if !lines_open {
                    warn!("stdin closed, cannot read a new secret");
                    break;
                }
                println!("Paste the next ephemeral secret (input is echoed):");
                let Some(line) = lines.recv().await.map(Zeroizing::new) else {
                    break;
                };
                let secret = match SecretKey::parse(&line) {
                    Ok(secret) => secret,
                    Err(e) => {
                        error!("{}", e.redacted());
                        break;
                    }
                };
                if let Err(e) = arm_and_start(&mut controller, &secret, &destination).await {
                    error!("{}", e);
                    break;
                }
            }
        }
    }

    controller.teardown();
    drop(controller);
    let _ = printer.await;
    Ok(())
}

/// Show endpoint trust, chain, block and gas cost
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== ENDPOINT HEALTH CHECK ===\n");

    let endpoint = ChainEndpoint::parse(&config.chain.endpoint)?;
    println!("Endpoint: {}", mask_url(endpoint.url()));
    if endpoint.is_allow_listed() {
        println!("Trust: allow-listed");
    } else {
        println!("Trust: NOT allow-listed (`run` will ask for the override phrase)");
    }

    let client = HttpChainClient::new(endpoint.url(), config.chain.clone())
        .context("Failed to build chain client")?;

    let start = Instant::now();
    let health = client
        .health()
        .await
        .map_err(|e| anyhow::anyhow!("Endpoint unreachable: {}", e.redacted()))?;
    println!(
        "Chain: {} ({}ms)",
        network_name(health.chain_id),
        start.elapsed().as_millis()
    );
    println!("Block: {}", health.block_number);

    match client.gas_price().await {
        Ok(price) => println!("Gas price: {} gwei", format_units(price, 9)),
        Err(e) => println!("Gas price: FAILED ({})", e.redacted()),
    }
    match client.estimate_rescue_cost().await {
        Ok(cost) => println!("Estimated rescue cost: {} (native units)", format_units(cost, 18)),
        Err(e) => println!("Estimated rescue cost: FAILED ({})", e.redacted()),
    }

    Ok(())
}

/// Probe the configured vault's `asset()`
pub async fn probe(config: &Config) -> Result<()> {
    let address = parse_address(&config.vault.address)?;
    let client = HttpChainClient::new(&config.chain.endpoint, config.chain.clone())?;

    info!("Probing vault {}", mask_address(&config.vault.address));
    let probe = vault::probe(&client, address, client.endpoint()).await;
    let explorer = client.chain_id().await.ok().and_then(Explorer::for_chain);

    match probe.outcome() {
        ProbeOutcome::Valid { asset } => {
            println!("Vault: VALID");
            println!("Asset: {}", asset);
            if let Some(explorer) = explorer {
                println!("View on {}: {}", explorer.name, explorer.address_url(&address.to_string()));
            }
        }
        ProbeOutcome::Invalid { reason } => {
            println!("Vault: INVALID");
            println!("Reason: {}", reason);
            anyhow::bail!("vault probe failed");
        }
    }

    Ok(())
}

/// Derive the ephemeral address and show its gas balance
pub async fn derive(config: &Config, secret_from_env: bool) -> Result<()> {
    let secret = read_secret(secret_from_env)?;
    let signer = LocalSigner::from_secret(&secret)?;
    drop(secret);
    let address = signer.address();
    println!("Ephemeral address: {}", address);

    let client = HttpChainClient::new(&config.chain.endpoint, config.chain.clone())?;
    match client.read_native_balance(address).await {
        Ok(balance) if balance.is_zero() => {
            println!("Native balance: 0 (fund it before `run`, gas is paid from this wallet)")
        }
        Ok(balance) => println!("Native balance: {}", format_units(balance, 18)),
        Err(e) => warn!("Could not read balance: {}", e.redacted()),
    }

    if let Some(explorer) = client.chain_id().await.ok().and_then(Explorer::for_chain) {
        println!("View on {}: {}", explorer.name, explorer.address_url(&address.to_string()));
    }

    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

fn connector(config: &Config) -> Connector {
    let chain = config.chain.clone();
    Box::new(move |url| {
        let client: Arc<dyn ChainClient> = Arc::new(HttpChainClient::new(url, chain.clone())?);
        Ok(client)
    })
}

fn confirm_untrusted(controller: &mut SessionController, url: &str) -> Result<()> {
    warn!("Endpoint {} is not on the trusted list", mask_url(url));
    println!(
        "\nA malicious node can lie about vault state and see your signed transactions.\nType \"{}\" to continue:",
        OVERRIDE_PHRASE
    );
    let phrase: String = Input::new()
        .with_prompt("Confirm")
        .allow_empty(true)
        .interact_text()?;

    if !controller.confirm_override(&phrase)? {
        anyhow::bail!("override phrase did not match, refusing untrusted endpoint");
    }
    info!("Untrusted endpoint accepted by operator");
    Ok(())
}

fn read_secret(from_env: bool) -> Result<SecretKey> {
    if let Ok(raw) = std::env::var(SECRET_ENV) {
        let raw = Zeroizing::new(raw);
        return SecretKey::parse(&raw).map_err(|e| anyhow::anyhow!(e.redacted()));
    }
    if from_env {
        return Err(Error::MissingEnvVar(SECRET_ENV.to_string()).into());
    }

    let raw = Zeroizing::new(
        Password::new()
            .with_prompt("Ephemeral wallet secret (hex)")
            .interact()?,
    );
    SecretKey::parse(&raw).map_err(|e| anyhow::anyhow!(e.redacted()))
}

async fn arm_and_start(controller: &mut SessionController, secret: &SecretKey, destination: &str) -> Result<()> {
    let ephemeral = controller
        .arm(secret, destination)
        .map_err(|e| anyhow::anyhow!("Could not arm session: {}", e.redacted()))?;
    println!("Ephemeral wallet: {}", ephemeral);

    if let Err(e) = controller.start().await {
        // leave nothing armed behind a failed pre-flight
        controller.switch_wallet().ok();
        return Err(anyhow::anyhow!("Pre-flight failed: {} ({})", e.redacted(), e.class().hint()));
    }

    if let Some(explorer) = controller.explorer() {
        println!("Watch on {}: {}", explorer.name, explorer.address_url(&ephemeral.to_string()));
    }
    Ok(())
}

/// Operator lines from stdin
///
/// Read on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_line_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn forward_command(line: &str, commands: &mpsc::Sender<Command>) {
    let command = match parse_command(line) {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(unknown) => {
            println!("unknown command `{}`; {}", unknown, HELP);
            return;
        }
    };
    if let Err(e) = commands.try_send(command) {
        debug!("Command dropped: {}", e);
    }
}

/// Map an operator line to a command; `help` is answered locally
fn parse_command(line: &str) -> std::result::Result<Option<Command>, String> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "status" | "s" => Ok(Some(Command::Status)),
        "stop" => Ok(Some(Command::Stop)),
        "restart" | "start" => Ok(Some(Command::Restart)),
        "switch" => Ok(Some(Command::SwitchWallet)),
        "help" | "?" => {
            println!("{}", HELP);
            Ok(None)
        }
        other => Err(other.to_string()),
    }
}

async fn print_notices(mut notices: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        match &notice {
            Notice::Halted { .. } | Notice::ExecutionFailed { .. } => eprintln!("[{}] {}", stamp, notice),
            _ => println!("[{}] {}", stamp, notice),
        }
    }
}

fn network_name(chain_id: u64) -> String {
    KNOWN_NETWORKS
        .iter()
        .find(|n| n.chain_id == chain_id)
        .map(|n| format!("{} (id {})", n.name, chain_id))
        .unwrap_or_else(|| format!("chain id {}", chain_id))
}

/// Fixed-point display with four fractional digits
fn format_units(value: U256, decimals: u8) -> String {
    let scale = U256::from(10u64).pow(U256::from(decimals));
    let whole = value / scale;
    let frac = (value % scale) * U256::from(10_000u64) / scale;
    format!("{}.{:0>4}", whole, frac.to::<u64>())
}
