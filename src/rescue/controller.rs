//! Session controller
//!
//! Single source of truth for automation status. Owns the gatekeeper, the
//! key lifecycle, the scheduler, the failure counter and the processing
//! guard, and lends them to the scheduler and executor for each tick.
//!
//! [`SessionController::run`] is the event loop: one task selecting over the
//! polling timer, the idle deadline, the post-success wipe deadline,
//! operator commands and shutdown.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chain::{ChainClient, Explorer, TxHash};
use crate::config::Config;
use crate::error::{Error, ErrorClass, Result};
use crate::gate::{parse_address, Gatekeeper, ProbeOutcome, SecretKey};
use crate::redact::mask_address;
use crate::session::{KeyLifecycle, StrandedBalance, TransactionRecord};

use super::executor::Leg;
use super::scheduler::{PollingScheduler, TickContext, TickOutcome};
use super::state::{FailureCounter, ProcessingGuard, SessionState};

/// Builds a chain client for an endpoint URL
pub type Connector = Box<dyn Fn(&str) -> Result<Arc<dyn ChainClient>> + Send + Sync>;

/// Operator commands accepted while running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Stop,
    Restart,
    SwitchWallet,
}

/// Why [`SessionController::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Rescue completed and the session was wiped
    Rescued,
    /// Session wiped after the inactivity window ran out
    IdleExpired,
    /// Operator switched wallet; the controller is idle
    Switched,
    /// Shutdown requested; the controller was torn down
    Shutdown,
}

/// Events surfaced to the operator
#[derive(Debug, Clone)]
pub enum Notice {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    PollWarning {
        class: ErrorClass,
        message: String,
        failures: u32,
        max: u32,
    },
    ExecutionFailed {
        leg: Leg,
        class: ErrorClass,
        message: String,
        failures: u32,
        max: u32,
        stranded: bool,
    },
    Halted {
        failures: u32,
    },
    Rescued {
        amount: U256,
        redeem: Option<String>,
        transfer: String,
    },
    Wiped,
    IdleExpired,
    Status(StatusReport),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::StateChanged { from, to } => write!(f, "state: {} -> {}", from, to),
            Notice::PollWarning {
                class,
                message,
                failures,
                max,
            } => write!(
                f,
                "poll failed ({}/{}): {} ({})",
                failures,
                max,
                message,
                class.hint()
            ),
            Notice::ExecutionFailed {
                leg,
                class,
                message,
                failures,
                max,
                stranded,
            } => {
                write!(
                    f,
                    "{} leg failed ({}/{}): {} ({})",
                    leg,
                    failures,
                    max,
                    message,
                    class.hint()
                )?;
                if *stranded {
                    write!(f, "; redeemed funds may sit in the ephemeral wallet and will be forwarded on a later tick")?;
                }
                Ok(())
            }
            Notice::Halted { failures } => write!(
                f,
                "HALTED after {} consecutive failures; check the endpoint and vault, then `restart`",
                failures
            ),
            Notice::Rescued {
                amount,
                redeem,
                transfer,
            } => {
                write!(f, "rescued {} units", amount)?;
                if let Some(redeem) = redeem {
                    write!(f, "\n  redeem:   {}", redeem)?;
                }
                write!(f, "\n  transfer: {}", transfer)
            }
            Notice::Wiped => write!(f, "secret wiped from memory"),
            Notice::IdleExpired => write!(f, "idle timeout reached, secret wiped from memory"),
            Notice::Status(report) => write!(f, "{}", report),
        }
    }
}

/// Snapshot for the `status` command
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: SessionState,
    pub session: Option<Uuid>,
    pub ephemeral: Option<Address>,
    pub destination: Option<Address>,
    pub endpoint_trusted: bool,
    pub vault_valid: Option<bool>,
    pub failures: u32,
    pub max_failures: u32,
    pub last_capacity: Option<U256>,
    pub accelerated: bool,
    pub guard_held: bool,
    pub records: TransactionRecord,
    pub stranded: Option<StrandedBalance>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masked = |a: Option<Address>| {
            a.map(|a| mask_address(&a.to_string()))
                .unwrap_or_else(|| "-".to_string())
        };
        writeln!(f, "state:       {}", self.state)?;
        if let Some(id) = self.session {
            writeln!(f, "session:     {}", id)?;
        }
        writeln!(f, "ephemeral:   {}", masked(self.ephemeral))?;
        writeln!(f, "destination: {}", masked(self.destination))?;
        writeln!(f, "endpoint:    {}", if self.endpoint_trusted { "trusted" } else { "untrusted" })?;
        writeln!(
            f,
            "vault:       {}",
            match self.vault_valid {
                Some(true) => "valid",
                Some(false) => "invalid",
                None => "not validated",
            }
        )?;
        writeln!(f, "failures:    {}/{}", self.failures, self.max_failures)?;
        writeln!(
            f,
            "capacity:    {}{}",
            self.last_capacity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            if self.accelerated { " (fast polling)" } else { "" }
        )?;
        if self.guard_held {
            writeln!(f, "executing:   yes")?;
        }
        if let Some(stranded) = self.stranded {
            writeln!(f, "stranded:    {} units awaiting forward", stranded.amount)?;
        }
        if let Some(hash) = self.records.redeem {
            writeln!(f, "redeem tx:   {}", hash)?;
        }
        if let Some(hash) = self.records.transfer {
            writeln!(f, "transfer tx: {}", hash)?;
        }
        Ok(())
    }
}

/// Sleep until `deadline`, or forever without one
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct SessionController {
    connector: Connector,
    client: Option<Arc<dyn ChainClient>>,
    gate: Gatekeeper,
    keys: KeyLifecycle,
    scheduler: PollingScheduler,
    failures: FailureCounter,
    guard: ProcessingGuard,
    state: SessionState,
    explorer: Option<Explorer>,
    success_grace: Duration,
    wipe_at: Option<Instant>,
    notices: mpsc::UnboundedSender<Notice>,
    shutdown: CancellationToken,
}

impl SessionController {
    pub fn new(
        config: &Config,
        connector: Connector,
        notices: mpsc::UnboundedSender<Notice>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            client: None,
            gate: Gatekeeper::new(),
            keys: KeyLifecycle::new(config.session.idle_timeout()),
            scheduler: PollingScheduler::new(&config.polling, shutdown.child_token()),
            failures: FailureCounter::new(config.polling.max_failures),
            guard: ProcessingGuard::new(),
            state: SessionState::Idle,
            explorer: None,
            success_grace: config.session.success_grace(),
            wipe_at: None,
            notices,
            shutdown,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn gatekeeper(&self) -> &Gatekeeper {
        &self.gate
    }

    pub fn explorer(&self) -> Option<Explorer> {
        self.explorer
    }

    /// Address of the armed session
    pub fn ephemeral(&self) -> Option<Address> {
        self.keys.session().map(|s| s.ephemeral())
    }

    /// Reset the inactivity window
    pub fn touch(&mut self) {
        self.keys.touch();
    }

    /// Point at a node endpoint
    ///
    /// Only allowed before a session is armed.
    pub fn set_endpoint(&mut self, raw: &str) -> Result<SessionState> {
        self.require_unarmed("change endpoint")?;
        let endpoint = self.gate.set_endpoint(raw)?;
        let url = endpoint.url().to_string();
        let pending = endpoint.override_pending();

        self.client = Some((self.connector)(&url)?);
        self.explorer = None;
        self.touch();

        let target = if pending {
            SessionState::UntrustedPending
        } else {
            SessionState::Idle
        };
        if self.state != target {
            self.transition(target)?;
        }
        Ok(self.state)
    }

    /// Type the override phrase for an untrusted endpoint
    pub fn confirm_override(&mut self, phrase: &str) -> Result<bool> {
        self.touch();
        let trusted = self.gate.confirm_override(phrase)?;
        if trusted && self.state == SessionState::UntrustedPending {
            self.transition(SessionState::Idle)?;
        }
        Ok(trusted)
    }

    /// Set the vault address; drops any cached validation for a new address
    pub fn set_vault(&mut self, raw: &str) -> Result<Address> {
        self.require_unarmed("change vault")?;
        self.touch();
        self.gate.set_vault(raw)
    }

    /// Probe the vault's `asset()`
    pub async fn validate_vault(&mut self) -> Result<Address> {
        self.touch();
        let client = self.client()?;
        self.gate.probe_vault(client.as_ref()).await
    }

    /// Create the session from the ephemeral secret
    ///
    /// Returns the derived ephemeral address.
    pub fn arm(&mut self, secret: &SecretKey, destination: &str) -> Result<Address> {
        // an unconfirmed endpoint is reported as untrusted below
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::UntrustedPending
        ) {
            return Err(Error::StateConflict(format!(
                "cannot arm while {}",
                self.state
            )));
        }
        let endpoint = self.gate.require_unlocked()?.url().to_string();
        let vault = self
            .gate
            .vault()
            .ok_or_else(|| Error::InvalidFormat("no vault address configured".to_string()))?;
        let destination = parse_address(destination)?;

        let session = self.keys.arm(secret, destination, vault, &endpoint)?;
        let ephemeral = session.ephemeral();
        self.failures.reset();
        self.transition(SessionState::Armed)?;
        Ok(ephemeral)
    }

    /// Pre-flight checks, then begin monitoring
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Armed {
            return Err(Error::StateConflict(format!(
                "cannot start while {}",
                self.state
            )));
        }
        self.touch();
        self.gate.require_unlocked()?;

        if self.gate.probe_outcome().is_none() {
            self.validate_vault().await?;
        }
        self.gate.require_valid_vault()?;

        let client = self.client()?;
        let ephemeral = self
            .ephemeral()
            .ok_or_else(|| Error::StateConflict("no session armed".to_string()))?;
        let balance = client.read_native_balance(ephemeral).await?;
        if balance.is_zero() {
            return Err(Error::InsufficientGas(
                "ephemeral wallet holds no native gas token; fund it before starting".to_string(),
            ));
        }

        if self.explorer.is_none() {
            match client.chain_id().await {
                Ok(chain_id) => self.explorer = Explorer::for_chain(chain_id),
                Err(e) => warn!("Could not read chain id: {}", e.redacted()),
            }
        }

        self.begin_run()
    }

    /// Stop monitoring and keep the session armed
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            SessionState::Monitoring | SessionState::Halted => {
                self.scheduler.stop();
                self.failures.reset();
                self.touch();
                self.transition(SessionState::Armed)?;
                info!("Automation stopped");
                Ok(())
            }
            other => Err(Error::StateConflict(format!("cannot stop while {}", other))),
        }
    }

    /// Begin a fresh run with a new timer
    pub async fn restart(&mut self) -> Result<()> {
        match self.state {
            SessionState::Armed => self.start().await,
            SessionState::Monitoring | SessionState::Halted => {
                self.touch();
                self.begin_run()
            }
            other => Err(Error::StateConflict(format!(
                "cannot restart while {}",
                other
            ))),
        }
    }

    /// Stop and wipe, returning to idle
    pub fn switch_wallet(&mut self) -> Result<()> {
        self.touch();
        match self.state {
            SessionState::Idle | SessionState::UntrustedPending => Ok(()),
            SessionState::Armed
            | SessionState::Monitoring
            | SessionState::Halted
            | SessionState::Succeeded => {
                self.wipe_all();
                self.transition(SessionState::Idle)?;
                self.notify(Notice::Wiped);
                Ok(())
            }
            other => Err(Error::StateConflict(format!(
                "cannot switch wallet while {}",
                other
            ))),
        }
    }

    /// Wipe if the inactivity window has run out
    pub fn expire_if_idle(&mut self) -> bool {
        if !self.keys.expire_if_idle(self.state.is_running()) {
            return false;
        }
        self.wipe_all();
        if self.state != SessionState::Idle {
            self.force_state(SessionState::Idle);
        }
        self.notify(Notice::IdleExpired);
        true
    }

    /// Complete the post-success wipe once its deadline passed
    pub fn finish_rescue(&mut self) -> Result<bool> {
        match self.wipe_at {
            Some(at) if Instant::now() >= at => {
                self.wipe_all();
                self.transition(SessionState::Idle)?;
                self.notify(Notice::Wiped);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Stop everything and wipe
    pub fn teardown(&mut self) {
        self.wipe_all();
        if self.state != SessionState::Idle {
            self.force_state(SessionState::Idle);
        }
        debug!("Controller torn down");
    }

    pub fn status(&self) -> StatusReport {
        let session = self.keys.session();
        StatusReport {
            state: self.state,
            session: session.map(|s| s.id()),
            ephemeral: session.map(|s| s.ephemeral()),
            destination: session.map(|s| s.destination()),
            endpoint_trusted: self.gate.is_unlocked(),
            vault_valid: self
                .gate
                .probe_outcome()
                .map(|o| matches!(o, ProbeOutcome::Valid { .. })),
            failures: self.failures.count(),
            max_failures: self.failures.max(),
            last_capacity: self.scheduler.last_capacity(),
            accelerated: self.scheduler.is_accelerated(),
            guard_held: self.guard.is_held(),
            records: session.map(|s| s.records.clone()).unwrap_or_default(),
            stranded: session.and_then(|s| s.stranded),
        }
    }

    /// One scheduler tick
    ///
    /// The state is `Executing` for as long as the executor call is awaited.
    pub async fn tick(&mut self) -> Result<()> {
        if self.state == SessionState::Executing && !self.guard.is_held() {
            self.recover_interrupted()?;
        }
        if self.state != SessionState::Monitoring {
            return Err(Error::StateConflict(format!(
                "tick while {}",
                self.state
            )));
        }
        let client = self.client()?;
        let cached_asset = self.gate.cached_asset();

        let outcome = {
            let session = self
                .keys
                .session()
                .ok_or_else(|| Error::StateConflict("tick without a session".to_string()))?;
            self.scheduler
                .poll(TickContext {
                    client: client.as_ref(),
                    session,
                    failures: &mut self.failures,
                    guard: &self.guard,
                    cached_asset,
                })
                .await
        };

        let outcome = match outcome {
            TickOutcome::Ready(pending) => {
                self.transition(SessionState::Executing)?;
                let session = self
                    .keys
                    .session()
                    .ok_or_else(|| Error::StateConflict("tick without a session".to_string()))?;
                self.scheduler
                    .execute(
                        TickContext {
                            client: client.as_ref(),
                            session,
                            failures: &mut self.failures,
                            guard: &self.guard,
                            cached_asset,
                        },
                        pending,
                    )
                    .await
            }
            other => other,
        };

        self.apply(outcome)
    }

    /// Event loop; returns when the session ends or on shutdown
    pub async fn run(&mut self, commands: &mut mpsc::Receiver<Command>) -> RunOutcome {
        let mut commands_open = true;

        loop {
            let idle_deadline = self.keys.idle_deadline(self.state.is_running());
            let wipe_at = self.wipe_at;

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    self.teardown();
                    return RunOutcome::Shutdown;
                }
                fired = self.scheduler.next_tick() => {
                    if fired {
                        if let Err(e) = self.tick().await {
                            debug!("Tick ignored: {}", e.redacted());
                        }
                    }
                }
                _ = until(wipe_at) => {
                    match self.finish_rescue() {
                        Ok(true) => return RunOutcome::Rescued,
                        Ok(false) => {}
                        Err(e) => {
                            error!("Post-rescue wipe failed: {}", e.redacted());
                            self.teardown();
                            return RunOutcome::Rescued;
                        }
                    }
                }
                _ = until(idle_deadline) => {
                    if self.expire_if_idle() {
                        return RunOutcome::IdleExpired;
                    }
                }
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => {
                            if let Some(outcome) = self.handle(command).await {
                                return outcome;
                            }
                        }
                        None => commands_open = false,
                    }
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Option<RunOutcome> {
        self.touch();
        let result = match command {
            Command::Status => {
                self.notify(Notice::Status(self.status()));
                Ok(())
            }
            Command::Stop => self.stop(),
            Command::Restart => self.restart().await,
            Command::SwitchWallet => match self.switch_wallet() {
                Ok(()) => return Some(RunOutcome::Switched),
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            warn!("Command {:?} rejected: {}", command, e.redacted());
        }
        None
    }

    fn apply(&mut self, outcome: TickOutcome) -> Result<()> {
        match outcome {
            TickOutcome::Ready(pending) => {
                debug!(plan = ?pending.plan(), "Execution plan dropped unexecuted");
            }
            TickOutcome::Skipped => debug!("Tick skipped"),
            TickOutcome::Waiting { capacity } => debug!(capacity = %capacity, "No capacity yet"),
            TickOutcome::Exhausted => self.enter_halted()?,
            TickOutcome::QueryFailed { error, failures } => {
                self.transition(SessionState::Failed)?;
                self.notify(Notice::PollWarning {
                    class: error.class(),
                    message: error.redacted(),
                    failures,
                    max: self.failures.max(),
                });
                self.after_failure()?;
            }
            TickOutcome::Rescued(receipt) => {
                if let Some(session) = self.keys.session_mut() {
                    session.records.redeem = Some(receipt.redeem_hash);
                    session.records.transfer = Some(receipt.transfer_hash);
                    session.stranded = None;
                }
                self.succeed(receipt.amount, Some(receipt.redeem_hash), receipt.transfer_hash)?;
            }
            TickOutcome::Forwarded {
                asset: _,
                amount,
                hash,
            } => {
                let redeem = self.keys.session_mut().and_then(|session| {
                    session.records.transfer = Some(hash);
                    session.stranded = None;
                    session.records.redeem
                });
                self.succeed(amount, redeem, hash)?;
            }
            TickOutcome::ExecutionFailed {
                failure,
                amount,
                failures,
            } => {
                self.transition(SessionState::Failed)?;
                let stranded = failure.is_stranded();
                if let Some(session) = self.keys.session_mut() {
                    if let Some(hash) = failure.redeem_hash {
                        session.records.redeem = Some(hash);
                    }
                    if stranded {
                        session.stranded = Some(StrandedBalance {
                            asset: failure.asset,
                            amount,
                        });
                    }
                }
                self.notify(Notice::ExecutionFailed {
                    leg: failure.leg,
                    class: failure.error.class(),
                    message: failure.error.redacted(),
                    failures,
                    max: self.failures.max(),
                    stranded,
                });
                self.after_failure()?;
            }
        }
        Ok(())
    }

    /// An execution future was dropped before it settled
    ///
    /// Whatever it broadcast may still land, so the ephemeral wallet is
    /// checked for a balance from the next tick on.
    fn recover_interrupted(&mut self) -> Result<()> {
        warn!("Execution interrupted before it settled, re-checking the ephemeral wallet");
        let amount = self.scheduler.last_capacity().unwrap_or_default();
        if let Some(session) = self.keys.session_mut() {
            if session.stranded.is_none() {
                session.stranded = Some(StrandedBalance {
                    asset: None,
                    amount,
                });
            }
        }
        self.transition(SessionState::Failed)?;
        self.transition(SessionState::Monitoring)
    }

    fn after_failure(&mut self) -> Result<()> {
        if self.scheduler.is_halted() {
            self.enter_halted()
        } else {
            self.transition(SessionState::Monitoring)
        }
    }

    fn enter_halted(&mut self) -> Result<()> {
        self.scheduler.halt();
        self.transition(SessionState::Halted)?;
        error!(
            failures = self.failures.count(),
            "Automation halted after consecutive failures"
        );
        self.notify(Notice::Halted {
            failures: self.failures.count(),
        });
        Ok(())
    }

    fn succeed(&mut self, amount: U256, redeem: Option<TxHash>, transfer: TxHash) -> Result<()> {
        self.scheduler.stop();
        self.transition(SessionState::Succeeded)?;
        self.wipe_at = Some(Instant::now() + self.success_grace);
        info!(amount = %amount, "Rescue complete, wiping in {:?}", self.success_grace);

        let link = |hash: TxHash| match self.explorer {
            Some(explorer) => explorer.tx_url(&hash.to_string()),
            None => hash.to_string(),
        };
        self.notify(Notice::Rescued {
            amount,
            redeem: redeem.map(link),
            transfer: link(transfer),
        });
        Ok(())
    }

    fn begin_run(&mut self) -> Result<()> {
        if !self.keys.is_armed() {
            return Err(Error::StateConflict("no session armed".to_string()));
        }
        self.failures.reset();
        self.scheduler.start();
        self.transition(SessionState::Monitoring)?;
        if let Some(session) = self.keys.session() {
            info!(session = %session.id(), "Monitoring vault for redeemable capacity");
        }
        Ok(())
    }

    /// Clear the session and every per-session counter
    fn wipe_all(&mut self) {
        self.scheduler.stop();
        self.keys.wipe();
        self.failures.reset();
        self.guard = ProcessingGuard::new();
        self.wipe_at = None;
    }

    fn require_unarmed(&self, action: &str) -> Result<()> {
        match self.state {
            SessionState::Idle | SessionState::UntrustedPending => Ok(()),
            other => Err(Error::StateConflict(format!(
                "cannot {} while {}; switch wallet first",
                action, other
            ))),
        }
    }

    fn client(&self) -> Result<Arc<dyn ChainClient>> {
        self.client
            .clone()
            .ok_or_else(|| Error::InvalidFormat("no endpoint configured".to_string()))
    }

    fn transition(&mut self, to: SessionState) -> Result<()> {
        let from = self.state;
        self.state.transition(to)?;
        if from != to {
            debug!("State {} -> {}", from, to);
            self.notify(Notice::StateChanged { from, to });
        }
        Ok(())
    }

    /// Exit paths that are valid from any state
    fn force_state(&mut self, to: SessionState) {
        let from = self.state;
        self.state = to;
        self.notify(Notice::StateChanged { from, to });
    }

    fn notify(&self, notice: Notice) {
        // receiver gone means nobody is listening
        let _ = self.notices.send(notice);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::gate::OVERRIDE_PHRASE;
    use tokio_test::{assert_err, assert_ok};

    const ENDPOINT: &str = "https://api.avax.network/ext/bc/C/rpc";
    const VAULT: &str = "0xE1A62FDcC6666847d5EA752634E45e134B2F824B";
    const DESTINATION: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    struct Harness {
        chain: Arc<MockChain>,
        ctrl: SessionController,
        notices: mpsc::UnboundedReceiver<Notice>,
        commands: mpsc::Sender<Command>,
        command_rx: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            let chain = Arc::new(MockChain::new());
            let shared = Arc::clone(&chain);
            let connector: Connector =
                Box::new(move |_| Ok(Arc::clone(&shared) as Arc<dyn ChainClient>));
            let (tx, notices) = mpsc::unbounded_channel();
            let (commands, command_rx) = mpsc::channel(8);
            let shutdown = CancellationToken::new();
            let mut ctrl =
                SessionController::new(&Config::default(), connector, tx, shutdown.clone());
            ctrl.set_endpoint(ENDPOINT).unwrap();
            ctrl.set_vault(VAULT).unwrap();
            Self {
                chain,
                ctrl,
                notices,
                commands,
                command_rx,
                shutdown,
            }
        }

        fn arm(&mut self) -> Address {
            let secret = SecretKey::parse(&"42".repeat(32)).unwrap();
            self.ctrl.arm(&secret, DESTINATION).unwrap()
        }

        async fn armed_and_started() -> Self {
            let mut h = Self::new();
            h.arm();
            assert_ok!(h.ctrl.start().await);
            h
        }

        async fn run(&mut self) -> RunOutcome {
            self.ctrl.run(&mut self.command_rx).await
        }

        fn drain(&mut self) -> Vec<Notice> {
            let mut out = Vec::new();
            while let Ok(notice) = self.notices.try_recv() {
                out.push(notice);
            }
            out
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_capacity_keeps_monitoring() {
        let mut h = Harness::armed_and_started().await;

        let waited = tokio::time::timeout(Duration::from_secs(180), h.run()).await;
        assert!(waited.is_err());

        assert_eq!(h.ctrl.state(), SessionState::Monitoring);
        assert!(MockChain::calls(&h.chain.capacity_calls) >= 89);
        assert_eq!(MockChain::calls(&h.chain.redeem_calls), 0);
        assert_eq!(h.ctrl.status().failures, 0);
        assert!(!h.ctrl.status().accelerated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_rescues_then_wipes_after_grace() {
        let mut h = Harness::armed_and_started().await;
        h.chain.push_capacity(1000);

        let started = Instant::now();
        assert_eq!(h.run().await, RunOutcome::Rescued);
        // first tick at 2s, wipe 3s later
        assert_eq!(started.elapsed(), Duration::from_secs(5));

        assert_eq!(*h.chain.redeemed.lock().unwrap(), vec![U256::from(1000u64)]);
        assert_eq!(MockChain::calls(&h.chain.transfer_calls), 1);
        assert_eq!(h.ctrl.state(), SessionState::Idle);
        assert!(h.ctrl.ephemeral().is_none());
        let status = h.ctrl.status();
        assert!(status.records.redeem.is_none() && status.records.transfer.is_none());
        assert_eq!(status.failures, 0);

        let notices = h.drain();
        let rescued = notices.iter().find_map(|n| match n {
            Notice::Rescued {
                redeem, transfer, ..
            } => Some((redeem.clone(), transfer.clone())),
            _ => None,
        });
        let (redeem, transfer) = rescued.expect("rescue notice");
        assert!(redeem.unwrap().starts_with("https://snowtrace.io/tx/0x"));
        assert!(transfer.starts_with("https://snowtrace.io/tx/0x"));
        assert!(notices.iter().any(|n| matches!(n, Notice::Wiped)));
        assert!(notices.iter().any(|n| matches!(
            n,
            Notice::StateChanged {
                to: SessionState::Succeeded,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeded_state_holds_hashes_until_grace() {
        let mut h = Harness::armed_and_started().await;
        h.chain.push_capacity(1000);

        assert_ok!(h.ctrl.tick().await);
        assert_eq!(h.ctrl.state(), SessionState::Succeeded);
        assert!(h.ctrl.status().records.is_complete());
        assert!(!h.ctrl.finish_rescue().unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(h.ctrl.finish_rescue().unwrap());
        assert_eq!(h.ctrl.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_revert_strands_then_forwards() {
        let mut h = Harness::armed_and_started().await;
        h.chain.push_capacity(1000);
        h.chain.fail_next_transfer("execution reverted");

        assert_ok!(h.ctrl.tick().await);
        assert_eq!(h.ctrl.state(), SessionState::Monitoring);
        let status = h.ctrl.status();
        assert_eq!(status.failures, 1);
        assert!(status.records.redeem.is_some());
        assert!(status.records.transfer.is_none());
        assert_eq!(
            status.stranded,
            Some(StrandedBalance {
                asset: Some(MockChain::asset_address()),
                amount: U256::from(1000u64),
            })
        );
        assert!(h.drain().iter().any(|n| matches!(
            n,
            Notice::ExecutionFailed {
                leg: Leg::Transfer,
                stranded: true,
                failures: 1,
                ..
            }
        )));

        // next tick forwards the stranded balance without a second redeem
        assert_ok!(h.ctrl.tick().await);
        assert_eq!(h.ctrl.state(), SessionState::Succeeded);
        assert_eq!(MockChain::calls(&h.chain.redeem_calls), 1);
        assert_eq!(MockChain::calls(&h.chain.transfer_calls), 2);
        assert_eq!(MockChain::calls(&h.chain.capacity_calls), 1);
        let status = h.ctrl.status();
        assert!(status.records.is_complete());
        assert!(status.stranded.is_none());
        assert_eq!(status.failures, 0);
    }

    #[tokio::test]
    async fn test_untrusted_endpoint_blocks_arming() {
        let mut h = Harness::new();
        assert_eq!(
            h.ctrl.set_endpoint("https://example-untrusted.test").unwrap(),
            SessionState::UntrustedPending
        );
        assert!(!h.ctrl.confirm_override("i understand").unwrap());
        assert_eq!(h.ctrl.state(), SessionState::UntrustedPending);

        let secret = SecretKey::parse(&"42".repeat(32)).unwrap();
        assert!(matches!(
            h.ctrl.arm(&secret, DESTINATION),
            Err(Error::UntrustedEndpoint(_))
        ));
        assert!(h.ctrl.ephemeral().is_none());

        assert!(h.ctrl.confirm_override(OVERRIDE_PHRASE).unwrap());
        assert_eq!(h.ctrl.state(), SessionState::Idle);
        assert_ok!(h.ctrl.arm(&secret, DESTINATION));
        assert_eq!(h.ctrl.state(), SessionState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_query_errors_halt_without_sixth_query() {
        let mut h = Harness::armed_and_started().await;
        for _ in 0..6 {
            h.chain.push_capacity_error("error sending request: connection refused");
        }

        let waited = tokio::time::timeout(Duration::from_secs(60), h.run()).await;
        assert!(waited.is_err());

        assert_eq!(h.ctrl.state(), SessionState::Halted);
        assert_eq!(MockChain::calls(&h.chain.capacity_calls), 5);
        let notices = h.drain();
        assert!(notices
            .iter()
            .any(|n| matches!(n, Notice::Halted { failures: 5 })));
        let warnings = notices
            .iter()
            .filter(|n| {
                matches!(
                    n,
                    Notice::PollWarning {
                        class: ErrorClass::Network,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(warnings, 5);

        // restart gives a fresh run
        assert_ok!(h.ctrl.restart().await);
        assert_eq!(h.ctrl.state(), SessionState::Monitoring);
        assert_eq!(h.ctrl.status().failures, 0);
        assert_ok!(h.ctrl.tick().await);
        assert_eq!(MockChain::calls(&h.chain.capacity_calls), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_success_resets_counter() {
        let mut h = Harness::armed_and_started().await;
        h.chain.push_capacity_error("timeout");
        h.chain.push_capacity_error("timeout");
        h.chain.push_capacity(0);

        assert_ok!(h.ctrl.tick().await);
        assert_ok!(h.ctrl.tick().await);
        assert_eq!(h.ctrl.status().failures, 2);
        assert_ok!(h.ctrl.tick().await);
        assert_eq!(h.ctrl.status().failures, 0);
        assert_eq!(h.ctrl.state(), SessionState::Monitoring);
    }

    #[tokio::test]
    async fn test_start_requires_gas() {
        let mut h = Harness::new();
        h.chain.set_native_balance(0);
        h.arm();
        let err = h.ctrl.start().await.unwrap_err();
        assert!(matches!(err, Error::InsufficientGas(_)));
        assert!(err.is_entry_blocking());
        assert_eq!(h.ctrl.state(), SessionState::Armed);
    }

    #[tokio::test]
    async fn test_start_requires_valid_vault() {
        let mut h = Harness::new();
        h.chain.set_asset(None);
        h.arm();
        assert!(matches!(
            h.ctrl.start().await,
            Err(Error::VaultValidation(_))
        ));
        assert_eq!(h.ctrl.state(), SessionState::Armed);
        assert_eq!(h.ctrl.status().vault_valid, Some(false));
    }

    #[tokio::test]
    async fn test_endpoint_and_vault_locked_while_armed() {
        let mut h = Harness::new();
        h.arm();
        assert!(matches!(
            h.ctrl.set_endpoint("https://eth.llamarpc.com"),
            Err(Error::StateConflict(_))
        ));
        assert!(matches!(
            h.ctrl.set_vault(DESTINATION),
            Err(Error::StateConflict(_))
        ));
        let secret = SecretKey::parse(&"43".repeat(32)).unwrap();
        assert_err!(h.ctrl.arm(&secret, DESTINATION));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_wipes_armed_session() {
        let mut h = Harness::new();
        h.arm();

        let started = Instant::now();
        assert_eq!(h.run().await, RunOutcome::IdleExpired);
        assert_eq!(started.elapsed(), Duration::from_secs(600));
        assert_eq!(h.ctrl.state(), SessionState::Idle);
        assert!(h.ctrl.ephemeral().is_none());
        assert!(h.drain().iter().any(|n| matches!(n, Notice::IdleExpired)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_suppressed_while_running() {
        let mut h = Harness::armed_and_started().await;
        let waited = tokio::time::timeout(Duration::from_secs(1200), h.run()).await;
        assert!(waited.is_err());
        assert_eq!(h.ctrl.state(), SessionState::Monitoring);
        assert!(h.ctrl.ephemeral().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_command_rearms_idle_timer() {
        let mut h = Harness::armed_and_started().await;
        h.commands.send(Command::Stop).await.unwrap();

        assert_eq!(h.run().await, RunOutcome::IdleExpired);
        assert_eq!(MockChain::calls(&h.chain.capacity_calls), 0);
        let notices = h.drain();
        assert!(notices.iter().any(|n| matches!(
            n,
            Notice::StateChanged {
                from: SessionState::Monitoring,
                to: SessionState::Armed
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_wallet_command() {
        let mut h = Harness::armed_and_started().await;
        h.commands.send(Command::Status).await.unwrap();
        h.commands.send(Command::SwitchWallet).await.unwrap();

        assert_eq!(h.run().await, RunOutcome::Switched);
        assert_eq!(h.ctrl.state(), SessionState::Idle);
        assert!(h.ctrl.ephemeral().is_none());
        // trust and vault validation survive a wallet switch
        assert!(h.ctrl.gatekeeper().is_unlocked());
        assert!(h.ctrl.gatekeeper().cached_asset().is_some());

        let notices = h.drain();
        assert!(notices.iter().any(|n| matches!(n, Notice::Status(_))));
        assert!(notices.iter().any(|n| matches!(n, Notice::Wiped)));
        h.arm();
        assert_eq!(h.ctrl.state(), SessionState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_tears_down() {
        let mut h = Harness::armed_and_started().await;
        h.shutdown.cancel();
        assert_eq!(h.run().await, RunOutcome::Shutdown);
        assert_eq!(h.ctrl.state(), SessionState::Idle);
        assert!(h.ctrl.ephemeral().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_tick_releases_guard() {
        let mut h = Harness::armed_and_started().await;
        h.chain.push_capacity(1000);
        h.chain.delay_submissions(Duration::from_secs(30));

        let dropped = tokio::time::timeout(Duration::from_secs(1), h.ctrl.tick()).await;
        assert!(dropped.is_err());
        assert!(!h.ctrl.status().guard_held);
        assert_eq!(h.ctrl.state(), SessionState::Executing);

        // next tick recovers and keeps an eye on the ephemeral wallet
        assert_ok!(h.ctrl.tick().await);
        assert_eq!(h.ctrl.state(), SessionState::Monitoring);
        assert_eq!(
            h.ctrl.status().stranded,
            Some(StrandedBalance {
                asset: None,
                amount: U256::from(1000u64),
            })
        );
        assert_eq!(MockChain::calls(&h.chain.token_balance_calls), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executing_reported_while_executor_pending() {
        let mut h = Harness::armed_and_started().await;
        h.drain();
        h.chain.push_capacity(1000);
        h.chain.delay_submissions(Duration::from_secs(30));

        {
            let tick = h.ctrl.tick();
            tokio::pin!(tick);
            assert!(tokio::time::timeout(Duration::from_secs(5), &mut tick)
                .await
                .is_err());

            let mut in_flight = Vec::new();
            while let Ok(notice) = h.notices.try_recv() {
                in_flight.push(notice);
            }
            assert!(in_flight.iter().any(|n| matches!(
                n,
                Notice::StateChanged {
                    from: SessionState::Monitoring,
                    to: SessionState::Executing
                }
            )));
            assert!(!in_flight
                .iter()
                .any(|n| matches!(n, Notice::Rescued { .. })));

            assert_ok!(tick.await);
        }
        assert_eq!(h.ctrl.state(), SessionState::Succeeded);
        assert!(h.drain().iter().any(|n| matches!(
            n,
            Notice::StateChanged {
                from: SessionState::Executing,
                to: SessionState::Succeeded
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_redeem_forwarded_once_landed() {
        let mut h = Harness::armed_and_started().await;
        h.chain.push_capacity(1000);
        h.chain.land_next_redeem_unconfirmed();

        assert_ok!(h.ctrl.tick().await);
        assert_eq!(h.ctrl.state(), SessionState::Monitoring);
        let status = h.ctrl.status();
        assert_eq!(status.failures, 1);
        assert!(status.records.redeem.is_some());
        assert_eq!(
            status.stranded,
            Some(StrandedBalance {
                asset: None,
                amount: U256::from(1000u64),
            })
        );
        assert!(h.drain().iter().any(|n| matches!(
            n,
            Notice::ExecutionFailed {
                leg: Leg::Redeem,
                class: ErrorClass::Unconfirmed,
                stranded: true,
                ..
            }
        )));

        // vault capacity is gone now; the wallet balance is what gets forwarded
        assert_ok!(h.ctrl.tick().await);
        assert_eq!(h.ctrl.state(), SessionState::Succeeded);
        assert_eq!(MockChain::calls(&h.chain.redeem_calls), 1);
        assert_eq!(MockChain::calls(&h.chain.capacity_calls), 1);
        let transfers = h.chain.transferred.lock().unwrap().clone();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].0, MockChain::asset_address());
        assert_eq!(transfers[0].2, U256::from(1000u64));
        assert!(h.ctrl.status().stranded.is_none());
    }

    #[tokio::test]
    async fn test_unlisted_transitions_rejected() {
        let mut h = Harness::new();
        assert!(matches!(h.ctrl.stop(), Err(Error::StateConflict(_))));
        assert!(matches!(
            h.ctrl.start().await,
            Err(Error::StateConflict(_))
        ));
        assert!(matches!(h.ctrl.tick().await, Err(Error::StateConflict(_))));
        assert_ok!(h.ctrl.switch_wallet());
        assert_eq!(h.ctrl.state(), SessionState::Idle);
    }

    #[test]
    fn test_status_display_masks_addresses() {
        let report = StatusReport {
            state: SessionState::Armed,
            session: None,
            ephemeral: Some(Address::repeat_byte(0xab)),
            destination: None,
            endpoint_trusted: true,
            vault_valid: Some(true),
            failures: 2,
            max_failures: 5,
            last_capacity: Some(U256::from(7u64)),
            accelerated: true,
            guard_held: false,
            records: TransactionRecord::default(),
            stranded: None,
        };
        let shown = report.to_string();
        assert!(!shown.to_ascii_lowercase().contains(&"ab".repeat(20)));
        assert!(shown.contains("failures:    2/5"));
        assert!(shown.contains("(fast polling)"));
    }
}
