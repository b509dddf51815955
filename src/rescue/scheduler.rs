//! Polling scheduler
//!
//! Drives the liquidity checks. The timer runs at the base cadence and
//! switches once, for the rest of the run, to the accelerated cadence after
//! nonzero capacity has been seen. Missed ticks are skipped.
//!
//! A tick is two steps: [`PollingScheduler::poll`] reads the chain and, when
//! there is something to move, takes the processing guard and returns a
//! [`PendingExecution`]; [`PollingScheduler::execute`] runs it.

use std::time::Duration;

use alloy_primitives::{Address, U256};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, TxHash};
use crate::config::PollingConfig;
use crate::error::Error;
use crate::session::{Session, StrandedBalance};

use super::executor::{LegFailure, Receipt, TransactionExecutor};
use super::state::{FailureCounter, GuardToken, ProcessingGuard};

/// Borrowed state a tick works on
pub struct TickContext<'a> {
    pub client: &'a dyn ChainClient,
    pub session: &'a Session,
    pub failures: &'a mut FailureCounter,
    pub guard: &'a ProcessingGuard,
    /// Gatekeeper's validated asset for the session's vault, if still cached
    pub cached_asset: Option<Address>,
}

/// Executor work a poll decided on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Redeem `amount` shares and forward them
    Rescue { amount: U256 },
    /// Forward a balance already in the ephemeral wallet
    Forward { asset: Address, amount: U256 },
}

/// A plan together with the processing guard it runs under
#[derive(Debug)]
pub struct PendingExecution {
    token: GuardToken,
    plan: Plan,
}

impl PendingExecution {
    pub fn plan(&self) -> Plan {
        self.plan
    }
}

/// What a tick did
#[derive(Debug)]
pub enum TickOutcome {
    /// Something to move; the guard is held until this is executed or dropped
    Ready(PendingExecution),
    /// Guard was held, nothing done
    Skipped,
    /// Failure limit was already reached; the scheduler is now halted
    Exhausted,
    /// Capacity read succeeded with nothing to redeem
    Waiting { capacity: U256 },
    /// A read failed
    QueryFailed { error: Error, failures: u32 },
    /// Full two-leg rescue landed
    Rescued(Receipt),
    /// A stranded balance was forwarded
    Forwarded { asset: Address, amount: U256, hash: TxHash },
    /// An execution failed
    ExecutionFailed { failure: LegFailure, amount: U256, failures: u32 },
}

pub struct PollingScheduler {
    base: Duration,
    accelerated: Duration,
    interval: Option<Interval>,
    cancel: Option<CancellationToken>,
    parent: CancellationToken,
    fast: bool,
    halted: bool,
    last_capacity: Option<U256>,
}

impl PollingScheduler {
    /// Timers are children of `parent`, so cancelling it stops any run
    pub fn new(config: &PollingConfig, parent: CancellationToken) -> Self {
        Self {
            base: config.base_interval(),
            accelerated: config.accelerated_interval(),
            interval: None,
            cancel: None,
            parent,
            fast: false,
            halted: false,
            last_capacity: None,
        }
    }

    /// Begin a fresh run with a new timer and token
    pub fn start(&mut self) {
        self.stop();
        self.fast = false;
        self.halted = false;
        self.last_capacity = None;
        self.cancel = Some(self.parent.child_token());
        self.interval = Some(Self::timer(self.base));
        debug!("Polling every {:?}", self.base);
    }

    /// Cancel the pending timer
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.interval = None;
    }

    /// Stop and mark the run halted
    pub fn halt(&mut self) {
        self.stop();
        self.halted = true;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_accelerated(&self) -> bool {
        self.fast
    }

    pub fn period(&self) -> Duration {
        if self.fast {
            self.accelerated
        } else {
            self.base
        }
    }

    pub fn last_capacity(&self) -> Option<U256> {
        self.last_capacity
    }

    /// Wait for the next tick
    ///
    /// Returns `false` if the run was cancelled while waiting. Pends forever
    /// while stopped.
    pub async fn next_tick(&mut self) -> bool {
        match (self.interval.as_mut(), self.cancel.as_ref()) {
            (Some(interval), Some(cancel)) => {
                tokio::select! {
                    _ = interval.tick() => true,
                    _ = cancel.cancelled() => false,
                }
            }
            _ => std::future::pending().await,
        }
    }

    /// Record the latest capacity and switch cadence on the first nonzero one
    pub fn observe_capacity(&mut self, capacity: U256) {
        self.last_capacity = Some(capacity);
        if capacity > U256::ZERO && !self.fast && self.interval.is_some() {
            self.fast = true;
            self.interval = Some(Self::timer(self.accelerated));
            info!("Liquidity detected, polling every {:?}", self.accelerated);
        }
    }

    /// One poll: stranded balance first, then vault capacity
    pub async fn poll(&mut self, ctx: TickContext<'_>) -> TickOutcome {
        if ctx.guard.is_held() {
            debug!("Execution in flight, skipping tick");
            return TickOutcome::Skipped;
        }
        if ctx.failures.is_exhausted() {
            self.halt();
            return TickOutcome::Exhausted;
        }

        if let Some(stranded) = ctx.session.stranded {
            let found = Self::poll_stranded(&ctx, stranded).await;
            match found {
                Ok(Some(plan)) => return Self::ready(ctx.guard, plan),
                Ok(None) => {}
                Err(error) => return self.query_failed(ctx.failures, error),
            }
        }

        let capacity = match ctx
            .client
            .read_capacity(ctx.session.vault(), ctx.session.ephemeral())
            .await
        {
            Ok(capacity) => capacity,
            Err(error) => return self.query_failed(ctx.failures, error),
        };
        ctx.failures.reset();
        self.observe_capacity(capacity);

        if capacity.is_zero() {
            return TickOutcome::Waiting { capacity };
        }
        Self::ready(ctx.guard, Plan::Rescue { amount: capacity })
    }

    /// Run a plan returned by [`poll`](Self::poll) and apply the failure policy
    pub async fn execute(&mut self, ctx: TickContext<'_>, pending: PendingExecution) -> TickOutcome {
        let PendingExecution { token, plan } = pending;
        let executor = TransactionExecutor::new(ctx.client);

        let outcome = match plan {
            Plan::Rescue { amount } => {
                info!(session = %ctx.session.id(), capacity = %amount, "Capacity available, executing rescue");
                match executor.execute(&token, ctx.session, amount, ctx.cached_asset).await {
                    Ok(receipt) => TickOutcome::Rescued(receipt),
                    Err(failure) => TickOutcome::ExecutionFailed {
                        failure,
                        amount,
                        failures: 0,
                    },
                }
            }
            Plan::Forward { asset, amount } => {
                info!(session = %ctx.session.id(), amount = %amount, "Forwarding stranded balance");
                match executor.forward(&token, ctx.session, asset, amount).await {
                    Ok(hash) => TickOutcome::Forwarded {
                        asset,
                        amount,
                        hash,
                    },
                    Err(failure) => TickOutcome::ExecutionFailed {
                        failure,
                        amount,
                        failures: 0,
                    },
                }
            }
        };
        drop(token);

        self.settle(ctx.failures, outcome)
    }

    /// Balance still sitting in the ephemeral wallet, if any
    async fn poll_stranded(
        ctx: &TickContext<'_>,
        stranded: StrandedBalance,
    ) -> Result<Option<Plan>, Error> {
        let asset = match stranded.asset {
            Some(asset) => asset,
            None => match ctx.cached_asset {
                Some(asset) => asset,
                None => ctx.client.read_asset_address(ctx.session.vault()).await?,
            },
        };
        if asset == Address::ZERO {
            return Err(Error::Query(
                "vault reported the zero address as its asset".to_string(),
            ));
        }

        let balance = ctx
            .client
            .read_token_balance(asset, ctx.session.ephemeral())
            .await?;
        if balance.is_zero() {
            return Ok(None);
        }
        Ok(Some(Plan::Forward {
            asset,
            amount: balance,
        }))
    }

    fn ready(guard: &ProcessingGuard, plan: Plan) -> TickOutcome {
        match guard.try_acquire() {
            Some(token) => TickOutcome::Ready(PendingExecution { token, plan }),
            None => TickOutcome::Skipped,
        }
    }

    /// Apply the failure policy to an execution outcome
    fn settle(&mut self, failures: &mut FailureCounter, outcome: TickOutcome) -> TickOutcome {
        match outcome {
            TickOutcome::Rescued(_) | TickOutcome::Forwarded { .. } => {
                failures.reset();
                outcome
            }
            TickOutcome::ExecutionFailed { failure, amount, .. } => {
                let count = failures.record_failure();
                warn!(
                    failures = count,
                    max = failures.max(),
                    "Execution failed: {}",
                    failure
                );
                if failures.is_exhausted() {
                    self.halt();
                }
                TickOutcome::ExecutionFailed {
                    failure,
                    amount,
                    failures: count,
                }
            }
            other => other,
        }
    }

    fn query_failed(&mut self, failures: &mut FailureCounter, error: Error) -> TickOutcome {
        let count = failures.record_failure();
        warn!(
            failures = count,
            max = failures.max(),
            "Poll failed: {}",
            error.redacted()
        );
        if failures.is_exhausted() {
            self.halt();
        }
        TickOutcome::QueryFailed {
            error,
            failures: count,
        }
    }

    fn timer(period: Duration) -> Interval {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
