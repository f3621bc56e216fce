//! The outer loop: scan, snipe, cool down, repeat.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::scheduler::{Clock, WallClock};
use super::session::{FailReason, SessionContext, SessionState, SniperSession};
use crate::config::{Config, SniperConfig};
use crate::error::BotError;
use crate::market::{CandidateFilter, GammaScanner, Market, MarketScanner, SidePick};
use crate::orderbook::ClobFeed;
use crate::signing::Credentials;
use crate::trading::{ClobSubmitter, OrderExecutor};
use crate::utils::StopSignal;

/// Outer-loop tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// Only consider markets resolving within this window.
    pub scan_horizon: Duration,
    /// Sleep between empty scans.
    pub poll_interval: Duration,
    /// Pause after each session.
    pub cooldown: Duration,
    /// A session may run this long past its market's deadline.
    pub session_grace: Duration,
    /// Delay before the first scan in live mode.
    pub live_start_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            scan_horizon: Duration::from_secs(20 * 60),
            poll_interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
            session_grace: Duration::from_secs(30),
            live_start_delay: Duration::from_secs(5),
        }
    }
}

/// Running totals, published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    /// Scanning has started.
    pub running: bool,
    /// Sessions run to a terminal state (or timed out).
    pub sessions: u64,
    /// Sessions that settled.
    pub settled: u64,
    /// Sessions that aborted.
    pub aborted: u64,
    /// Sessions that failed or timed out.
    pub failed: u64,
    /// Market of the active session.
    pub current_market: Option<String>,
    /// Terminal state of the last session.
    pub last_outcome: Option<String>,
}

/// Serializes sessions over discovered markets until stopped.
pub struct SniperSupervisor {
    scanner: Arc<dyn MarketScanner>,
    ctx: SessionContext,
    config: SniperConfig,
    settings: SupervisorSettings,
    attempted: HashSet<String>,
    stats: watch::Sender<SupervisorStats>,
    session_state: watch::Sender<SessionState>,
}

impl SniperSupervisor {
    /// Create a supervisor over explicit collaborators.
    pub fn new(
        scanner: Arc<dyn MarketScanner>,
        ctx: SessionContext,
        config: SniperConfig,
        settings: SupervisorSettings,
    ) -> Self {
        let (stats, _) = watch::channel(SupervisorStats::default());
        let (session_state, _) = watch::channel(SessionState::Init);
        Self {
            scanner,
            ctx,
            config,
            settings,
            attempted: HashSet::new(),
            stats,
            session_state,
        }
    }

    /// Wire the live Gamma scanner, CLOB feed, and CLOB submitter from configuration.
    ///
    /// Takes the credentials out of `config`.
    pub fn from_config(config: &mut Config) -> Result<Self, BotError> {
        let http = http_client(config)?;
        let ctx = live_context(config, http.clone())?;
        let scanner = GammaScanner::new(http, config.polymarket_gamma_url.clone(), config.scan_queries(), side_pick(config)?);

        Ok(Self::new(Arc::new(scanner), ctx, config.sniper(), config.supervisor()))
    }

    /// Receiver for the running totals.
    pub fn watch_stats(&self) -> watch::Receiver<SupervisorStats> {
        self.stats.subscribe()
    }

    /// Receiver for the active session's state.
    pub fn watch_session(&self) -> watch::Receiver<SessionState> {
        self.session_state.subscribe()
    }

    /// Markets attempted so far.
    pub fn attempted(&self) -> &HashSet<String> {
        &self.attempted
    }

    /// Scan and snipe until `stop` fires. Only a signing failure ends the loop early.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut stop: StopSignal) -> Result<SupervisorStats, BotError> {
        if !self.config.dry_run && !self.settings.live_start_delay.is_zero() {
            warn!(
                delay_secs = self.settings.live_start_delay.as_secs(),
                "LIVE TRADING: real orders will be placed. Press Ctrl+C to abort"
            );
            if pause(&mut stop, self.settings.live_start_delay).await {
                return Ok(self.stats.borrow().clone());
            }
        }

        self.stats.send_modify(|s| s.running = true);
        info!(
            mode = if self.config.dry_run { "DRY RUN" } else { "LIVE" },
            horizon_secs = self.settings.scan_horizon.as_secs(),
            "Supervisor started"
        );

        loop {
            if stop.is_stopped() {
                break;
            }

            let now = self.ctx.clock.now();
            let filter = CandidateFilter {
                now,
                horizon: self.settings.scan_horizon,
                exclude: self.attempted.clone(),
            };

            let candidate = match self.scanner.next_candidate(&filter).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(error = %e, "Market scan failed");
                    None
                }
            };

            let Some(market) = candidate else {
                debug!(poll_secs = self.settings.poll_interval.as_secs(), "No candidate market");
                if pause(&mut stop, self.settings.poll_interval).await {
                    break;
                }
                continue;
            };

            let monitor_from = market.deadline - self.config.monitor_window;
            if now < monitor_from {
                let until_window = Duration::try_from(monitor_from - now).unwrap_or_default();
                let wait = until_window.min(self.settings.poll_interval);
                info!(
                    market = %market.label(),
                    opens_in_secs = until_window.as_secs(),
                    "Waiting for monitor window"
                );
                if pause(&mut stop, wait).await {
                    break;
                }
                continue;
            }

            let record_state = self.snipe(market, &stop).await;
            if let Some(SessionState::Failed(FailReason::Signature)) = record_state {
                error!("Signing failed, stopping supervisor");
                self.stats.send_modify(|s| s.running = false);
                return Err(BotError::Signature("order signing or API credentials rejected".to_string()));
            }

            if pause(&mut stop, self.settings.cooldown).await {
                break;
            }
        }

        info!("Supervisor stopped");
        self.stats.send_modify(|s| {
            s.running = false;
            s.current_market = None;
        });
        Ok(self.stats.borrow().clone())
    }

    /// Run one session, bounded by the market deadline plus grace.
    async fn snipe(&mut self, market: Market, stop: &StopSignal) -> Option<SessionState> {
        self.attempted.insert(market.id.clone());
        let label = market.label().to_string();
        info!(
            market = %label,
            deadline = %market.deadline,
            remaining = %market.time_remaining_str(self.ctx.clock.now()),
            "Starting session"
        );
        self.stats.send_modify(|s| s.current_market = Some(label.clone()));

        let bound = market.deadline + self.settings.session_grace - self.ctx.clock.now();
        let bound = Duration::try_from(bound).unwrap_or_default();
        let session = SniperSession::new(market, self.config.clone(), self.ctx.clone())
            .with_observer(self.session_state.clone());

        let state = match tokio::time::timeout(bound, session.run(stop.clone())).await {
            Ok(record) => Some(record.state),
            Err(_) => {
                error!(market = %label, "Session exceeded its deadline grace, abandoning");
                None
            }
        };

        self.stats.send_modify(|s| {
            s.sessions += 1;
            s.current_market = None;
            match &state {
                Some(SessionState::Settled) => s.settled += 1,
                Some(SessionState::Aborted(_)) => s.aborted += 1,
                _ => s.failed += 1,
            }
            s.last_outcome = Some(match &state {
                Some(state) => state.to_string(),
                None => "TIMED_OUT".to_string(),
            });
        });
        state
    }
}

/// Sleep for `duration`; `true` if stopped first.
async fn pause(stop: &mut StopSignal, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stop.wait() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Shared HTTP client for the scanner and the submitter.
pub fn http_client(config: &Config) -> Result<reqwest::Client, BotError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_millis(config.http_timeout_ms))
        .pool_max_idle_per_host(4)
        .tcp_nodelay(true)
        .build()?)
}

/// The configured side selection.
pub fn side_pick(config: &Config) -> Result<SidePick, BotError> {
    config
        .side
        .parse()
        .map_err(|_| BotError::InvalidConfig(format!("unknown SIDE '{}'", config.side)))
}

/// Session collaborators backed by the live CLOB feed and submitter.
///
/// Takes the credentials out of `config`.
pub fn live_context(config: &mut Config, http: reqwest::Client) -> Result<SessionContext, BotError> {
    let credentials = Arc::new(Credentials::take_from(config)?);
    let submitter = ClobSubmitter::new(http, config.polymarket_clob_url.clone(), credentials)
        .map_err(|e| BotError::Signature(e.to_string()))?;
    info!(address = %submitter.address(), "Wallet loaded");

    let clock: Arc<dyn Clock> = Arc::new(WallClock::system());
    Ok(SessionContext {
        feed: Arc::new(ClobFeed::new(config.feed())),
        executor: Arc::new(OrderExecutor::new(Arc::new(submitter), clock.clone(), config.retry())),
        clock,
        timing: config.timing(),
    })
}

/// Build the live supervisor from `config` and run it until `stop` fires.
pub async fn start_supervisor(mut config: Config, stop: StopSignal) -> Result<SupervisorStats, BotError> {
    SniperSupervisor::from_config(&mut config)?.run(stop).await
}
