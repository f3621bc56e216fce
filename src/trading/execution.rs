//! Order submission, retry, and dry-run simulation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};

use super::order::{OrderRequest, Side};
use crate::error::{OrderError, RejectReason};
use crate::metrics;
use crate::orderbook::OrderBookSnapshot;
use crate::signing::{self, Credentials};
use crate::sniper::scheduler::Clock;

/// Whether orders reach the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Submit to the CLOB.
    Live,
    /// Synthesize the result locally.
    DryRun,
}

impl ExecutionMode {
    /// Map the `dry_run` flag.
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            ExecutionMode::DryRun
        } else {
            ExecutionMode::Live
        }
    }
}

/// Final status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Fully filled.
    Filled,
    /// Dry-run fill.
    Simulated,
    /// Definitively refused by the exchange.
    Rejected,
    /// Not executed.
    Failed,
}

/// Why an execution did not fill.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// Exchange refused the order.
    #[error("rejected: {0}")]
    Rejected(RejectReason),
    /// Not enough time left for another round trip.
    #[error("missed window")]
    MissedWindow,
    /// Every attempt hit a transient error.
    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),
    /// Signing or credential failure.
    #[error("signature: {0}")]
    Signature(String),
}

/// Outcome of [`OrderExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Final status.
    pub status: ExecutionStatus,
    /// Average fill price.
    pub filled_price: Option<Decimal>,
    /// Shares filled.
    pub filled_size: Option<Decimal>,
    /// Exchange order id, when known.
    pub order_id: Option<String>,
    /// Time from first attempt to result.
    pub latency: Duration,
    /// Submission attempts made.
    pub attempts: u32,
    /// Failure detail.
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    fn failed(error: ExecutionError, attempts: u32, latency: Duration) -> Self {
        let status = match error {
            ExecutionError::Rejected(_) => ExecutionStatus::Rejected,
            _ => ExecutionStatus::Failed,
        };
        Self {
            status,
            filled_price: None,
            filled_size: None,
            order_id: None,
            latency,
            attempts,
            error: Some(error),
        }
    }

    /// Whether the session should settle.
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Filled | ExecutionStatus::Simulated)
    }
}

/// Submission retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Minimum time before the deadline to start an attempt.
    pub min_round_trip: Duration,
    /// Delay after the first transient failure.
    pub backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_round_trip: Duration::from_millis(250),
            backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given one-based attempt failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(8);
        (self.backoff * factor).min(self.max_backoff)
    }
}

/// A fill reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitFill {
    /// Exchange order id.
    pub order_id: Option<String>,
    /// Average fill price.
    pub filled_price: Decimal,
    /// Shares filled.
    pub filled_size: Decimal,
}

/// Sends one order to the exchange.
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    /// Submit once. Errors are classified; retries are the caller's concern.
    async fn submit(&self, request: &OrderRequest) -> Result<SubmitFill, OrderError>;
}

/// Order body sent to the CLOB.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    token_id: String,
    side: Side,
    price: String,
    size: String,
    fee_rate_bps: String,
    nonce: String,
    expiration: String,
    taker: String,
    maker: String,
    signer: String,
    signature_type: u8,
    signature: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    order: OrderPayload,
    owner: String,
    order_type: String,
}

/// Order submission response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitResponse {
    /// Success flag.
    #[serde(default)]
    pub success: Option<bool>,
    /// Error message, if any.
    #[serde(default, alias = "errorMsg", alias = "error")]
    pub error_msg: Option<String>,
}

/// Live submitter against `POST {clob_url}/order`.
pub struct ClobSubmitter {
    http: reqwest::Client,
    clob_url: String,
    credentials: Arc<Credentials>,
    signer: PrivateKeySigner,
    address: String,
}

impl ClobSubmitter {
    /// Build a submitter; fails if the wallet key is unusable.
    pub fn new(http: reqwest::Client, clob_url: impl Into<String>, credentials: Arc<Credentials>) -> Result<Self, OrderError> {
        let signer = credentials.signer()?;
        let address = signing::address_of(&signer);
        Ok(Self {
            http,
            clob_url: clob_url.into().trim_end_matches('/').to_string(),
            credentials,
            signer,
            address,
        })
    }

    /// Wallet address orders are signed with.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl OrderSubmitter for ClobSubmitter {
    #[instrument(skip(self, request), fields(token = %request.token_id(), price = %request.price(), size = %request.size()))]
    async fn submit(&self, request: &OrderRequest) -> Result<SubmitFill, OrderError> {
        let api = self.credentials.api.as_ref().ok_or_else(|| {
            OrderError::Signature("live trading requires API credentials".to_string())
        })?;

        let nonce = chrono::Utc::now().timestamp_millis().to_string();
        let expiration = "0".to_string();
        let side = request.side().to_string();

        // token_id + side + price + size + nonce + expiration
        let order_message = format!(
            "{}:{}:{}:{}:{}:{}",
            request.token_id(),
            side,
            request.price(),
            request.size(),
            nonce,
            expiration
        );
        let signature = signing::sign_payload(&self.signer, order_message.as_bytes()).await?;

        let maker = self
            .credentials
            .funder
            .clone()
            .unwrap_or_else(|| self.address.clone());

        let body = SubmitBody {
            order: OrderPayload {
                token_id: request.token_id().to_string(),
                side: request.side(),
                price: request.price().to_string(),
                size: request.size().to_string(),
                fee_rate_bps: "0".to_string(),
                nonce,
                expiration,
                taker: "0x0000000000000000000000000000000000000000".to_string(),
                maker,
                signer: self.address.clone(),
                signature_type: self.credentials.wallet_kind.as_u8(),
                signature,
            },
            owner: api.key.clone(),
            order_type: request.tif().to_string(),
        };
        let body = serde_json::to_string(&body)
            .map_err(|e| OrderError::InvalidParams(format!("failed to encode order: {}", e)))?;

        let timestamp = OffsetDateTime::now_utc().unix_timestamp();
        let headers = signing::l2_headers(api, &self.address, timestamp, "POST", "/order", &body)?;

        let url = format!("{}/order", self.clob_url);
        let mut http_request = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (key, value) in headers {
            http_request = http_request.header(key, value);
        }

        let _timer = metrics::timer_order_submit();
        let response = http_request
            .send()
            .await
            .map_err(|e| OrderError::Transient(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| OrderError::Transient(format!("failed to read response: {}", e)))?;

        debug!(status, body = %text, "Order response");
        classify_response(status, &text, request)
    }
}

/// Map an HTTP status and body to a fill or a classified error.
pub fn classify_response(status: u16, body: &str, request: &OrderRequest) -> Result<SubmitFill, OrderError> {
    match status {
        429 => return Err(OrderError::RateLimited),
        500..=599 => return Err(OrderError::Transient(format!("HTTP {}: {}", status, body))),
        401 | 403 => return Err(OrderError::Signature(format!("HTTP {}: {}", status, body))),
        _ => {}
    }

    let json: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    let parsed: SubmitResponse = serde_json::from_value(json.clone()).unwrap_or_default();
    let message = parsed.error_msg.filter(|m| !m.trim().is_empty());

    if !(200..300).contains(&status) {
        let message = message.unwrap_or_else(|| body.to_string());
        return Err(OrderError::Rejected(classify_rejection(&message)));
    }

    if parsed.success == Some(false) || message.is_some() {
        let message = message.unwrap_or_else(|| "order not accepted".to_string());
        return Err(OrderError::Rejected(classify_rejection(&message)));
    }

    let shares = parse_decimal_field(&json, &["takingAmount", "filledSize", "filled_size", "size_matched"]);
    let paid = parse_decimal_field(&json, &["makingAmount"]);
    let filled_size = shares.filter(|s| *s > Decimal::ZERO).unwrap_or(request.size());
    let filled_price = match (paid, shares) {
        (Some(paid), Some(shares)) if shares > Decimal::ZERO => (paid / shares).round_dp(4),
        _ => request.price(),
    };

    Ok(SubmitFill {
        order_id: extract_order_id(&json),
        filled_price,
        filled_size,
    })
}

/// Map an exchange error message to a rejection reason.
pub fn classify_rejection(message: &str) -> RejectReason {
    let msg = message.to_lowercase();
    if msg.contains("balance") {
        RejectReason::InsufficientBalance
    } else if msg.contains("allowance") {
        RejectReason::InsufficientAllowance
    } else if msg.contains("fok") || msg.contains("fully filled") || msg.contains("no match") {
        RejectReason::NotFilled
    } else if msg.contains("closed") || msg.contains("not accepting") || msg.contains("resolved") {
        RejectReason::MarketClosed
    } else if msg.contains("tick") || msg.contains("price") {
        RejectReason::InvalidPrice
    } else {
        RejectReason::Other(message.trim().to_string())
    }
}

/// Extract order ID from API response.
pub fn extract_order_id(result: &serde_json::Value) -> Option<String> {
    for key in ["orderID", "orderId", "order_id", "id"] {
        if let Some(id) = result.get(key).and_then(|v| v.as_str()) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }

    for key in ["order", "data", "result"] {
        if let Some(nested) = result.get(key) {
            if let Some(id) = extract_order_id(nested) {
                return Some(id);
            }
        }
    }

    None
}

/// Parse a decimal field from JSON, trying multiple field names.
fn parse_decimal_field(json: &serde_json::Value, keys: &[&str]) -> Option<Decimal> {
    for key in keys {
        if let Some(value) = json.get(*key) {
            if let Some(s) = value.as_str() {
                if let Ok(d) = s.parse::<Decimal>() {
                    return Some(d);
                }
            }
            if let Some(n) = value.as_f64() {
                if let Ok(d) = Decimal::try_from(n) {
                    return Some(d);
                }
            }
        }
    }
    None
}

/// Builds, submits, and retries the sniper's single order.
pub struct OrderExecutor {
    submitter: Arc<dyn OrderSubmitter>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    built: AtomicU32,
}

impl OrderExecutor {
    /// Create an executor.
    pub fn new(submitter: Arc<dyn OrderSubmitter>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            submitter,
            clock,
            retry,
            built: AtomicU32::new(0),
        }
    }

    /// Validate and build a Fill-or-Kill buy.
    pub fn build(&self, token_id: &str, price: Decimal, size: Decimal) -> Result<OrderRequest, OrderError> {
        self.built.fetch_add(1, Ordering::SeqCst);
        OrderRequest::fok_buy(token_id, price, size)
    }

    /// Number of times [`OrderExecutor::build`] was called.
    pub fn builds(&self) -> u32 {
        self.built.load(Ordering::SeqCst)
    }

    /// Execute `request` before `deadline`.
    ///
    /// Dry run never touches the submitter.
    pub async fn execute(
        &self,
        request: &OrderRequest,
        mode: ExecutionMode,
        deadline: OffsetDateTime,
        last_snapshot: Option<&OrderBookSnapshot>,
    ) -> ExecutionResult {
        let start = self.clock.instant();

        if mode == ExecutionMode::DryRun {
            info!(
                token = %request.token_id(),
                price = %request.price(),
                size = %request.size(),
                snapshot = ?last_snapshot,
                "[DRY RUN] Would submit FOK buy"
            );
            return ExecutionResult {
                status: ExecutionStatus::Simulated,
                filled_price: Some(request.price()),
                filled_size: Some(request.size()),
                order_id: None,
                latency: self.clock.instant() - start,
                attempts: 0,
                error: None,
            };
        }

        let mut attempts = 0u32;
        let mut last_error = String::new();

        while attempts < self.retry.max_attempts {
            let now = self.clock.now();
            let left = deadline - now;
            if left < self.retry.min_round_trip {
                warn!(attempts, left_ms = left.whole_milliseconds() as i64, "Not enough time for another submission");
                metrics::inc_orders_failed();
                return ExecutionResult::failed(ExecutionError::MissedWindow, attempts, self.clock.instant() - start);
            }

            attempts += 1;
            metrics::inc_orders_submitted();

            match self.submitter.submit(request).await {
                Ok(fill) => {
                    metrics::inc_orders_filled();
                    info!(
                        order_id = ?fill.order_id,
                        price = %fill.filled_price,
                        size = %fill.filled_size,
                        attempts,
                        "Order filled"
                    );
                    return ExecutionResult {
                        status: ExecutionStatus::Filled,
                        filled_price: Some(fill.filled_price),
                        filled_size: Some(fill.filled_size),
                        order_id: fill.order_id,
                        latency: self.clock.instant() - start,
                        attempts,
                        error: None,
                    };
                }
                Err(OrderError::Rejected(reason)) => {
                    metrics::inc_orders_rejected();
                    warn!(reason = %reason, "Order rejected");
                    return ExecutionResult::failed(ExecutionError::Rejected(reason), attempts, self.clock.instant() - start);
                }
                Err(OrderError::Signature(msg)) => {
                    metrics::inc_orders_failed();
                    error!(error = %msg, "Order signing failed");
                    return ExecutionResult::failed(ExecutionError::Signature(msg), attempts, self.clock.instant() - start);
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, attempt = attempts, "Transient submission error");
                    last_error = e.to_string();
                    if attempts < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_after(attempts)).await;
                    }
                }
                Err(e) => {
                    metrics::inc_orders_rejected();
                    warn!(error = %e, "Order refused before submission");
                    return ExecutionResult::failed(
                        ExecutionError::Rejected(RejectReason::Other(e.to_string())),
                        attempts,
                        self.clock.instant() - start,
                    );
                }
            }
        }

        metrics::inc_orders_failed();
        error!(attempts, error = %last_error, "Order retries exhausted");
        ExecutionResult::failed(ExecutionError::RetriesExhausted(last_error), attempts, self.clock.instant() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniper::scheduler::WallClock;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use time::macros::datetime;

    const START: OffsetDateTime = datetime!(2025-01-01 12:00 UTC);

    struct ScriptedSubmitter {
        script: Mutex<Vec<Result<SubmitFill, OrderError>>>,
        calls: AtomicU32,
        latency: Duration,
    }

    impl ScriptedSubmitter {
        fn new(mut script: Vec<Result<SubmitFill, OrderError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                latency: Duration::from_millis(40),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OrderSubmitter for ScriptedSubmitter {
        async fn submit(&self, _request: &OrderRequest) -> Result<SubmitFill, OrderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(OrderError::Transient("script exhausted".into())))
        }
    }

    fn fill() -> SubmitFill {
        SubmitFill {
            order_id: Some("0xabc".into()),
            filled_price: dec!(0.99),
            filled_size: dec!(10),
        }
    }

    fn executor(submitter: Arc<ScriptedSubmitter>) -> OrderExecutor {
        OrderExecutor::new(submitter, Arc::new(WallClock::starting_at(START)), RetryPolicy::default())
    }

    fn request() -> OrderRequest {
        OrderRequest::fok_buy("token", dec!(0.99), dec!(10)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_never_submits() {
        let submitter = ScriptedSubmitter::new(vec![Ok(fill())]);
        let exec = executor(submitter.clone());

        let result = exec.execute(&request(), ExecutionMode::DryRun, START + Duration::from_secs(1), None).await;

        assert_eq!(result.status, ExecutionStatus::Simulated);
        assert_eq!(result.filled_price, Some(dec!(0.99)));
        assert_eq!(result.filled_size, Some(dec!(10)));
        assert_eq!(submitter.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let submitter = ScriptedSubmitter::new(vec![
            Err(OrderError::Transient("timeout".into())),
            Err(OrderError::RateLimited),
            Ok(fill()),
        ]);
        let exec = executor(submitter.clone());

        let result = exec.execute(&request(), ExecutionMode::Live, START + Duration::from_secs(1), None).await;

        assert_eq!(result.status, ExecutionStatus::Filled);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.order_id.as_deref(), Some("0xabc"));
        assert_eq!(submitter.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let submitter = ScriptedSubmitter::new(vec![
            Err(OrderError::Rejected(RejectReason::InsufficientAllowance)),
            Ok(fill()),
        ]);
        let exec = executor(submitter.clone());

        let result = exec.execute(&request(), ExecutionMode::Live, START + Duration::from_secs(1), None).await;

        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert_eq!(result.error, Some(ExecutionError::Rejected(RejectReason::InsufficientAllowance)));
        assert_eq!(submitter.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_when_window_is_too_short() {
        let submitter = ScriptedSubmitter::new(vec![
            Err(OrderError::Transient("timeout".into())),
            Err(OrderError::Transient("timeout".into())),
            Ok(fill()),
        ]);
        let exec = executor(submitter.clone());

        // 300ms left: first attempt (40ms) + 50ms backoff leaves 210ms < 250ms.
        let result = exec.execute(&request(), ExecutionMode::Live, START + Duration::from_millis(300), None).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error, Some(ExecutionError::MissedWindow));
        assert_eq!(submitter.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail() {
        let submitter = ScriptedSubmitter::new(vec![
            Err(OrderError::Transient("a".into())),
            Err(OrderError::Transient("b".into())),
            Err(OrderError::Transient("c".into())),
        ]);
        let exec = executor(submitter.clone());

        let result = exec.execute(&request(), ExecutionMode::Live, START + Duration::from_secs(5), None).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(matches!(result.error, Some(ExecutionError::RetriesExhausted(_))));
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn signature_failure_is_reported() {
        let submitter = ScriptedSubmitter::new(vec![Err(OrderError::Signature("bad key".into()))]);
        let exec = executor(submitter);

        let result = exec.execute(&request(), ExecutionMode::Live, START + Duration::from_secs(5), None).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error, Some(ExecutionError::Signature("bad key".into())));
    }

    #[test]
    fn build_counts_calls_and_validates() {
        let exec = executor(ScriptedSubmitter::new(vec![]));
        assert!(exec.build("t", dec!(0.99), dec!(10)).is_ok());
        assert!(exec.build("t", dec!(1.5), dec!(10)).is_err());
        assert_eq!(exec.builds(), 2);
    }

    #[test]
    fn classify_response_statuses() {
        let req = request();
        assert_eq!(classify_response(429, "", &req), Err(OrderError::RateLimited));
        assert!(matches!(classify_response(503, "down", &req), Err(OrderError::Transient(_))));
        assert!(matches!(classify_response(401, "nope", &req), Err(OrderError::Signature(_))));
        assert_eq!(
            classify_response(400, r#"{"error":"not enough balance / allowance"}"#, &req),
            Err(OrderError::Rejected(RejectReason::InsufficientBalance))
        );
    }

    #[test]
    fn classify_response_success_and_fok_kill() {
        let req = request();
        let ok = classify_response(
            200,
            r#"{"success":true,"errorMsg":"","orderID":"0x1","takingAmount":"10","makingAmount":"9.9","status":"matched"}"#,
            &req,
        )
        .unwrap();
        assert_eq!(ok.order_id.as_deref(), Some("0x1"));
        assert_eq!(ok.filled_size, dec!(10));
        assert_eq!(ok.filled_price, dec!(0.99));

        let killed = classify_response(
            200,
            r#"{"success":false,"errorMsg":"order couldn't be fully filled. FOK orders are fully filled or killed."}"#,
            &req,
        );
        assert_eq!(killed, Err(OrderError::Rejected(RejectReason::NotFilled)));
    }

    #[test]
    fn rejection_messages() {
        assert_eq!(classify_rejection("not enough allowance"), RejectReason::InsufficientAllowance);
        assert_eq!(classify_rejection("market is closed"), RejectReason::MarketClosed);
        assert_eq!(classify_rejection("invalid tick size"), RejectReason::InvalidPrice);
        assert_eq!(classify_rejection("weird"), RejectReason::Other("weird".into()));
    }

    #[test]
    fn extract_order_id_various_formats() {
        assert_eq!(extract_order_id(&serde_json::json!({"orderID": "abc"})), Some("abc".to_string()));
        assert_eq!(extract_order_id(&serde_json::json!({"order": {"id": "x"}})), Some("x".to_string()));
        assert_eq!(extract_order_id(&serde_json::json!({"error": "e"})), None);
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(2), Duration::from_millis(100));
        assert_eq!(policy.delay_after(5), Duration::from_millis(200));
    }
}
