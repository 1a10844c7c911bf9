//! Link orchestration.
//!
//! Ties the queue, cache, retry policy, throttle and connection store into
//! the linking state machine:
//!
//! ```text
//! Idle -> Initiating -> AwaitingHandshake -> Exchanging -> Connected
//!                                                      \-> Disconnected
//! ```
//!
//! Any hard failure drops back to `Idle` (or `Connected` when an earlier
//! link is still in place), with the ephemeral session torn down and the
//! attempt throttles left intact.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::aggregator::{AccountSummary, AggregatorClient, DateRange, TransactionRecord};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::queue::RequestQueue;
use crate::retry::RetryPolicy;
use crate::singleflight::SingleFlight;
use crate::store::{Connection, ConnectionStateStore, ConnectionStatus, StatusFlags};
use crate::throttle::{LinkAttemptThrottle, ThrottleChannel};

/// Where the orchestrator currently is in the linking lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Initiating,
    AwaitingHandshake,
    Exchanging,
    Connected,
    Disconnected,
}

/// Ephemeral handshake state handed to the UI. Never persisted.
#[derive(Debug, Clone)]
pub struct LinkSession {
    /// Short-lived opaque token the UI opens the aggregator widget with.
    pub link_token: String,
    pub initialized_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Extra handshake context reported by the UI widget.
#[derive(Debug, Clone, Default)]
pub struct LinkMetadata {
    pub institution_name: Option<String>,
}

/// Broadcast once per successful transition into `Connected`.
#[derive(Debug, Clone)]
pub struct ConnectedEvent {
    pub item_id: String,
    pub institution_name: Option<String>,
    pub account_count: usize,
}

struct State {
    phase: LinkPhase,
    session: Option<LinkSession>,
    connection: Option<Connection>,
}

/// Top-level API for linking a bank account and fetching its data.
///
/// One instance per process, owned by the composition root and shared by
/// handle; there is no hidden global.
pub struct LinkOrchestrator {
    config: LinkConfig,
    aggregator: Arc<dyn AggregatorClient>,
    queue: RequestQueue,
    accounts_flight: SingleFlight<Vec<AccountSummary>>,
    transactions_flight: SingleFlight<Vec<TransactionRecord>>,
    retry: Arc<RetryPolicy>,
    throttle: LinkAttemptThrottle,
    state_store: Arc<ConnectionStateStore>,
    state: Mutex<State>,
    connected_tx: broadcast::Sender<ConnectedEvent>,
    user_id: String,
}

impl LinkOrchestrator {
    /// Build the orchestrator and hydrate any persisted connection, so
    /// `is_connected` is accurate across restarts. Must be called from
    /// within a tokio runtime (the request queue spawns its worker).
    pub fn new(
        config: LinkConfig,
        aggregator: Arc<dyn AggregatorClient>,
        state_store: Arc<ConnectionStateStore>,
        user_id: impl Into<String>,
    ) -> Self {
        let queue = RequestQueue::new(config.queue_spacing);
        let accounts_flight =
            SingleFlight::new(config.accounts_ttl, queue.clone(), config.request_timeout);
        let transactions_flight =
            SingleFlight::new(config.transactions_ttl, queue.clone(), config.request_timeout);
        let retry = Arc::new(RetryPolicy::new(config.retry.clone()));
        let throttle = LinkAttemptThrottle::new(
            config.link_token_limits,
            config.link_flow_limits,
            config.success_flow_limits,
        );
        let (connected_tx, _) = broadcast::channel(8);

        let connection = match state_store.load() {
            Ok(connection) => connection,
            Err(err) => {
                tracing::error!("failed to load stored connection, starting unlinked: {err:#}");
                None
            }
        };
        let phase = if connection.is_some() {
            LinkPhase::Connected
        } else {
            LinkPhase::Idle
        };

        Self {
            config,
            aggregator,
            queue,
            accounts_flight,
            transactions_flight,
            retry,
            throttle,
            state_store,
            state: Mutex::new(State {
                phase,
                session: None,
                connection,
            }),
            connected_tx,
            user_id: user_id.into(),
        }
    }

    /// Mint a link token and open an ephemeral handshake session.
    ///
    /// Guarded by the link-flow and link-token throttle channels; a
    /// throttled call reports the wait time and leaves the state unchanged.
    pub async fn initiate_link(&self) -> Result<LinkSession, LinkError> {
        self.throttle.try_acquire(ThrottleChannel::LinkFlow)?;
        self.throttle.try_acquire(ThrottleChannel::LinkToken)?;

        {
            let mut state = self.state.lock();
            state.phase = LinkPhase::Initiating;
            state.session = None;
        }

        let aggregator = Arc::clone(&self.aggregator);
        let queue = self.queue.clone();
        let timeout = self.config.request_timeout;
        let user_id = self.user_id.clone();

        let result = self
            .retry
            .run(
                move || {
                    let aggregator = Arc::clone(&aggregator);
                    let queue = queue.clone();
                    let user_id = user_id.clone();
                    async move {
                        queue
                            .run(timeout, async move {
                                aggregator
                                    .create_link_token(&user_id)
                                    .await
                                    .map_err(LinkError::from)
                            })
                            .await
                    }
                },
                |_| true,
            )
            .await;

        match result {
            Ok(response) => {
                let session = LinkSession {
                    link_token: response.link_token,
                    initialized_at: Utc::now(),
                    is_active: true,
                };
                let mut state = self.state.lock();
                state.phase = LinkPhase::AwaitingHandshake;
                state.session = Some(session.clone());
                Ok(session)
            }
            Err(err) => {
                tracing::warn!("link initiation failed: {err}");
                self.fail_back_to_rest();
                Err(err)
            }
        }
    }

    /// Complete the handshake: exchange the widget's public token for a
    /// durable credential, run the first account fetch, persist and notify.
    ///
    /// On any failure the session is torn down and the state returns to
    /// rest; throttle attempts already spent stay spent.
    pub async fn complete_link(
        &self,
        public_token: &str,
        metadata: LinkMetadata,
    ) -> Result<Connection, LinkError> {
        {
            let mut state = self.state.lock();
            if state.phase != LinkPhase::AwaitingHandshake || state.session.is_none() {
                return Err(LinkError::Handshake(
                    "no link handshake in progress".to_string(),
                ));
            }
            // A stray call with no handshake must not burn a completion attempt.
            self.throttle.try_acquire(ThrottleChannel::SuccessFlow)?;
            state.phase = LinkPhase::Exchanging;
        }

        match self.exchange_and_fetch(public_token, &metadata).await {
            Ok(connection) => {
                if let Err(err) = self.state_store.save(&connection) {
                    tracing::error!("failed to persist connection: {err:#}");
                    self.fail_back_to_rest();
                    return Err(LinkError::fatal("could not store the new connection"));
                }

                // Anything cached before this link is stale now.
                self.accounts_flight.clear();
                self.transactions_flight.clear();

                {
                    let mut state = self.state.lock();
                    state.phase = LinkPhase::Connected;
                    state.session = None;
                    state.connection = Some(connection.clone());
                }

                let _ = self.connected_tx.send(ConnectedEvent {
                    item_id: connection.item_id.clone(),
                    institution_name: connection.institution_name.clone(),
                    account_count: connection.accounts.len(),
                });
                tracing::info!(item_id = %connection.item_id, "bank connection established");
                Ok(connection)
            }
            Err(err) => {
                tracing::warn!("link completion failed: {err}");
                self.fail_back_to_rest();
                Err(err)
            }
        }
    }

    async fn exchange_and_fetch(
        &self,
        public_token: &str,
        metadata: &LinkMetadata,
    ) -> Result<Connection, LinkError> {
        let aggregator = Arc::clone(&self.aggregator);
        let token = public_token.to_string();
        let exchange = self
            .queue
            .run(self.config.request_timeout, async move {
                aggregator
                    .exchange_public_token(&token)
                    .await
                    .map_err(LinkError::from)
            })
            .await
            .map_err(|err| match err {
                // Exchange problems are handshake failures, not generic ones.
                LinkError::Fatal(detail) | LinkError::NotReady(detail) => {
                    LinkError::Handshake(detail)
                }
                other => other,
            })?;

        // First fetch right after linking routinely hits staging delays.
        let aggregator = Arc::clone(&self.aggregator);
        let queue = self.queue.clone();
        let timeout = self.config.request_timeout;
        let credential = exchange.access_token.clone();
        let accounts = self
            .retry
            .run(
                move || {
                    let aggregator = Arc::clone(&aggregator);
                    let queue = queue.clone();
                    let credential = credential.clone();
                    async move {
                        queue
                            .run(timeout, async move {
                                aggregator
                                    .get_accounts(&credential)
                                    .await
                                    .map_err(LinkError::from)
                            })
                            .await
                    }
                },
                |_| true,
            )
            .await?;

        Ok(Connection {
            access_credential: exchange.access_token,
            item_id: exchange.item_id,
            institution_name: metadata.institution_name.clone(),
            accounts,
            status: ConnectionStatus::Connected,
            connected_at: Utc::now(),
            has_new_accounts: false,
            last_webhook_event: None,
        })
    }

    /// Tear down the handshake without linking, e.g. the user closed the
    /// widget. Keeps an existing connection intact.
    pub fn cancel_link(&self) {
        self.fail_back_to_rest();
    }

    /// Current balances for every linked account, served from cache inside
    /// the accounts TTL.
    pub async fn get_accounts(&self) -> Result<Vec<AccountSummary>, LinkError> {
        let (credential, item_id) = self.require_credential()?;
        let key = format!("accounts/{item_id}");

        let flight = self.accounts_flight.clone();
        let aggregator = Arc::clone(&self.aggregator);
        self.retry
            .run(
                move || {
                    let flight = flight.clone();
                    let aggregator = Arc::clone(&aggregator);
                    let credential = credential.clone();
                    let key = key.clone();
                    async move {
                        flight
                            .get(&key, async move {
                                aggregator
                                    .get_accounts(&credential)
                                    .await
                                    .map_err(LinkError::from)
                            })
                            .await
                    }
                },
                |_| true,
            )
            .await
    }

    /// Transactions inside `range`, newest first, deduplicated by id across
    /// pagination, served from cache inside the transactions TTL.
    ///
    /// Right after linking, upstream may still be staging history: fetches
    /// that do not yet reach back to `range.start` are retried on the
    /// not-ready schedule, re-fetching fresh each time, and the last result
    /// is returned (and cached) once the schedule runs out.
    pub async fn get_transactions(
        &self,
        range: DateRange,
    ) -> Result<Vec<TransactionRecord>, LinkError> {
        let (credential, item_id) = self.require_credential()?;
        let key = format!("transactions/{item_id}/{}/{}", range.start, range.end);

        // A TTL-fresh value is final, even for an account whose history only
        // starts mid-range: the staging retries below run only when the fetch
        // actually had to go upstream.
        if let Some(cached) = self.transactions_flight.peek(&key) {
            return Ok(cached);
        }

        let flight = self.transactions_flight.clone();
        let aggregator = Arc::clone(&self.aggregator);
        let spacing = self.config.queue_spacing;
        let mut first_attempt = true;

        let covers_range = move |records: &Vec<TransactionRecord>| {
            records
                .iter()
                .map(|txn| txn.date)
                .min()
                .map(|earliest| earliest <= range.start)
                .unwrap_or(false)
        };

        self.retry
            .run(
                move || {
                    let flight = flight.clone();
                    let aggregator = Arc::clone(&aggregator);
                    let credential = credential.clone();
                    let key = key.clone();

                    // A staging retry must hit upstream again, not the value
                    // it just cached.
                    if !first_attempt {
                        flight.invalidate(&key);
                    }
                    first_attempt = false;

                    async move {
                        let fetch_key = key.clone();
                        flight
                            .get(&fetch_key, async move {
                                fetch_transaction_range(aggregator, credential, range, spacing)
                                    .await
                            })
                            .await
                    }
                },
                covers_range,
            )
            .await
    }

    /// Whether a linked connection exists (persisted or just established).
    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    /// Status of the linked item, if any.
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.state.lock().connection.as_ref().map(|c| c.status)
    }

    pub fn phase(&self) -> LinkPhase {
        self.state.lock().phase
    }

    /// Subscribe to `Connected` transitions. Each successful link fires
    /// exactly one event; delivery order across subscribers is unspecified.
    pub fn on_connected(&self) -> broadcast::Receiver<ConnectedEvent> {
        self.connected_tx.subscribe()
    }

    /// Apply webhook-pushed status flags to the stored record and the
    /// in-memory copy.
    pub fn ingest_webhook(&self, flags: StatusFlags, event: Option<&str>) -> Result<(), LinkError> {
        self.state_store
            .update_status_flags(flags, event)
            .map_err(|err| {
                tracing::error!("failed to record webhook update: {err:#}");
                LinkError::fatal("could not record connection status update")
            })?;
        let mut state = self.state.lock();
        if let Some(connection) = state.connection.as_mut() {
            connection.apply_flags(flags, event);
        }
        Ok(())
    }

    /// Unlink: best-effort remote revoke, guaranteed local teardown.
    ///
    /// Always succeeds from the caller's point of view; a failed remote
    /// revoke or store write is logged and local state still clears.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let credential = self
            .state
            .lock()
            .connection
            .as_ref()
            .map(|c| c.access_credential.clone());

        if let Some(credential) = credential {
            let aggregator = Arc::clone(&self.aggregator);
            let revoke = self
                .queue
                .run(self.config.request_timeout, async move {
                    aggregator
                        .remove_item(&credential)
                        .await
                        .map_err(LinkError::from)
                })
                .await;
            if let Err(err) = revoke {
                tracing::warn!("remote revoke failed, clearing local state anyway: {err}");
            }
        }

        if let Err(err) = self.state_store.clear() {
            tracing::error!("failed to clear stored connection: {err:#}");
        }
        self.accounts_flight.clear();
        self.transactions_flight.clear();

        let mut state = self.state.lock();
        state.connection = None;
        state.session = None;
        state.phase = LinkPhase::Disconnected;
        tracing::info!("bank connection removed");
        Ok(())
    }

    fn require_credential(&self) -> Result<(String, String), LinkError> {
        let state = self.state.lock();
        state
            .connection
            .as_ref()
            .map(|c| (c.access_credential.clone(), c.item_id.clone()))
            .ok_or(LinkError::NotConnected)
    }

    /// Drop the ephemeral session and settle on the resting phase: still
    /// `Connected` when an earlier link exists, `Idle` otherwise.
    fn fail_back_to_rest(&self) {
        let mut state = self.state.lock();
        state.session = None;
        state.phase = if state.connection.is_some() {
            LinkPhase::Connected
        } else {
            LinkPhase::Idle
        };
    }
}

/// Drain the transaction cursor, keeping records inside `range` and dropping
/// duplicate ids the cursor contract should not (but might) repeat.
async fn fetch_transaction_range(
    aggregator: Arc<dyn AggregatorClient>,
    credential: String,
    range: DateRange,
    page_spacing: std::time::Duration,
) -> Result<Vec<TransactionRecord>, LinkError> {
    let mut cursor: Option<String> = None;
    let mut seen: HashSet<String> = HashSet::new();
    let mut records: Vec<TransactionRecord> = Vec::new();

    loop {
        let page = aggregator
            .sync_transactions(&credential, cursor.as_deref())
            .await
            .map_err(LinkError::from)?;

        for txn in page.transactions {
            if txn.date >= range.start && txn.date <= range.end && seen.insert(txn.id.clone()) {
                records.push(txn);
            }
        }

        if !page.has_more {
            break;
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
        tokio::time::sleep(page_spacing).await;
    }

    records.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
    Ok(records)
}
