//! State aggregator.
//!
//! Single-writer owner of the unified state. Deltas arrive on a bounded
//! channel and are applied one at a time; every accepted delta publishes a
//! fresh immutable tree through an `ArcSwap`, so readers take consistent
//! snapshots without ever blocking the writer. Nothing in the apply path
//! performs I/O.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::SEQUENCE_GAPS_TOTAL;
use crate::models::{
    CategorySet, CategoryVersions, MarketQuote, Order, OrderBook, PriceLevel, StateDelta,
    StateView, UnifiedState,
};

/// Bound of the delta channel between producers and the writer.
pub const DELTA_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    SequenceGap {
        symbol: String,
        expected: u64,
        got: u64,
    },
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequenceGap {
                symbol,
                expected,
                got,
            } => write!(
                f,
                "order book sequence gap for {symbol}: expected first_id {expected}, got {got}"
            ),
        }
    }
}

impl std::error::Error for ApplyError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Delta accepted; the new global version.
    Applied(u64),
    /// Stale or duplicate delta, dropped without a version bump.
    Ignored,
}

/// Shared handle to the aggregator: submit deltas, take snapshots.
pub struct Aggregator {
    state: Arc<ArcSwap<UnifiedState>>,
    delta_tx: mpsc::Sender<StateDelta>,
    writer_alive: Arc<AtomicBool>,
}

impl Aggregator {
    /// Spawn the writer task. The returned join handle completes once the
    /// delta channel has been drained after shutdown.
    pub fn spawn(
        order_retention: usize,
        book_depth: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let state = Arc::new(ArcSwap::from_pointee(UnifiedState::default()));
        let (delta_tx, delta_rx) = mpsc::channel(DELTA_QUEUE_DEPTH);
        let writer_alive = Arc::new(AtomicBool::new(true));

        let mut writer = StateWriter::new(order_retention, book_depth, state.clone());
        let alive = writer_alive.clone();
        let handle = tokio::spawn(async move {
            writer.run(delta_rx, shutdown).await;
            alive.store(false, Ordering::Relaxed);
        });

        (
            Arc::new(Self {
                state,
                delta_tx,
                writer_alive,
            }),
            handle,
        )
    }

    /// Queue a delta for the writer. Returns false once the writer is gone.
    pub async fn submit(&self, delta: StateDelta) -> bool {
        self.delta_tx.send(delta).await.is_ok()
    }

    /// Consistent read: the categories in `filter` plus the global version
    /// at the moment of the load. The view is stable; later applies publish
    /// new trees and never mutate this one.
    pub fn snapshot(&self, filter: CategorySet) -> StateView {
        StateView::of(&self.state.load(), filter)
    }

    pub fn version(&self) -> u64 {
        self.state.load().version
    }

    pub fn category_versions(&self) -> CategoryVersions {
        self.state.load().versions
    }

    pub fn is_alive(&self) -> bool {
        self.writer_alive.load(Ordering::Relaxed)
    }
}

/// The single writer. Owns sequence bookkeeping that is not part of the
/// published tree (which symbols currently have a validated book stream).
pub struct StateWriter {
    current: Arc<UnifiedState>,
    store: Arc<ArcSwap<UnifiedState>>,
    synced_books: HashSet<String>,
    order_retention: usize,
    book_depth: usize,
}

impl StateWriter {
    pub fn new(
        order_retention: usize,
        book_depth: usize,
        store: Arc<ArcSwap<UnifiedState>>,
    ) -> Self {
        let current = store.load_full();
        Self {
            current,
            store,
            synced_books: HashSet::new(),
            order_retention,
            book_depth,
        }
    }

    async fn run(
        &mut self,
        mut rx: mpsc::Receiver<StateDelta>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(delta) => self.handle(delta),
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Refuse new deltas but drain what is already queued
                        // so no in-flight update is lost to accounting.
                        rx.close();
                        while let Some(delta) = rx.recv().await {
                            self.handle(delta);
                        }
                        break;
                    }
                }
            }
        }
        info!(version = self.current.version, "aggregator writer exited, delta channel drained");
    }

    fn handle(&mut self, delta: StateDelta) {
        let category = delta.category();
        match self.apply(delta) {
            Ok(ApplyOutcome::Applied(_)) => {}
            Ok(ApplyOutcome::Ignored) => {
                debug!(category = category.as_str(), "stale delta dropped");
            }
            Err(err) => {
                // Sequence gaps are non-fatal: the symbol re-baselines on its
                // next delta.
                warn!(%err, "delta rejected");
            }
        }
    }

    /// Apply one delta. Accepted deltas bump the category and global
    /// versions by exactly one and publish the new tree.
    pub fn apply(&mut self, delta: StateDelta) -> Result<ApplyOutcome, ApplyError> {
        let category = delta.category();
        let mut next = (*self.current).clone();

        let accepted = match delta {
            StateDelta::MarketQuoteUpdate { symbol, quote } => {
                self.apply_quote(&mut next, symbol, quote)
            }
            StateDelta::TradeUpdate {
                symbol,
                price,
                quantity,
                timestamp,
            } => self.apply_trade(&mut next, symbol, price, quantity, timestamp),
            StateDelta::OrderBookDelta {
                symbol,
                first_id,
                last_id,
                bid_changes,
                ask_changes,
                timestamp,
            } => self.apply_book_delta(
                &mut next,
                symbol,
                first_id,
                last_id,
                bid_changes,
                ask_changes,
                timestamp,
            )?,
            StateDelta::OrderBookReset { snapshot } => self.apply_book_reset(&mut next, snapshot),
            StateDelta::OrderUpdate(order) => self.apply_order(&mut next, order),
            StateDelta::OrdersReplace(orders) => self.apply_orders_replace(&mut next, orders),
            StateDelta::PositionUpdate { symbol, position } => {
                let mut positions = (*next.positions).clone();
                match positions.get(&symbol) {
                    Some(existing) if position.updated_at <= existing.updated_at => false,
                    _ => {
                        positions.insert(symbol, position);
                        next.positions = Arc::new(positions);
                        true
                    }
                }
            }
            StateDelta::AccountUpdate(account) => {
                if account.updated_at <= next.account.updated_at && next.versions.account > 0 {
                    false
                } else {
                    next.account = Arc::new(account);
                    true
                }
            }
            StateDelta::StrategyUpdate(status) => {
                let mut strategies = (*next.strategies).clone();
                match strategies.get(&status.id) {
                    Some(existing) if status.updated_at <= existing.updated_at => false,
                    _ => {
                        strategies.insert(status.id.clone(), status);
                        next.strategies = Arc::new(strategies);
                        true
                    }
                }
            }
            StateDelta::StrategiesReplace(list) => {
                let replacement: HashMap<String, _> =
                    list.into_iter().map(|s| (s.id.clone(), s)).collect();
                if replacement == *next.strategies {
                    false
                } else {
                    next.strategies = Arc::new(replacement);
                    true
                }
            }
        };

        if !accepted {
            return Ok(ApplyOutcome::Ignored);
        }

        next.versions.bump(category);
        next.version += 1;
        let version = next.version;
        self.publish(next);
        Ok(ApplyOutcome::Applied(version))
    }

    fn publish(&mut self, next: UnifiedState) {
        let next = Arc::new(next);
        self.current = next.clone();
        self.store.store(next);
    }

    fn apply_quote(&self, next: &mut UnifiedState, symbol: String, mut quote: MarketQuote) -> bool {
        let mut market_data = (*next.market_data).clone();
        if let Some(existing) = market_data.get(&symbol) {
            if quote.updated_at <= existing.updated_at {
                return false;
            }
            // Producers may zero the rolling stats; keep what trades have
            // accumulated.
            if quote.volume_24h == 0.0 {
                quote.volume_24h = existing.volume_24h;
            }
            if quote.high_24h == 0.0 {
                quote.high_24h = existing.high_24h;
            }
            if quote.low_24h == 0.0 {
                quote.low_24h = existing.low_24h;
            }
        }
        market_data.insert(symbol, quote);
        next.market_data = Arc::new(market_data);
        true
    }

    fn apply_trade(
        &self,
        next: &mut UnifiedState,
        symbol: String,
        price: f64,
        quantity: f64,
        timestamp: i64,
    ) -> bool {
        let mut market_data = (*next.market_data).clone();
        match market_data.get_mut(&symbol) {
            Some(quote) => {
                if timestamp <= quote.updated_at {
                    return false;
                }
                quote.last = price;
                quote.volume_24h += quantity;
                quote.updated_at = timestamp;
            }
            None => {
                market_data.insert(
                    symbol.clone(),
                    MarketQuote {
                        symbol,
                        last: price,
                        bid: 0.0,
                        ask: 0.0,
                        bid_size: 0.0,
                        ask_size: 0.0,
                        high_24h: 0.0,
                        low_24h: 0.0,
                        volume_24h: quantity,
                        updated_at: timestamp,
                    },
                );
            }
        }
        next.market_data = Arc::new(market_data);
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_book_delta(
        &mut self,
        next: &mut UnifiedState,
        symbol: String,
        first_id: u64,
        last_id: u64,
        bid_changes: Vec<PriceLevel>,
        ask_changes: Vec<PriceLevel>,
        timestamp: i64,
    ) -> Result<bool, ApplyError> {
        let mut books = (*next.order_books).clone();
        let book = books
            .entry(symbol.clone())
            .or_insert_with(|| OrderBook::empty(&symbol));

        if self.synced_books.contains(&symbol) {
            // Replays of already-incorporated ranges are duplicates, not
            // gaps.
            if last_id <= book.last_update_id {
                return Ok(false);
            }
            let expected = book.last_update_id + 1;
            if first_id != expected {
                self.synced_books.remove(&symbol);
                counter!(SEQUENCE_GAPS_TOTAL, 1, "symbol" => symbol.clone());
                return Err(ApplyError::SequenceGap {
                    symbol,
                    expected,
                    got: first_id,
                });
            }
        }
        // An unsynced symbol accepts whatever comes next as its new
        // baseline.

        apply_levels(&mut book.bids, &bid_changes, true, self.book_depth);
        apply_levels(&mut book.asks, &ask_changes, false, self.book_depth);
        book.last_update_id = last_id;
        book.updated_at = timestamp;
        self.synced_books.insert(symbol);

        next.order_books = Arc::new(books);
        Ok(true)
    }

    fn apply_book_reset(&mut self, next: &mut UnifiedState, mut snapshot: OrderBook) -> bool {
        sort_book(&mut snapshot);
        snapshot.bids.truncate(self.book_depth);
        snapshot.asks.truncate(self.book_depth);

        let mut books = (*next.order_books).clone();
        self.synced_books.insert(snapshot.symbol.clone());
        books.insert(snapshot.symbol.clone(), snapshot);
        next.order_books = Arc::new(books);
        true
    }

    fn apply_order(&self, next: &mut UnifiedState, order: Order) -> bool {
        let mut orders = (*next.orders).clone();
        if let Some(existing) = orders.iter_mut().find(|o| o.id == order.id) {
            // Terminal orders sit out the retention window as-is.
            if existing.status.is_terminal() || order.updated_at <= existing.updated_at {
                return false;
            }
            *existing = order;
        } else {
            orders.insert(0, order);
        }
        evict_orders(&mut orders, self.order_retention);
        next.orders = Arc::new(orders);
        true
    }

    fn apply_orders_replace(&self, next: &mut UnifiedState, mut orders: Vec<Order>) -> bool {
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        evict_orders(&mut orders, self.order_retention);
        if orders == *next.orders {
            return false;
        }
        next.orders = Arc::new(orders);
        true
    }
}

/// Apply level changes to one ordered side. Quantity zero deletes the
/// level; afterwards the side is truncated to `depth`.
fn apply_levels(levels: &mut Vec<PriceLevel>, changes: &[PriceLevel], descending: bool, depth: usize) {
    for change in changes {
        let pos = levels.binary_search_by(|probe| {
            let ord = probe
                .price
                .partial_cmp(&change.price)
                .unwrap_or(std::cmp::Ordering::Equal);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        match pos {
            Ok(i) => {
                if change.size == 0.0 {
                    levels.remove(i);
                } else {
                    levels[i].size = change.size;
                }
            }
            Err(i) => {
                if change.size > 0.0 {
                    levels.insert(i, *change);
                }
            }
        }
    }
    levels.truncate(depth);
}

fn sort_book(book: &mut OrderBook) {
    book.bids.sort_by(|a, b| {
        b.price
            .partial_cmp(&a.price)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    book.asks.sort_by(|a, b| {
        a.price
            .partial_cmp(&b.price)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Keep at most `retention` orders, evicting by `created_at` (oldest first).
fn evict_orders(orders: &mut Vec<Order>, retention: usize) {
    while orders.len() > retention {
        let oldest = orders
            .iter()
            .enumerate()
            .min_by_key(|(_, o)| o.created_at)
            .map(|(i, _)| i);
        match oldest {
            Some(i) => {
                orders.remove(i);
            }
            None => break,
        }
    }
}
