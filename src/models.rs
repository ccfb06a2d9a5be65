//! Unified state model.
//!
//! The aggregator owns one `UnifiedState` tree with five keyed categories.
//! Category subtrees are `Arc`-wrapped so an apply only re-allocates the
//! subtree it mutates; readers hold cheap clones of the published pointer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Top-level categories of the unified state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Category {
    MarketData = 0,
    OrderBook = 1,
    Orders = 2,
    Positions = 3,
    Account = 4,
    Strategies = 5,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::MarketData,
        Category::OrderBook,
        Category::Orders,
        Category::Positions,
        Category::Account,
        Category::Strategies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::MarketData => "market_data",
            Category::OrderBook => "order_book",
            Category::Orders => "orders",
            Category::Positions => "positions",
            Category::Account => "account",
            Category::Strategies => "strategies",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "market_data" => Some(Category::MarketData),
            "order_book" => Some(Category::OrderBook),
            "orders" => Some(Category::Orders),
            "positions" => Some(Category::Positions),
            "account" => Some(Category::Account),
            "strategies" => Some(Category::Strategies),
            _ => None,
        }
    }

    #[inline]
    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

/// Set of categories, packed into a byte so a session's subscription set can
/// live in a single atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CategorySet(u8);

impl CategorySet {
    pub const EMPTY: CategorySet = CategorySet(0);

    pub fn all() -> Self {
        let mut set = CategorySet::EMPTY;
        for c in Category::ALL {
            set.insert(c);
        }
        set
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut set = CategorySet::EMPTY;
        for name in names {
            if let Some(c) = Category::from_str(name.as_ref()) {
                set.insert(c);
            }
        }
        set
    }

    #[inline]
    pub fn insert(&mut self, c: Category) {
        self.0 |= c.bit();
    }

    #[inline]
    pub fn remove(&mut self, c: Category) {
        self.0 &= !c.bit();
    }

    #[inline]
    pub fn contains(&self, c: Category) -> bool {
        self.0 & c.bit() != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Category> + '_ {
        Category::ALL.into_iter().filter(|c| self.contains(*c))
    }

    pub fn names(&self) -> Vec<String> {
        self.iter().map(|c| c.as_str().to_string()).collect()
    }

    #[inline]
    pub fn bits(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        CategorySet(bits & 0x3f)
    }
}

/// Best-price quote plus rolling 24 h stats for one symbol.
///
/// The 24 h fields start zeroed; trade events fold volume in, quote payloads
/// may carry high/low when the producer publishes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    #[serde(default)]
    pub high_24h: f64,
    #[serde(default)]
    pub low_24h: f64,
    #[serde(default)]
    pub volume_24h: f64,
    /// Producer timestamp, epoch milliseconds.
    pub updated_at: i64,
}

/// One side level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

/// L2 order book for one symbol, truncated to the configured depth.
///
/// Bids sorted by price descending, asks ascending. `last_update_id` is the
/// producer's strictly increasing sequence for gap detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub updated_at: i64,
}

impl OrderBook {
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            last_update_id: 0,
            bids: Vec::new(),
            asks: Vec::new(),
            updated_at: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Terminal orders stay in the list for the retention window but take no
    /// further fills.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: String,
    pub status: OrderStatus,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub price: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Account {
    pub balances: HashMap<String, f64>,
    pub total_equity: f64,
    pub available_margin: f64,
    pub unrealized_pnl: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub mode: String,
    pub signals: u64,
    pub orders: u64,
    pub pnl: f64,
    pub updated_at: i64,
}

/// Per-category monotone versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryVersions {
    pub market_data: u64,
    pub order_book: u64,
    pub orders: u64,
    pub positions: u64,
    pub account: u64,
    pub strategies: u64,
}

impl CategoryVersions {
    pub fn bump(&mut self, category: Category) {
        match category {
            Category::MarketData => self.market_data += 1,
            Category::OrderBook => self.order_book += 1,
            Category::Orders => self.orders += 1,
            Category::Positions => self.positions += 1,
            Category::Account => self.account += 1,
            Category::Strategies => self.strategies += 1,
        }
    }
}

/// The aggregated state tree. Immutable once published; the writer builds the
/// next tree from the current one, cloning only mutated subtrees.
#[derive(Debug, Clone)]
pub struct UnifiedState {
    pub market_data: Arc<HashMap<String, MarketQuote>>,
    pub order_books: Arc<HashMap<String, OrderBook>>,
    /// Most recent first.
    pub orders: Arc<Vec<Order>>,
    pub positions: Arc<HashMap<String, Position>>,
    pub account: Arc<Account>,
    pub strategies: Arc<HashMap<String, StrategyStatus>>,
    pub versions: CategoryVersions,
    pub version: u64,
}

impl Default for UnifiedState {
    fn default() -> Self {
        Self {
            market_data: Arc::new(HashMap::new()),
            order_books: Arc::new(HashMap::new()),
            orders: Arc::new(Vec::new()),
            positions: Arc::new(HashMap::new()),
            account: Arc::new(Account::default()),
            strategies: Arc::new(HashMap::new()),
            versions: CategoryVersions::default(),
            version: 0,
        }
    }
}

/// A stable read of the unified state restricted to a subscription set.
///
/// Holding a view never observes later mutations: the `Arc`s point into the
/// tree that was published at `version`.
#[derive(Debug, Clone)]
pub struct StateView {
    pub market_data: Option<Arc<HashMap<String, MarketQuote>>>,
    pub order_books: Option<Arc<HashMap<String, OrderBook>>>,
    pub orders: Option<Arc<Vec<Order>>>,
    pub positions: Option<Arc<HashMap<String, Position>>>,
    pub account: Option<Arc<Account>>,
    pub strategies: Option<Arc<HashMap<String, StrategyStatus>>>,
    pub version: u64,
}

impl StateView {
    pub fn of(state: &UnifiedState, filter: CategorySet) -> Self {
        Self {
            market_data: filter
                .contains(Category::MarketData)
                .then(|| state.market_data.clone()),
            order_books: filter
                .contains(Category::OrderBook)
                .then(|| state.order_books.clone()),
            orders: filter.contains(Category::Orders).then(|| state.orders.clone()),
            positions: filter
                .contains(Category::Positions)
                .then(|| state.positions.clone()),
            account: filter.contains(Category::Account).then(|| state.account.clone()),
            strategies: filter
                .contains(Category::Strategies)
                .then(|| state.strategies.clone()),
            version: state.version,
        }
    }
}

/// A typed change to the unified state, produced by the ingestor or the
/// snapshot refresher and consumed by the single aggregator writer.
#[derive(Debug, Clone)]
pub enum StateDelta {
    MarketQuoteUpdate {
        symbol: String,
        quote: MarketQuote,
    },
    /// Trade print folded into the quote: updates `last`, accumulates
    /// `volume_24h`.
    TradeUpdate {
        symbol: String,
        price: f64,
        quantity: f64,
        timestamp: i64,
    },
    OrderBookDelta {
        symbol: String,
        first_id: u64,
        last_id: u64,
        bid_changes: Vec<PriceLevel>,
        ask_changes: Vec<PriceLevel>,
        timestamp: i64,
    },
    OrderBookReset {
        snapshot: OrderBook,
    },
    OrderUpdate(Order),
    OrdersReplace(Vec<Order>),
    PositionUpdate {
        symbol: String,
        position: Position,
    },
    AccountUpdate(Account),
    StrategyUpdate(StrategyStatus),
    StrategiesReplace(Vec<StrategyStatus>),
}

impl StateDelta {
    pub fn category(&self) -> Category {
        match self {
            StateDelta::MarketQuoteUpdate { .. } | StateDelta::TradeUpdate { .. } => {
                Category::MarketData
            }
            StateDelta::OrderBookDelta { .. } | StateDelta::OrderBookReset { .. } => {
                Category::OrderBook
            }
            StateDelta::OrderUpdate(_) | StateDelta::OrdersReplace(_) => Category::Orders,
            StateDelta::PositionUpdate { .. } => Category::Positions,
            StateDelta::AccountUpdate(_) => Category::Account,
            StateDelta::StrategyUpdate(_) | StateDelta::StrategiesReplace(_) => {
                Category::Strategies
            }
        }
    }
}
