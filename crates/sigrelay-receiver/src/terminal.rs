//! Seams to the host environment: the trading terminal, the quote
//! feed, and the wallet probe.
//!
//! The receiver never talks to a broker directly; the host provides a
//! `place_order` capability and a fresh bid/ask. Implementations here
//! are deliberately thin — the real ones live with the host platform.

use sigrelay_core::signal::Side;
use tracing::info;

/// Errors from host capabilities.
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    /// The terminal refused the order.
    #[error("order rejected by terminal: {0}")]
    Rejected(String),

    /// The capability did not answer within its bounded timeout.
    #[error("terminal call timed out")]
    Timeout,

    /// The capability is unreachable.
    #[error("terminal unavailable: {0}")]
    Unavailable(String),
}

/// An order derived from an admitted signal.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Instrument symbol.
    pub symbol: String,
    /// Direction.
    pub side: Side,
    /// Volume after the policy lot cap.
    pub volume: f64,
    /// Signalled price.
    pub price: f64,
    /// Stop-loss level; `0.0` when unset.
    pub stop_loss: f64,
    /// Take-profit level; `0.0` when unset.
    pub take_profit: f64,
}

/// A live quote for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    /// Best bid.
    pub bid: f64,
    /// Best ask.
    pub ask: f64,
    /// Price digits of the symbol.
    pub digits: u8,
    /// Size of one point in price units (e.g. `0.00001` on a 5-digit
    /// symbol).
    pub point: f64,
}

impl Quote {
    /// The side of the book a signal fills against.
    #[must_use]
    pub const fn fill_price(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.ask,
            Side::Sell | Side::Close => self.bid,
        }
    }
}

/// The host terminal's order-placement capability. Synchronous; may
/// block up to a bounded timeout.
pub trait OrderTerminal: Send {
    /// Place an order, returning the host's ticket id.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError`] when the order was not placed.
    fn place_order(&mut self, order: &OrderRequest) -> Result<String, TerminalError>;
}

/// The host's quote feed, assumed fresh within low single-digit
/// milliseconds.
pub trait QuoteSource: Send {
    /// Current quote for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError`] when no quote is available.
    fn quote(&self, symbol: &str) -> Result<Quote, TerminalError>;
}

/// Best-effort wallet view for this subscription.
pub trait WalletProbe: Send {
    /// Whether the subscription has spendable balance. A definitive
    /// `false` is authoritative for the one decision it informs.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError`] when the oracle cannot answer; the
    /// guard decides between fail-closed and advisory handling.
    fn has_funds(&self) -> Result<bool, TerminalError>;
}

/// Terminal that logs orders without placing them. Used by the binary's
/// dry-run mode and in harnesses.
#[derive(Debug, Default)]
pub struct DryRunTerminal {
    placed: u64,
}

impl OrderTerminal for DryRunTerminal {
    fn place_order(&mut self, order: &OrderRequest) -> Result<String, TerminalError> {
        self.placed += 1;
        let ticket = format!("dry-{}", self.placed);
        info!(
            ticket,
            symbol = %order.symbol,
            side = %order.side,
            volume = order.volume,
            price = order.price,
            "dry-run order"
        );
        Ok(ticket)
    }
}

/// Quote source pinned to one static quote per call. Harness use.
#[derive(Debug, Clone, Copy)]
pub struct StaticQuotes {
    /// The quote returned for every symbol.
    pub quote: Quote,
}

impl QuoteSource for StaticQuotes {
    fn quote(&self, _symbol: &str) -> Result<Quote, TerminalError> {
        Ok(self.quote)
    }
}

/// Wallet probe that always answers yes. For deployments where funding
/// is enforced server-side.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFunded;

impl WalletProbe for AlwaysFunded {
    fn has_funds(&self) -> Result<bool, TerminalError> {
        Ok(true)
    }
}
