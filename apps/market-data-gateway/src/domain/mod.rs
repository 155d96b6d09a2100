//! Domain Layer - Core market data types and business rules.
//!
//! Pure types with no I/O: timeframes and slot arithmetic, decoded market
//! data, cache records with their status transitions, the request/response
//! contract, and the subscription ticket pool.

/// Candle granularities and slot arithmetic.
pub mod timeframe;

/// Decoded market data (tickers, trades, order books, candles).
pub mod market_data;

/// Time-indexed cache records and collection status.
pub mod cache_record;

/// Consumer request and response contract.
pub mod request;

/// Connection state and lifecycle events.
pub mod connection;

/// Subscription ticket consolidation.
pub mod subscription;
