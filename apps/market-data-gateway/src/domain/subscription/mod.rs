//! Ticket Consolidation
//!
//! Packs logical subscriptions into the few subscription tickets an exchange
//! allows per connection, and renders each ticket as one wire message.
//!
//! # Design
//!
//! The manager tracks:
//! - A bounded pool of tickets, in creation order
//! - Per ticket, one entry per data type with its symbols and params
//! - Reference counts per (data type, symbol) so repeated subscribers share
//!   one upstream subscription
//!
//! All pool access goes through a single mutex. Replay rendering takes the
//! same lock, so an unsubscribe can never interleave with a replay.
//!
//! # Wire format
//!
//! ```json
//! [{"ticket":"<id>"},{"codes":["KRW-BTC"],"type":"ticker"},{"format":"DEFAULT"}]
//! ```

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value, json};

use super::market_data::DataType;

// =============================================================================
// Types
// =============================================================================

/// Extra per-entry options (e.g. `isOnlyRealtime`).
pub type SubscriptionParams = Map<String, Value>;

/// Ticket identifier, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TicketId(String);

impl TicketId {
    /// Fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rendered outbound subscription message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireMessage(String);

impl WireMessage {
    /// Message text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the message text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionLimits {
    /// Maximum live tickets.
    pub max_tickets: usize,
    /// Maximum distinct data types per ticket.
    pub max_entries_per_ticket: usize,
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            max_tickets: 5,
            max_entries_per_ticket: 8,
        }
    }
}

/// Subscription errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Every ticket is full and no merge target exists.
    #[error("subscription limit exceeded: {max_tickets} tickets with no free entry")]
    LimitExceeded {
        /// Configured ticket cap.
        max_tickets: usize,
    },
    /// Subscribe was called without symbols.
    #[error("no symbols given for {0}")]
    NoSymbols(DataType),
}

/// What an unsubscribe changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribeOutcome {
    /// Tickets whose message changed and should be re-sent.
    pub updated: Vec<TicketId>,
    /// Tickets removed from the pool.
    pub retired: Vec<TicketId>,
}

impl UnsubscribeOutcome {
    /// Whether anything changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.retired.is_empty()
    }
}

/// Read-only view of one ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketSnapshot {
    /// Ticket identifier.
    pub id: TicketId,
    /// Data types with their symbols, in insertion order.
    pub entries: Vec<(DataType, Vec<String>)>,
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Live tickets.
    pub tickets: usize,
    /// Data type entries across tickets.
    pub entries: usize,
    /// (data type, symbol) pairs across tickets.
    pub symbols: usize,
}

// =============================================================================
// Ticket
// =============================================================================

#[derive(Debug)]
struct TicketEntry {
    data_type: DataType,
    symbols: Vec<String>,
    refcount: HashMap<String, usize>,
    params: SubscriptionParams,
}

impl TicketEntry {
    fn new(data_type: DataType, params: SubscriptionParams) -> Self {
        Self {
            data_type,
            symbols: Vec::new(),
            refcount: HashMap::new(),
            params,
        }
    }

    /// Returns true if any symbol is new to this entry.
    fn add(&mut self, symbols: &[String], params: SubscriptionParams) -> bool {
        let mut changed = false;
        for symbol in symbols {
            let count = self.refcount.entry(symbol.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.symbols.push(symbol.clone());
                changed = true;
            }
        }
        for (key, value) in params {
            if !self.params.contains_key(&key) {
                self.params.insert(key, value);
                changed = true;
            }
        }
        changed
    }

    /// Returns true if any symbol left this entry.
    fn remove(&mut self, symbols: &[String]) -> bool {
        let mut changed = false;
        for symbol in symbols {
            let Some(count) = self.refcount.get_mut(symbol) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.refcount.remove(symbol);
                self.symbols.retain(|s| s != symbol);
                changed = true;
            }
        }
        changed
    }

    fn render(&self) -> Value {
        let mut object = self.params.clone();
        object.insert("type".to_string(), Value::String(self.data_type.wire_name()));
        object.insert("codes".to_string(), json!(self.symbols));
        Value::Object(object)
    }
}

#[derive(Debug)]
struct Ticket {
    id: TicketId,
    entries: Vec<TicketEntry>,
    last_used: u64,
}

impl Ticket {
    fn new(now: u64) -> Self {
        Self {
            id: TicketId::generate(),
            entries: Vec::new(),
            last_used: now,
        }
    }

    fn entry_mut(&mut self, data_type: DataType) -> Option<&mut TicketEntry> {
        self.entries.iter_mut().find(|e| e.data_type == data_type)
    }

    fn carries(&self, data_type: DataType) -> bool {
        self.entries.iter().any(|e| e.data_type == data_type)
    }

    fn has_room(&self, max_entries: usize) -> bool {
        self.entries.len() < max_entries
    }

    fn render(&self) -> WireMessage {
        let mut items = Vec::with_capacity(self.entries.len() + 2);
        items.push(json!({ "ticket": self.id.as_str() }));
        items.extend(self.entries.iter().map(TicketEntry::render));
        items.push(json!({ "format": "DEFAULT" }));
        WireMessage(Value::Array(items).to_string())
    }

    fn snapshot(&self) -> TicketSnapshot {
        TicketSnapshot {
            id: self.id.clone(),
            entries: self
                .entries
                .iter()
                .map(|e| (e.data_type, e.symbols.clone()))
                .collect(),
        }
    }
}

// =============================================================================
// Ticket Pool
// =============================================================================

#[derive(Debug, Default)]
struct TicketPool {
    tickets: Vec<Ticket>,
    open: Option<TicketId>,
    clock: u64,
}

impl TicketPool {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn position(&self, id: &TicketId) -> Option<usize> {
        self.tickets.iter().position(|t| &t.id == id)
    }

    /// Pick the ticket that receives a new data type entry.
    fn placement(&mut self, limits: SubscriptionLimits) -> Result<usize, SubscriptionError> {
        if let Some(idx) = self.open.as_ref().and_then(|id| self.position(id)) {
            if self.tickets[idx].has_room(limits.max_entries_per_ticket) {
                return Ok(idx);
            }
            self.open = None;
        }

        if self.tickets.len() < limits.max_tickets {
            let now = self.tick();
            let ticket = Ticket::new(now);
            tracing::debug!(ticket = %ticket.id, "Allocated subscription ticket");
            self.open = Some(ticket.id.clone());
            self.tickets.push(ticket);
            return Ok(self.tickets.len() - 1);
        }

        self.tickets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.has_room(limits.max_entries_per_ticket))
            .min_by_key(|(_, t)| (t.entries.len(), t.last_used))
            .map(|(idx, _)| idx)
            .ok_or(SubscriptionError::LimitExceeded {
                max_tickets: limits.max_tickets,
            })
    }
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Owns the ticket pool.
#[derive(Debug)]
pub struct SubscriptionManager {
    limits: SubscriptionLimits,
    pool: Mutex<TicketPool>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(SubscriptionLimits::default())
    }
}

impl SubscriptionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(limits: SubscriptionLimits) -> Self {
        Self {
            limits,
            pool: Mutex::new(TicketPool::default()),
        }
    }

    /// Configured limits.
    #[must_use]
    pub const fn limits(&self) -> SubscriptionLimits {
        self.limits
    }

    /// Subscribe `symbols` for `data_type`.
    ///
    /// Symbols join an existing entry for the same data type if one exists;
    /// otherwise the entry goes to the open ticket, a new ticket, or the
    /// least used ticket with room, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::LimitExceeded`] if every ticket is full,
    /// or [`SubscriptionError::NoSymbols`] for an empty symbol list.
    pub fn subscribe(
        &self,
        data_type: DataType,
        symbols: &[String],
        params: SubscriptionParams,
    ) -> Result<TicketId, SubscriptionError> {
        if symbols.is_empty() {
            return Err(SubscriptionError::NoSymbols(data_type));
        }

        let mut pool = self.pool.lock();
        let now = pool.tick();

        let idx = match pool.tickets.iter().position(|t| t.carries(data_type)) {
            Some(idx) => idx,
            None => {
                let idx = pool.placement(self.limits)?;
                pool.tickets[idx]
                    .entries
                    .push(TicketEntry::new(data_type, SubscriptionParams::new()));
                idx
            }
        };

        let ticket = &mut pool.tickets[idx];
        ticket.last_used = now;
        if let Some(entry) = ticket.entry_mut(data_type) {
            entry.add(symbols, params);
        }

        tracing::debug!(
            ticket = %ticket.id,
            data_type = %data_type,
            symbols = symbols.len(),
            "Subscription merged into ticket"
        );
        Ok(ticket.id.clone())
    }

    /// Drop one reference to each of `symbols` for `data_type`.
    ///
    /// An entry with no symbols left is removed; a ticket with no entries
    /// left is retired.
    pub fn unsubscribe(&self, data_type: DataType, symbols: &[String]) -> UnsubscribeOutcome {
        let mut pool = self.pool.lock();
        let mut outcome = UnsubscribeOutcome::default();

        let Some(idx) = pool.tickets.iter().position(|t| t.carries(data_type)) else {
            return outcome;
        };

        let ticket = &mut pool.tickets[idx];
        let changed = ticket
            .entry_mut(data_type)
            .is_some_and(|entry| entry.remove(symbols));
        ticket
            .entries
            .retain(|e| e.data_type != data_type || !e.symbols.is_empty());

        if ticket.entries.is_empty() {
            let retired = pool.tickets.remove(idx);
            if pool.open.as_ref() == Some(&retired.id) {
                pool.open = None;
            }
            tracing::debug!(ticket = %retired.id, "Retired subscription ticket");
            outcome.retired.push(retired.id);
        } else if changed {
            outcome.updated.push(ticket.id.clone());
        }

        outcome
    }

    /// Close the open ticket so the next new data type starts a fresh one.
    pub fn rotate(&self) {
        self.pool.lock().open = None;
    }

    /// Wire message for one ticket.
    #[must_use]
    pub fn replay_message(&self, id: &TicketId) -> Option<WireMessage> {
        let pool = self.pool.lock();
        pool.position(id).map(|idx| pool.tickets[idx].render())
    }

    /// Wire messages for every live ticket, in creation order.
    #[must_use]
    pub fn all_replay_messages(&self) -> Vec<WireMessage> {
        self.pool.lock().tickets.iter().map(Ticket::render).collect()
    }

    /// Whether `symbol` is currently subscribed for `data_type`.
    #[must_use]
    pub fn is_subscribed(&self, data_type: DataType, symbol: &str) -> bool {
        self.pool.lock().tickets.iter().any(|t| {
            t.entries
                .iter()
                .any(|e| e.data_type == data_type && e.refcount.contains_key(symbol))
        })
    }

    /// Number of live tickets.
    #[must_use]
    pub fn ticket_count(&self) -> usize {
        self.pool.lock().tickets.len()
    }

    /// View of every live ticket.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TicketSnapshot> {
        self.pool.lock().tickets.iter().map(Ticket::snapshot).collect()
    }

    /// Pool statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let pool = self.pool.lock();
        SubscriptionStats {
            tickets: pool.tickets.len(),
            entries: pool.tickets.iter().map(|t| t.entries.len()).sum(),
            symbols: pool
                .tickets
                .iter()
                .flat_map(|t| t.entries.iter())
                .map(|e| e.symbols.len())
                .sum(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
