// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exchange segment, serialized with the broker's segment codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Segment {
    #[serde(rename = "IDX_I")]
    Index,
    #[serde(rename = "NSE_EQ")]
    NseEq,
    #[serde(rename = "NSE_FNO")]
    NseFno,
    #[serde(rename = "BSE_FNO")]
    BseFno,
    #[serde(rename = "MCX_COMM")]
    McxComm,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Index => "IDX_I",
            Segment::NseEq => "NSE_EQ",
            Segment::NseFno => "NSE_FNO",
            Segment::BseFno => "BSE_FNO",
            Segment::McxComm => "MCX_COMM",
        }
    }
}

/// (segment, security_id): identity of one tradable instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub segment: Segment,
    pub security_id: String,
}

impl InstrumentKey {
    pub fn new(segment: Segment, security_id: impl Into<String>) -> Self {
        Self { segment, security_id: security_id.into() }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment.as_str(), self.security_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub segment: Segment,
    pub security_id: String,
    pub ltp: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn key(&self) -> InstrumentKey {
        InstrumentKey::new(self.segment, self.security_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side { Buy, Sell }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType { Intraday, Margin, Cnc }

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Intraday => "INTRADAY",
            ProductType::Margin => "MARGIN",
            ProductType::Cnc => "CNC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Reserved locally, not yet acknowledged by the broker.
    Pending,
    Transit,
    Open,
    PartiallyFilled,
    Traded,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Traded | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Transit => "transit",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Traded => "traded",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        }
    }
}

/// Locally authoritative view of one order. `client_ref` is the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub client_ref: String,
    pub broker_order_id: Option<String>,
    pub status: OrderStatus,
    pub segment: Segment,
    pub security_id: String,
    pub trading_symbol: String,
    pub side: Side,
    pub product_type: ProductType,
    pub quantity: i64,
    pub filled_qty: i64,
    pub remaining_qty: i64,
    pub entry_price: f64,
    pub target_price: f64,
    pub stop_loss_price: f64,
    pub trailing_jump: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn position_key(&self) -> PositionKey {
        PositionKey {
            segment: self.segment,
            security_id: self.security_id.clone(),
            product_type: self.product_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub segment: Segment,
    pub security_id: String,
    pub product_type: ProductType,
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.segment.as_str(), self.security_id, self.product_type.as_str())
    }
}

// Inventory per (segment, security_id, product_type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub segment: Segment,
    pub security_id: String,
    pub product_type: ProductType,
    pub trading_symbol: String,
    pub net_qty: i64,
    pub buy_qty: i64,
    pub sell_qty: i64,
    pub buy_avg: f64,
    pub sell_avg: f64,
    pub realized: f64,
    pub unrealized: f64,
    pub external_flag: bool,
    pub updated_at: DateTime<Utc>,
}

impl PositionRecord {
    pub fn empty(key: &PositionKey, trading_symbol: &str) -> Self {
        Self {
            segment: key.segment,
            security_id: key.security_id.clone(),
            product_type: key.product_type,
            trading_symbol: trading_symbol.to_string(),
            net_qty: 0,
            buy_qty: 0,
            sell_qty: 0,
            buy_avg: 0.0,
            sell_avg: 0.0,
            realized: 0.0,
            unrealized: 0.0,
            external_flag: false,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey {
            segment: self.segment,
            security_id: self.security_id.clone(),
            product_type: self.product_type,
        }
    }

    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(self.segment, self.security_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind { OrderUpsert, OrderDelete, PositionUpsert, PositionDelete }

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderUpsert => "order_upsert",
            EventKind::OrderDelete => "order_delete",
            EventKind::PositionUpsert => "position_upsert",
            EventKind::PositionDelete => "position_delete",
        }
    }
}

/// One line of the event log: `{"ts": .., "type": .., "data": ..}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDeleteData { pub client_ref: String }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bias { Long, Short, Neutral }

/// Output of a strategy collaborator for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: InstrumentKey,
    pub bias: Bias,
    pub confidence: f64,
    pub source: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action { Enter }

/// Transient value flowing Policy → Sizer → Risk Guard → Executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub instrument: InstrumentKey,
    pub symbol: String,
    pub direction: Bias,
    pub action: Action,
    pub risk_per_unit: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: i64,
    pub metadata: BTreeMap<String, String>,
}

impl Decision {
    pub fn side(&self) -> Side {
        match self.direction {
            Bias::Short => Side::Sell,
            _ => Side::Buy,
        }
    }

    /// Short label used inside client references.
    pub fn kind_label(&self) -> &'static str {
        match self.direction {
            Bias::Long => "LONG",
            Bias::Short => "SHORT",
            Bias::Neutral => "FLAT",
        }
    }
}
