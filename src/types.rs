// =============================================================================
// Shared types used across the signal-relay pipeline
// =============================================================================
//
// The Signal model deliberately keeps `side` and `action` as they arrived on
// the wire: classification derives intent from BOTH fields every time it is
// needed, with `action` values expressing exit intent taking precedence over
// `side`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Received,
    Approved,
    Rejected,
    ForwardedOk,
    ForwardedErr,
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Received => write!(f, "RECEIVED"),
            Self::Approved => write!(f, "APPROVED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::ForwardedOk => write!(f, "FORWARDED_OK"),
            Self::ForwardedErr => write!(f, "FORWARDED_ERR"),
        }
    }
}

impl std::str::FromStr for SignalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RECEIVED" => Ok(Self::Received),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "FORWARDED_OK" => Ok(Self::ForwardedOk),
            "FORWARDED_ERR" => Ok(Self::ForwardedErr),
            other => Err(format!("unknown signal status '{other}'")),
        }
    }
}

/// Classified kind of a signal, assigned at ingress (or synthesized by the
/// admin surface for manual operations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Buy,
    Sell,
    ManualSell,
    SellAll,
    PositionClose,
}

impl SignalType {
    /// SELL-family types drive the position-closing path.
    pub fn is_sell_family(&self) -> bool {
        !matches!(self, Self::Buy)
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::ManualSell => write!(f, "MANUAL_SELL"),
            Self::SellAll => write!(f, "SELL_ALL"),
            Self::PositionClose => write!(f, "POSITION_CLOSE"),
        }
    }
}

impl std::str::FromStr for SignalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            "MANUAL_SELL" => Ok(Self::ManualSell),
            "SELL_ALL" => Ok(Self::SellAll),
            "POSITION_CLOSE" => Ok(Self::PositionClose),
            other => Err(format!("unknown signal type '{other}'")),
        }
    }
}

/// Direction of intent derived from a signal's `side` and `action` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Buy,
    SellFamily,
}

/// Derive BUY vs SELL-family intent from both wire fields.
///
/// `action` values that express exit intent (`sell`, `exit`, `close`) win
/// over whatever `side` says; a bare `side = sell` is also SELL-family.
/// Everything else (including missing fields) is a BUY.
pub fn classify_intent(side: Option<&str>, action: Option<&str>) -> Intent {
    if let Some(action) = action {
        match action.trim().to_ascii_lowercase().as_str() {
            "sell" | "exit" | "close" => return Intent::SellFamily,
            _ => {}
        }
    }
    if let Some(side) = side {
        if side.trim().eq_ignore_ascii_case("sell") {
            return Intent::SellFamily;
        }
    }
    Intent::Buy
}

/// A normalized inbound trading signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: Uuid,
    /// Uppercase ticker symbol.
    pub ticker: String,
    /// `side` as received (`buy` / `sell` / absent).
    pub side: Option<String>,
    /// `action` as received (`buy` / `sell` / `exit` / `close` / ...).
    pub action: Option<String>,
    pub price: Option<f64>,
    pub received_at: DateTime<Utc>,
    /// The exact payload as received; never mutated after ingress.
    pub original_payload: serde_json::Value,
}

impl Signal {
    /// Build a signal from normalized ingress fields, minting a fresh id.
    pub fn new(
        ticker: String,
        side: Option<String>,
        action: Option<String>,
        price: Option<f64>,
        received_at: DateTime<Utc>,
        original_payload: serde_json::Value,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4(),
            ticker,
            side,
            action,
            price,
            received_at,
            original_payload,
        }
    }

    /// Intent of this signal, from both `side` and `action`.
    pub fn intent(&self) -> Intent {
        classify_intent(self.side.as_deref(), self.action.as_deref())
    }

    /// The signal type a fresh ingress submission of this signal gets.
    pub fn ingress_signal_type(&self) -> SignalType {
        match self.intent() {
            Intent::Buy => SignalType::Buy,
            Intent::SellFamily => SignalType::Sell,
        }
    }
}

/// An item travelling through the InQueue towards the decision workers.
#[derive(Debug, Clone)]
pub struct QueuedSignal {
    pub signal: Signal,
    pub signal_type: SignalType,
    /// Number of transient-store requeues so far.
    pub retry_count: u32,
}

/// An admitted signal awaiting forwarding.
#[derive(Debug, Clone)]
pub struct ApprovedSignal {
    pub signal: Signal,
    pub signal_type: SignalType,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_plain_buy() {
        assert_eq!(classify_intent(Some("buy"), None), Intent::Buy);
        assert_eq!(classify_intent(Some("buy"), Some("buy")), Intent::Buy);
        assert_eq!(classify_intent(None, Some("enter")), Intent::Buy);
        assert_eq!(classify_intent(None, Some("long")), Intent::Buy);
        assert_eq!(classify_intent(None, None), Intent::Buy);
    }

    #[test]
    fn classify_plain_sell() {
        assert_eq!(classify_intent(Some("sell"), None), Intent::SellFamily);
        assert_eq!(classify_intent(None, Some("sell")), Intent::SellFamily);
        assert_eq!(classify_intent(None, Some("exit")), Intent::SellFamily);
        assert_eq!(classify_intent(None, Some("close")), Intent::SellFamily);
    }

    #[test]
    fn exit_action_without_side_is_sell_family() {
        // A bare `action=exit` must classify as SELL-family even though no
        // `side` was supplied.
        assert_eq!(classify_intent(None, Some("exit")), Intent::SellFamily);
    }

    #[test]
    fn exit_action_wins_over_buy_side() {
        assert_eq!(classify_intent(Some("buy"), Some("exit")), Intent::SellFamily);
        assert_eq!(classify_intent(Some("buy"), Some("close")), Intent::SellFamily);
        assert_eq!(classify_intent(Some("buy"), Some("sell")), Intent::SellFamily);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify_intent(Some("SELL"), None), Intent::SellFamily);
        assert_eq!(classify_intent(None, Some("Exit")), Intent::SellFamily);
        assert_eq!(classify_intent(Some("BUY"), Some("ENTER")), Intent::Buy);
    }

    #[test]
    fn status_and_type_render_wire_names() {
        assert_eq!(SignalStatus::ForwardedOk.to_string(), "FORWARDED_OK");
        assert_eq!(SignalType::PositionClose.to_string(), "POSITION_CLOSE");
        assert_eq!(
            "forwarded_err".parse::<SignalStatus>().unwrap(),
            SignalStatus::ForwardedErr
        );
        assert_eq!("SELL_ALL".parse::<SignalType>().unwrap(), SignalType::SellAll);
    }

    #[test]
    fn sell_family_membership() {
        assert!(!SignalType::Buy.is_sell_family());
        assert!(SignalType::Sell.is_sell_family());
        assert!(SignalType::SellAll.is_sell_family());
        assert!(SignalType::PositionClose.is_sell_family());
    }
}
