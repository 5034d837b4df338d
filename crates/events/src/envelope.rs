use serde::{Deserialize, Serialize};

use stockledger_core::StockCardId;

/// Envelope for an event appended to a stock-card stream.
///
/// This is the unit a store persists. Stock-card events and location movements
/// share one stream per card so that a single sequence covers both.
///
/// - **Append-only**: `sequence_number` is monotonically increasing per stream,
///   starting at 1, without gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    stock_card_id: StockCardId,

    /// Monotonically increasing position in the stock-card stream.
    sequence_number: u64,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(stock_card_id: StockCardId, sequence_number: u64, payload: E) -> Self {
        Self {
            stock_card_id,
            sequence_number,
            payload,
        }
    }

    pub fn stock_card_id(&self) -> StockCardId {
        self.stock_card_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
