use signal_core::{SignalProduced, SignalSink};
use tokio::sync::broadcast;
use tracing::info;

/// Fan-out of produced signals to in-process subscribers (API push, notifiers).
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SignalProduced>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalProduced> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<SignalProduced> {
        self.tx.clone()
    }
}

impl SignalSink for BroadcastSink {
    fn emit(&self, event: &SignalProduced) {
        // No subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

/// Writes every produced signal to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl SignalSink for LogSink {
    fn emit(&self, event: &SignalProduced) {
        info!(
            news_id = %event.news_id,
            status = %event.status,
            decision = event.trade_decision.map(|d| d.as_str()).unwrap_or("-"),
            importance = event.importance_score.unwrap_or(0),
            actionable = event.actionable,
            total_cost = %event.total_cost,
            "Signal produced"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use signal_core::{AnalysisStatus, TradeDecision};

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();

        let event = SignalProduced {
            news_id: "n:1".to_string(),
            status: AnalysisStatus::Completed,
            trade_decision: Some(TradeDecision::Buy),
            importance_score: Some(8),
            signal_blocked: false,
            actionable: true,
            total_cost: Decimal::new(12, 4),
            produced_at: Utc::now(),
        };
        sink.emit(&event);
        LogSink.emit(&event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let sink = BroadcastSink::new(1);
        sink.emit(&SignalProduced {
            news_id: "n:2".to_string(),
            status: AnalysisStatus::Rejected,
            trade_decision: None,
            importance_score: None,
            signal_blocked: false,
            actionable: false,
            total_cost: Decimal::ZERO,
            produced_at: Utc::now(),
        });
    }
}
