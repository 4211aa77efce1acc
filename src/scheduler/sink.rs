//! Destinations for standing-query results

use std::sync::Arc;

use async_trait::async_trait;

use super::{ResultSink, StandingResult};
use crate::broker::{LogBroker, LogRecord};
use crate::error::Result;

/// Topic standing-query results are appended to
pub const RESULTS_TOPIC: &str = "standing-query-results";

/// Logs every result at `info` under the `standing_query` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl ResultSink for TracingSink {
    async fn deliver(&self, result: &StandingResult) -> Result<()> {
        let body = serde_json::to_string(result)?;
        tracing::info!(
            target: "standing_query",
            query_id = %result.query_id,
            issued_at_ms = result.issued_at_ms,
            ok = result.error.is_none(),
            result = %body,
            "Standing query issued"
        );
        Ok(())
    }
}

/// Appends every result to the log broker, keyed by query id
pub struct BrokerSink {
    broker: Arc<dyn LogBroker>,
}

impl BrokerSink {
    pub fn new(broker: Arc<dyn LogBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl ResultSink for BrokerSink {
    async fn deliver(&self, result: &StandingResult) -> Result<()> {
        let record = LogRecord {
            key: result.query_id.clone(),
            value: serde_json::to_string(result)?,
            headers: Default::default(),
        };
        self.broker.append(RESULTS_TOPIC, vec![record]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::query::QueryResult;
    use crate::range::KeyRange;

    #[tokio::test]
    async fn test_broker_sink_appends_json() {
        let broker = Arc::new(MemoryBroker::default());
        let sink = BrokerSink::new(broker.clone());
        let result = StandingResult {
            query_id: "q-1".into(),
            issued_at_ms: 42,
            result: Some(QueryResult::default()),
            error: None,
        };
        sink.deliver(&result).await.unwrap();
        TracingSink.deliver(&result).await.unwrap();

        let stored = broker.read(RESULTS_TOPIC, &KeyRange::full()).await.unwrap();
        assert_eq!(stored.len(), 1);
        let decoded: StandingResult = serde_json::from_str(&stored[0].value).unwrap();
        assert_eq!(decoded, result);
    }
}
