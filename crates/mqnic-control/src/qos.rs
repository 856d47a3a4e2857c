//! QoS control surface
//!
//! Accepts per-flow rate requests from an external agent. Rates are
//! recorded for the shaper to read; the control plane does not enforce
//! them. A request naming a queue also pins the flow there.

use crate::failover::FailoverController;
use dashmap::DashMap;
use mqnic_common::{FlowId, NicResult, QueueId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// One agent request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosRequest {
    pub flow_id: FlowId,
    #[serde(alias = "rate")]
    pub rate_kbit: u64,
    #[serde(default)]
    pub queue: Option<QueueId>,
}

impl QosRequest {
    /// Parse one JSON line, e.g. `{"flow_id":7,"rate":1000}`
    pub fn parse(line: &str) -> NicResult<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Recorded rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    pub flow_id: FlowId,
    pub rate_kbit: u64,
}

/// Result of applying a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosOutcome {
    pub limit: RateLimit,
    /// Previous owner when the flow was moved
    pub moved_from: Option<QueueId>,
}

pub struct QosControl {
    failover: Arc<FailoverController>,
    limits: DashMap<FlowId, RateLimit>,
}

impl QosControl {
    pub fn new(failover: Arc<FailoverController>) -> Self {
        Self {
            failover,
            limits: DashMap::new(),
        }
    }

    /// Record the rate and, if a queue is named, move the flow there.
    ///
    /// The rate is kept even when placement fails.
    pub fn apply(&self, request: QosRequest) -> NicResult<QosOutcome> {
        let limit = RateLimit {
            flow_id: request.flow_id,
            rate_kbit: request.rate_kbit,
        };
        self.limits.insert(request.flow_id, limit);
        debug!(flow = request.flow_id, rate_kbit = request.rate_kbit, "Rate limit recorded");

        let moved_from = match request.queue {
            Some(queue) => self.failover.reassign_single_flow(request.flow_id, queue)?,
            None => None,
        };
        if let (Some(from), Some(to)) = (moved_from, request.queue) {
            info!(flow = request.flow_id, from = from, to = to, "Flow placed by QoS request");
        }

        Ok(QosOutcome { limit, moved_from })
    }

    /// Parse and apply one agent line
    pub fn apply_line(&self, line: &str) -> NicResult<QosOutcome> {
        self.apply(QosRequest::parse(line)?)
    }

    pub fn limit(&self, flow_id: FlowId) -> Option<RateLimit> {
        self.limits.get(&flow_id).map(|l| *l)
    }

    /// Forget a flow's limit
    pub fn clear(&self, flow_id: FlowId) -> Option<RateLimit> {
        self.limits.remove(&flow_id).map(|(_, l)| l)
    }

    /// All limits, ascending by flow id
    pub fn limits(&self) -> Vec<RateLimit> {
        let mut out: Vec<RateLimit> = self.limits.iter().map(|l| *l).collect();
        out.sort_by_key(|l| l.flow_id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverConfig;
    use crate::registry::QueueRegistry;
    use mqnic_common::{ManualClock, NicError};

    fn setup() -> (Arc<QueueRegistry>, QosControl) {
        let registry = Arc::new(QueueRegistry::new(4, 64, Arc::new(ManualClock::new(0))));
        for id in 0..4 {
            registry.register_queue(id, 0).unwrap();
        }
        let failover = Arc::new(FailoverController::new(registry.clone(), FailoverConfig::default()));
        (registry, QosControl::new(failover))
    }

    #[test]
    fn test_parse_agent_line() {
        let req = QosRequest::parse("{\"flow_id\":7,\"rate\":1000}\n").unwrap();
        assert_eq!(req.flow_id, 7);
        assert_eq!(req.rate_kbit, 1000);
        assert_eq!(req.queue, None);

        let req = QosRequest::parse(r#"{"flow_id":7,"rate_kbit":5,"queue":2}"#).unwrap();
        assert_eq!(req.queue, Some(2));

        assert!(matches!(QosRequest::parse("flow 7"), Err(NicError::Json(_))));
    }

    #[test]
    fn test_apply_records_rate() {
        let (_, qos) = setup();
        let out = qos.apply_line(r#"{"flow_id":3,"rate":250}"#).unwrap();
        assert_eq!(out.moved_from, None);
        assert_eq!(qos.limit(3).unwrap().rate_kbit, 250);

        qos.apply_line(r#"{"flow_id":3,"rate":500}"#).unwrap();
        assert_eq!(qos.limits().len(), 1);
        assert_eq!(qos.limit(3).unwrap().rate_kbit, 500);

        assert_eq!(qos.clear(3).unwrap().rate_kbit, 500);
        assert_eq!(qos.clear(3), None);
    }

    #[test]
    fn test_apply_places_flow() {
        let (registry, qos) = setup();
        registry.record_tx(0, 9, 64).unwrap();

        let out = qos
            .apply(QosRequest {
                flow_id: 9,
                rate_kbit: 100,
                queue: Some(3),
            })
            .unwrap();
        assert_eq!(out.moved_from, Some(0));
        assert_eq!(registry.flow_owner(9), Some(3));

        // Already there
        let out = qos
            .apply(QosRequest {
                flow_id: 9,
                rate_kbit: 100,
                queue: Some(3),
            })
            .unwrap();
        assert_eq!(out.moved_from, None);
    }

    #[test]
    fn test_unknown_flow_keeps_rate() {
        let (_, qos) = setup();
        let err = qos
            .apply(QosRequest {
                flow_id: 42,
                rate_kbit: 10,
                queue: Some(1),
            })
            .unwrap_err();
        assert!(matches!(err, NicError::FlowNotFound { flow_id: 42, .. }));
        assert!(qos.limit(42).is_some());
    }
}
