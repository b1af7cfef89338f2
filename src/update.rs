//! The common event emitted by every data source adapter.

use crate::lookup::EndpointKey;
use crate::rule_trace::RuleTracePoint;
use crate::types::{CounterType, Counters, Direction, Tuple};

#[derive(Debug, Clone, PartialEq)]
pub struct StatUpdate {
    pub tuple: Tuple,
    pub endpoint: EndpointKey,
    pub inbound: Counters,
    pub outbound: Counters,
    pub counter_type: CounterType,
    /// Direction the trace point (if any) belongs to.
    pub direction: Direction,
    pub point: Option<RuleTracePoint>,
    /// The connection has finished; the record is reported and removed
    /// instead of waiting to age out.
    pub finished: bool,
}

impl StatUpdate {
    pub fn new(
        tuple: Tuple,
        endpoint: EndpointKey,
        inbound: Counters,
        outbound: Counters,
        counter_type: CounterType,
        direction: Direction,
        point: Option<RuleTracePoint>,
    ) -> Self {
        StatUpdate {
            tuple,
            endpoint,
            inbound,
            outbound,
            counter_type,
            direction,
            point,
            finished: false,
        }
    }

    pub fn mark_finished(mut self) -> Self {
        self.finished = true;
        self
    }
}
