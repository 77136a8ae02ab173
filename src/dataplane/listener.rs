use super::flow::DataFlow;
use super::state::DataFlowState;
use crate::statemachine::{EntityState, Observable, StatefulEntity, TransitionCounter};

/// Observer of persisted data flow transitions
pub trait DataFlowListener: Send + Sync {
    fn received(&self, _flow: &DataFlow) {}

    fn started(&self, _flow: &DataFlow) {}

    fn completed(&self, _flow: &DataFlow) {}

    fn failed(&self, _flow: &DataFlow) {}

    fn terminated(&self, _flow: &DataFlow) {}

    fn transitioned(&self, _flow: &DataFlow, _previous: DataFlowState) {}
}

pub type DataFlowObservable = Observable<dyn DataFlowListener>;

pub fn notify(observable: &DataFlowObservable, flow: &DataFlow, previous: DataFlowState) {
    let state = flow.state();
    observable.invoke_for_each(|listener| {
        listener.transitioned(flow, previous);
        if state == previous {
            return;
        }
        match state {
            DataFlowState::Received => listener.received(flow),
            DataFlowState::Started => listener.started(flow),
            DataFlowState::Completed => listener.completed(flow),
            DataFlowState::Failed => listener.failed(flow),
            DataFlowState::Terminated => listener.terminated(flow),
            _ => {}
        }
    });
}

impl DataFlowListener for TransitionCounter {
    fn transitioned(&self, flow: &DataFlow, previous: DataFlowState) {
        if flow.state() != previous {
            self.record(DataFlow::KIND, flow.state().name());
        }
    }
}
