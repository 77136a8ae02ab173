use super::process::TransferProcess;
use super::state::TransferProcessState;
use crate::statemachine::{EntityState, Observable, StatefulEntity, TransitionCounter};

/// Observer of persisted transfer process transitions; every method defaults to a no-op
pub trait TransferProcessListener: Send + Sync {
    fn initiated(&self, _process: &TransferProcess) {}

    fn provisioned(&self, _process: &TransferProcess) {}

    fn requested(&self, _process: &TransferProcess) {}

    fn started(&self, _process: &TransferProcess) {}

    fn suspended(&self, _process: &TransferProcess) {}

    fn completed(&self, _process: &TransferProcess) {}

    fn terminated(&self, _process: &TransferProcess) {}

    fn deprovisioned(&self, _process: &TransferProcess) {}

    /// Any persisted state change, including same-state retries
    fn transitioned(&self, _process: &TransferProcess, _previous: TransferProcessState) {}
}

pub type TransferProcessObservable = Observable<dyn TransferProcessListener>;

/// Fan a persisted change out to the listeners
pub fn notify(
    observable: &TransferProcessObservable,
    process: &TransferProcess,
    previous: TransferProcessState,
) {
    let state = process.state();
    observable.invoke_for_each(|listener| {
        listener.transitioned(process, previous);
        if state == previous {
            return;
        }
        match state {
            TransferProcessState::Provisioned => listener.provisioned(process),
            TransferProcessState::Requested => listener.requested(process),
            TransferProcessState::Started => listener.started(process),
            TransferProcessState::Suspended => listener.suspended(process),
            TransferProcessState::Completed => listener.completed(process),
            TransferProcessState::Terminated => listener.terminated(process),
            TransferProcessState::Deprovisioned => listener.deprovisioned(process),
            _ => {}
        }
    });
}

impl TransferProcessListener for TransitionCounter {
    fn transitioned(&self, process: &TransferProcess, previous: TransferProcessState) {
        if process.state() != previous {
            self.record(TransferProcess::KIND, process.state().name());
        }
    }
}
