//! In-memory [`ClusterApi`] used by the unit tests.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

use super::{ClusterApi, Error, ManagedObject, ObjectKey, ObjectKind, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Apply,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub op: Op,
    pub key: ObjectKey,
}

struct Fault {
    kind: ObjectKind,
    op: Op,
    remaining: u32,
    code: u16,
}

/// Pauses the first matching operation until [`Gate::open`] is called.
#[derive(Clone, Default)]
pub struct Gate {
    reached: Arc<Notify>,
    resume: Arc<Notify>,
}

impl Gate {
    pub async fn reached(&self) {
        self.reached.notified().await
    }

    pub fn open(&self) {
        self.resume.notify_one()
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, ManagedObject>,
    writes: Vec<Write>,
    faults: Vec<Fault>,
    gate: Option<(ObjectKind, Op, Gate)>,
    forbid_list: bool,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

fn matches_selector(object: &ManagedObject, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => object.label(key) == Some(value),
            None => object.label(term).is_some(),
        })
}

impl MemoryCluster {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Fails the next `times` operations of `op` on objects of `kind` with HTTP `code`.
    pub fn fail(&self, kind: ObjectKind, op: Op, code: u16, times: u32) {
        self.state().faults.push(Fault {
            kind,
            op,
            remaining: times,
            code,
        });
    }

    pub fn forbid_list(&self) {
        self.state().forbid_list = true;
    }

    pub fn gate(&self, kind: ObjectKind) -> Gate {
        self.gate_op(kind, Op::Apply)
    }

    pub fn gate_delete(&self, kind: ObjectKind) -> Gate {
        self.gate_op(kind, Op::Delete)
    }

    fn gate_op(&self, kind: ObjectKind, op: Op) -> Gate {
        let gate = Gate::default();
        self.state().gate = Some((kind, op, gate.clone()));
        gate
    }

    pub fn insert(&self, object: ManagedObject) {
        self.state().objects.insert(object.key(), object);
    }

    pub fn get(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.state().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<ManagedObject> {
        self.state().objects.values().cloned().collect()
    }

    pub fn labelled(&self, selector: &str) -> Vec<ObjectKey> {
        self.state()
            .objects
            .values()
            .filter(|object| matches_selector(object, selector))
            .map(ManagedObject::key)
            .collect()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    fn injected_fault(&self, kind: ObjectKind, op: Op) -> Option<Error> {
        let mut state = self.state();
        let fault = state
            .faults
            .iter_mut()
            .find(|fault| fault.kind == kind && fault.op == op && fault.remaining > 0)?;
        fault.remaining -= 1;
        Some(Error::Rejected {
            code: fault.code,
            reason: "Injected".to_string(),
            message: format!("injected failure for {op:?} on {kind}"),
        })
    }

    async fn pass_gate(&self, kind: ObjectKind, op: Op) {
        let gate = {
            let mut state = self.state();
            match &state.gate {
                Some((gated, gated_op, _)) if *gated == kind && *gated_op == op => {
                    state.gate.take().map(|(_, _, gate)| gate)
                }
                _ => None,
            }
        };
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.resume.notified().await;
        }
    }
}

impl ClusterApi for MemoryCluster {
    async fn list(&self, kind: ObjectKind, label_selector: &str) -> Result<Vec<ManagedObject>> {
        if self.state().forbid_list {
            return Err(Error::Rejected {
                code: 403,
                reason: "Forbidden".to_string(),
                message: "serviceaccounts is forbidden".to_string(),
            });
        }
        Ok(self
            .state()
            .objects
            .values()
            .filter(|object| object.kind() == kind && matches_selector(object, label_selector))
            .cloned()
            .collect())
    }

    async fn apply(&self, object: &ManagedObject) -> Result<()> {
        self.pass_gate(object.kind(), Op::Apply).await;
        if let Some(error) = self.injected_fault(object.kind(), Op::Apply) {
            return Err(error);
        }
        let mut state = self.state();
        state.writes.push(Write {
            op: Op::Apply,
            key: object.key(),
        });
        state.objects.insert(object.key(), object.clone());
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.pass_gate(key.kind, Op::Delete).await;
        if let Some(error) = self.injected_fault(key.kind, Op::Delete) {
            return Err(error);
        }
        let mut state = self.state();
        state.writes.push(Write {
            op: Op::Delete,
            key: key.clone(),
        });
        state.objects.remove(key);
        Ok(())
    }
}
