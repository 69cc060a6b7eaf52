//! Scripted [`InterfaceFactory`]/[`InterfaceHandle`] test doubles, in the
//! same spirit as [`crate::registry::fake::FakeRegistry`]: tests push
//! outcomes onto a queue, then drive [`crate::communicator::Communicator`]
//! against them without any real hardware. A queued [`FakeOutcome::Hang`]
//! blocks the calling thread until [`FakeInterface::cancel_all`] or
//! [`FakeInterface::cancel_endpoint`] is called, modeling an unresponsive
//! device for timeout/cancellation tests (`spec.md` §8, properties P6/P7).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::device::DeviceIdentity;
use crate::error::Error;

use super::{InterfaceFactory, InterfaceHandle, TransferRequest, TransferResult};

/// One scripted outcome for the next [`FakeInterface::transfer`] call.
pub enum FakeOutcome {
    /// Return this result (or error) immediately.
    Reply(Result<TransferResult, Error>),
    /// Block until cancelled, then return [`Error::Cancelled`].
    Hang,
}

struct State {
    queue: VecDeque<FakeOutcome>,
    cancel_all: bool,
    cancelled_endpoints: HashSet<u8>,
}

/// A single scripted opened interface.
pub struct FakeInterface {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Default for FakeInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInterface {
    /// A fresh interface with an empty script. Calling [`FakeInterface::transfer`]
    /// before pushing an outcome hangs, same as [`FakeOutcome::Hang`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                cancel_all: false,
                cancelled_endpoints: HashSet::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Queue a result to return from the next [`FakeInterface::transfer`] call.
    pub fn push_reply(&self, result: Result<TransferResult, Error>) {
        self.state.lock().unwrap().queue.push_back(FakeOutcome::Reply(result));
    }

    /// Queue a hang: the next `transfer` call blocks until cancelled.
    pub fn push_hang(&self) {
        self.state.lock().unwrap().queue.push_back(FakeOutcome::Hang);
    }
}

impl InterfaceHandle for FakeInterface {
    fn transfer(&self, request: &TransferRequest) -> Result<TransferResult, Error> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.queue.pop_front().unwrap_or(FakeOutcome::Hang)
        };
        match outcome {
            FakeOutcome::Reply(result) => result,
            FakeOutcome::Hang => {
                let mut state = self.state.lock().unwrap();
                while !state.cancel_all && !state.cancelled_endpoints.contains(&request.endpoint) {
                    state = self.condvar.wait(state).unwrap();
                }
                Err(Error::Cancelled)
            }
        }
    }

    fn cancel_all(&self) {
        self.state.lock().unwrap().cancel_all = true;
        self.condvar.notify_all();
    }

    fn cancel_endpoint(&self, endpoint: u8) {
        self.state.lock().unwrap().cancelled_endpoints.insert(endpoint);
        self.condvar.notify_all();
    }
}

/// Scripted [`InterfaceFactory`] that hands out (and remembers) one
/// [`FakeInterface`] per `(device, interface_number)` pair.
#[derive(Default)]
pub struct FakeInterfaceFactory {
    interfaces: Mutex<HashMap<(DeviceIdentity, u8), Arc<FakeInterface>>>,
    fail_next_open: Mutex<Option<Error>>,
}

impl FakeInterfaceFactory {
    /// A factory with no interfaces opened yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next [`FakeInterfaceFactory::open`] call fail with `error`,
    /// regardless of which device/interface is requested.
    pub fn fail_next_open(&self, error: Error) {
        *self.fail_next_open.lock().unwrap() = Some(error);
    }

    /// The scripted interface for `(device, interface_number)`, creating it
    /// (not-yet-opened) if it doesn't exist, so a test can script replies
    /// before the code under test calls `open`.
    pub fn interface_for(&self, device: &DeviceIdentity, interface_number: u8) -> Arc<FakeInterface> {
        self.interfaces
            .lock()
            .unwrap()
            .entry((device.clone(), interface_number))
            .or_insert_with(|| Arc::new(FakeInterface::new()))
            .clone()
    }
}

impl InterfaceFactory for FakeInterfaceFactory {
    fn open(
        &self,
        device: &DeviceIdentity,
        interface_number: u8,
    ) -> Result<Arc<dyn InterfaceHandle>, Error> {
        if let Some(err) = self.fail_next_open.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.interface_for(device, interface_number) as Arc<dyn InterfaceHandle>)
    }
}
