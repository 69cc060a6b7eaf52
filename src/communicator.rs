//! Interface Communicator (C5, `spec.md` §4.5).
//!
//! Owns the [`InterfaceTable`], opens/closes per-device interfaces through an
//! [`InterfaceFactory`], and executes the four transfer types against the
//! resulting [`InterfaceHandle`]s. Grounded in the teacher's `device.rs`
//! (`claim_interface`/`Interface` pairing one open handle per interface
//! number) and `transfer_internal.rs` (one in-flight-transfer bookkeeping
//! structure per endpoint), generalized from "one real OS interface type"
//! to "one capability trait, so this module is exercised entirely against
//! [`crate::transfer::fake::FakeInterfaceFactory`] in tests".
//!
//! Per-interface state is simply "present in the table or not": there is no
//! separate `Opening`/`Closing` state visible to callers, because
//! [`Communicator::open`] and [`Communicator::close`] both run to completion
//! under the table's single lock (`spec.md` §5's "per-component serial task
//! queue" collapsed into a `Mutex`, the same translation `Discovery` and
//! `DeviceMonitor` use for their own owned maps). A handle's `Drop`
//! (implemented by the production IOKit backend) performs the actual OS
//! close, guaranteeing release on every exit path per `spec.md` §3.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::claim::ClaimOracle;
use crate::device::DeviceIdentity;
use crate::error::Error;
use crate::transfer::{InterfaceFactory, InterfaceHandle, TransferKind, TransferRequest, TransferResult};

/// Multiplier applied to a request's `timeout_ms` for the watchdog upper
/// bound (`spec.md` §4.5, P7: "the handle must stop the transfer and return
/// `Timeout` within ~1.5x of `t_ms`").
const TIMEOUT_GRACE_FACTOR: f64 = 1.5;

type InterfaceRow = HashMap<u8, Arc<dyn InterfaceHandle>>;

/// Opens/closes per-device USB interfaces and multiplexes the four transfer
/// types against them (C5). Enforces [`ClaimOracle`] at the open and every
/// transfer boundary.
pub struct Communicator {
    factory: Arc<dyn InterfaceFactory>,
    claim_oracle: Arc<dyn ClaimOracle>,
    table: Mutex<HashMap<DeviceIdentity, InterfaceRow>>,
}

impl Communicator {
    /// Build a communicator with no interfaces open yet.
    pub fn new(factory: Arc<dyn InterfaceFactory>, claim_oracle: Arc<dyn ClaimOracle>) -> Self {
        Self {
            factory,
            claim_oracle,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Open `interface_number` on `device`. Idempotent: a second `open` of an
    /// already-open slot is a no-op success (P5). Requires the device be
    /// claimed; otherwise fails with [`Error::NotClaimed`] without touching
    /// the factory.
    pub fn open(&self, device: &DeviceIdentity, interface_number: u8) -> Result<(), Error> {
        if !self.claim_oracle.is_claimed(device) {
            return Err(Error::NotClaimed(device.key()));
        }
        let mut table = self.table.lock().unwrap();
        let row = table.entry(device.clone()).or_default();
        if row.contains_key(&interface_number) {
            return Ok(());
        }
        let handle = self.factory.open(device, interface_number)?;
        row.insert(interface_number, handle);
        Ok(())
    }

    /// Close `interface_number` on `device`, if open. Idempotent (P5). Prunes
    /// the device's row once it is empty, per the `InterfaceTable` invariant
    /// in `spec.md` §3.
    pub fn close(&self, device: &DeviceIdentity, interface_number: u8) {
        let mut table = self.table.lock().unwrap();
        if let Some(row) = table.get_mut(device) {
            row.remove(&interface_number);
            if row.is_empty() {
                table.remove(device);
            }
        }
    }

    /// Whether `interface_number` on `device` is currently open.
    pub fn is_open(&self, device: &DeviceIdentity, interface_number: u8) -> bool {
        self.table
            .lock()
            .unwrap()
            .get(device)
            .is_some_and(|row| row.contains_key(&interface_number))
    }

    /// Abort every in-flight transfer on `interface_number`. A no-op if the
    /// interface is closed (P6).
    pub fn cancel_all(&self, device: &DeviceIdentity, interface_number: u8) {
        if let Some(handle) = self.handle_for(device, interface_number) {
            handle.cancel_all();
        }
    }

    /// Abort every in-flight transfer on one endpoint of `interface_number`.
    /// A no-op if the interface is closed.
    pub fn cancel_endpoint(&self, device: &DeviceIdentity, interface_number: u8, endpoint: u8) {
        if let Some(handle) = self.handle_for(device, interface_number) {
            handle.cancel_endpoint(endpoint);
        }
    }

    /// Submit a control transfer. `request.kind` must be
    /// [`TransferKind::Control`].
    pub fn execute_control(
        &self,
        device: &DeviceIdentity,
        interface_number: u8,
        request: TransferRequest,
    ) -> Result<TransferResult, Error> {
        self.execute(device, interface_number, TransferKind::Control, request)
    }

    /// Submit a bulk transfer. `request.kind` must be [`TransferKind::Bulk`].
    pub fn execute_bulk(
        &self,
        device: &DeviceIdentity,
        interface_number: u8,
        request: TransferRequest,
    ) -> Result<TransferResult, Error> {
        self.execute(device, interface_number, TransferKind::Bulk, request)
    }

    /// Submit an interrupt transfer. `request.kind` must be
    /// [`TransferKind::Interrupt`].
    pub fn execute_interrupt(
        &self,
        device: &DeviceIdentity,
        interface_number: u8,
        request: TransferRequest,
    ) -> Result<TransferResult, Error> {
        self.execute(device, interface_number, TransferKind::Interrupt, request)
    }

    /// Submit an isochronous transfer. `request.kind` must be
    /// [`TransferKind::Isochronous`].
    pub fn execute_isochronous(
        &self,
        device: &DeviceIdentity,
        interface_number: u8,
        request: TransferRequest,
    ) -> Result<TransferResult, Error> {
        self.execute(device, interface_number, TransferKind::Isochronous, request)
    }

    fn handle_for(&self, device: &DeviceIdentity, interface_number: u8) -> Option<Arc<dyn InterfaceHandle>> {
        self.table
            .lock()
            .unwrap()
            .get(device)
            .and_then(|row| row.get(&interface_number))
            .cloned()
    }

    fn execute(
        &self,
        device: &DeviceIdentity,
        interface_number: u8,
        expected_kind: TransferKind,
        request: TransferRequest,
    ) -> Result<TransferResult, Error> {
        if !self.claim_oracle.is_claimed(device) {
            return Err(Error::NotClaimed(device.key()));
        }
        if request.kind != expected_kind {
            return Err(Error::TransferTypeUnsupported(request.kind.as_str().to_string()));
        }
        validate_request(&request)?;

        // `execute_*` only ever submits to a slot the caller already opened
        // (`spec.md` §9's "caller must pre-open" resolution of the source's
        // hard-coded-slot-0 ambiguity): this crate reuses `InvalidParameters`
        // for "not open" rather than adding a taxonomy member, since §3's
        // error set is closed.
        let handle = self
            .handle_for(device, interface_number)
            .ok_or(Error::InvalidParameters)?;

        run_with_watchdog(handle, request)
    }
}

/// Submit `request` on a worker thread and wait up to `1.5 * timeout_ms` for
/// it to complete (P7). If the handle hasn't replied by then, cancel the
/// specific endpoint and report [`Error::Timeout`] — this is the
/// Rust-idiomatic stand-in for a cooperative-cancellation timeout watchdog,
/// since unlike the IOKit backend's own `ReadPipeTO`/`WritePipeTO`, a scripted
/// [`crate::transfer::fake::FakeInterface`] has no OS timer of its own.
///
/// `spec.md` §7 restricts automatic retry-on-timeout to enumeration and
/// handle-creation paths; a submitted transfer's timeout is always surfaced
/// to the caller, never retried here.
fn run_with_watchdog(
    handle: Arc<dyn InterfaceHandle>,
    request: TransferRequest,
) -> Result<TransferResult, Error> {
    let watchdog = Duration::from_millis((request.timeout_ms as f64 * TIMEOUT_GRACE_FACTOR) as u64);
    let endpoint = request.endpoint;
    let (tx, rx) = mpsc::channel();
    let worker_handle = handle.clone();
    std::thread::spawn(move || {
        let result = worker_handle.transfer(&request);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(watchdog) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            handle.cancel_endpoint(endpoint);
            log::warn!("transfer on endpoint {endpoint:#04x} exceeded {watchdog:?}; cancelling");
            Err(Error::Timeout)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::TransferFailed),
    }
}

/// Request validation shared by all four `execute_*` entry points
/// (`spec.md` §4.5).
fn validate_request(request: &TransferRequest) -> Result<(), Error> {
    if request.timeout_ms == 0 || request.timeout_ms > 60_000 {
        return Err(Error::InvalidTimeout(request.timeout_ms));
    }
    match request.kind {
        TransferKind::Control => {
            if request.setup_packet.is_none() {
                return Err(Error::InvalidSetupPacket);
            }
        }
        TransferKind::Bulk | TransferKind::Interrupt => {
            if transfer_length(request) == 0 {
                return Err(Error::InvalidParameters);
            }
        }
        TransferKind::Isochronous => {
            if transfer_length(request) == 0
                || request.number_of_packets == 0
                || request.number_of_packets > 1024
            {
                return Err(Error::InvalidParameters);
            }
        }
    }
    Ok(())
}

fn transfer_length(request: &TransferRequest) -> usize {
    request
        .out_data
        .as_ref()
        .map(|d| d.len())
        .unwrap_or(request.read_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::StaticClaimOracle;
    use crate::transfer::fake::FakeInterfaceFactory;
    use crate::transfer::TransferStatus;

    fn device() -> DeviceIdentity {
        DeviceIdentity::new("20", "16")
    }

    fn bulk_request(endpoint: u8, timeout_ms: u32) -> TransferRequest {
        TransferRequest {
            kind: TransferKind::Bulk,
            endpoint,
            timeout_ms,
            setup_packet: None,
            out_data: None,
            read_length: 64,
            number_of_packets: 0,
        }
    }

    fn control_request(timeout_ms: u32, setup_packet: Option<[u8; 8]>) -> TransferRequest {
        TransferRequest {
            kind: TransferKind::Control,
            endpoint: 0,
            timeout_ms,
            setup_packet,
            out_data: None,
            read_length: 0,
            number_of_packets: 0,
        }
    }

    fn comm_claiming(device: &DeviceIdentity) -> (Communicator, Arc<FakeInterfaceFactory>) {
        let factory = Arc::new(FakeInterfaceFactory::new());
        let oracle = Arc::new(StaticClaimOracle::claiming([device.clone()]));
        (Communicator::new(factory.clone(), oracle), factory)
    }

    #[test]
    fn unclaimed_open_fails_without_touching_factory() {
        let factory = Arc::new(FakeInterfaceFactory::new());
        let oracle = Arc::new(StaticClaimOracle::none());
        let comm = Communicator::new(factory, oracle);
        let err = comm.open(&device(), 0).unwrap_err();
        assert!(matches!(err, Error::NotClaimed(id) if id == "20:16"));
        assert!(!comm.is_open(&device(), 0));
    }

    #[test]
    fn unclaimed_transfer_does_not_touch_interface_factory() {
        // scenario 4, `spec.md` §8
        let (comm, factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        // Claim is revoked between open and transfer.
        let oracle = Arc::new(StaticClaimOracle::none());
        let comm = Communicator::new(factory.clone(), oracle);
        let err = comm
            .execute_bulk(&device(), 0, bulk_request(0x81, 1000))
            .unwrap_err();
        assert!(matches!(err, Error::NotClaimed(_)));
    }

    #[test]
    fn open_then_open_is_idempotent() {
        // P5
        let (comm, _factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        comm.open(&device(), 0).unwrap();
        assert!(comm.is_open(&device(), 0));
    }

    #[test]
    fn close_then_close_is_idempotent() {
        // P5
        let (comm, _factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        comm.close(&device(), 0);
        comm.close(&device(), 0);
        assert!(!comm.is_open(&device(), 0));
    }

    #[test]
    fn transfer_on_unopened_interface_is_invalid_parameters() {
        let (comm, _factory) = comm_claiming(&device());
        let err = comm
            .execute_bulk(&device(), 0, bulk_request(0x81, 1000))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameters));
    }

    #[test]
    fn mismatched_transfer_kind_is_rejected() {
        let (comm, _factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        let request = control_request(1000, Some([0u8; 8]));
        let err = comm.execute_bulk(&device(), 0, request).unwrap_err();
        assert!(matches!(err, Error::TransferTypeUnsupported(kind) if kind == "control"));
    }

    #[test]
    fn control_without_setup_packet_is_rejected() {
        let (comm, _factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        let err = comm
            .execute_control(&device(), 0, control_request(1000, None))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSetupPacket));
    }

    #[test]
    fn bulk_with_zero_length_is_rejected() {
        let (comm, _factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        let mut request = bulk_request(0x81, 1000);
        request.read_length = 0;
        let err = comm.execute_bulk(&device(), 0, request).unwrap_err();
        assert!(matches!(err, Error::InvalidParameters));
    }

    #[test]
    fn isochronous_requires_packet_count_in_range() {
        let (comm, _factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        let mut request = bulk_request(0x81, 1000);
        request.kind = TransferKind::Isochronous;
        request.number_of_packets = 0;
        let err = comm.execute_isochronous(&device(), 0, request.clone()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameters));

        let mut over = request.clone();
        over.number_of_packets = 1025;
        let err = comm.execute_isochronous(&device(), 0, over).unwrap_err();
        assert!(matches!(err, Error::InvalidParameters));
    }

    #[test]
    fn timeout_out_of_range_is_rejected() {
        let (comm, _factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        let err = comm
            .execute_bulk(&device(), 0, bulk_request(0x81, 0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTimeout(0)));

        let err = comm
            .execute_bulk(&device(), 0, bulk_request(0x81, 60_001))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTimeout(60_001)));
    }

    #[test]
    fn successful_transfer_returns_result() {
        let (comm, factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        let iface = factory.interface_for(&device(), 0);
        iface.push_reply(Ok(TransferResult {
            status: TransferStatus::Completed,
            bytes_transferred: 64,
            data: Some(vec![0u8; 64]),
            iso_packet_results: None,
        }));
        let result = comm
            .execute_bulk(&device(), 0, bulk_request(0x81, 1000))
            .unwrap();
        assert_eq!(result.bytes_transferred, 64);
    }

    #[test]
    fn timeout_completes_within_grace_factor() {
        // P7
        let (comm, factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        let iface = factory.interface_for(&device(), 0);
        iface.push_hang();

        let start = std::time::Instant::now();
        let err = comm
            .execute_bulk(&device(), 0, bulk_request(0x81, 100))
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, Error::Timeout));
        assert!(elapsed <= Duration::from_millis(170), "elapsed={elapsed:?}");
    }

    #[test]
    fn cancel_all_unblocks_hung_transfers_with_cancelled() {
        // P6
        let (comm, factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        let iface = factory.interface_for(&device(), 0);
        iface.push_hang();

        let comm = Arc::new(comm);
        let worker = {
            let comm = comm.clone();
            std::thread::spawn(move || comm.execute_bulk(&device(), 0, bulk_request(0x81, 60_000)))
        };
        std::thread::sleep(Duration::from_millis(30));
        comm.cancel_all(&device(), 0);
        let result = worker.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn cancel_endpoint_is_a_no_op_on_closed_interface() {
        let (comm, _factory) = comm_claiming(&device());
        // Never opened; must not panic.
        comm.cancel_all(&device(), 0);
        comm.cancel_endpoint(&device(), 0, 0x81);
    }

    #[test]
    fn close_prunes_empty_device_row() {
        let (comm, _factory) = comm_claiming(&device());
        comm.open(&device(), 0).unwrap();
        comm.close(&device(), 0);
        assert!(comm.table.lock().unwrap().get(&device()).is_none());
    }
}
