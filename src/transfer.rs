//! Transfer types and the `InterfaceFactory`/`InterfaceHandle` capability
//! traits used by the Interface Communicator (C5, `spec.md` §4.5).
//!
//! `TransferRequest`/`TransferResult` replace the teacher's
//! direction/endpoint-typed `Endpoint<Direction, Kind>` generics (the old
//! `EndpointType`/`TransferStatus`/`Completion` trio this file used to hold)
//! with a single runtime-tagged request, since `spec.md` §4.5 validates
//! "transfer type matches the method" as a runtime check rather than
//! encoding it in the type system — the four `execute_*` methods on
//! `Communicator` are the type-level distinction; the request itself just
//! carries a `TransferKind` for that check.

use std::sync::Arc;

use crate::device::DeviceIdentity;
use crate::error::Error;

pub mod fake;

/// Which of the four USB transfer types a request is (`spec.md` glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Setup packet plus optional data stage.
    Control,
    /// Reliable, no timing guarantee.
    Bulk,
    /// Reliable, bounded latency.
    Interrupt,
    /// Timed, lossy, frame-paced.
    Isochronous,
}

impl TransferKind {
    /// Stable lowercase name, used in `TransferTypeUnsupported` messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Control => "control",
            TransferKind::Bulk => "bulk",
            TransferKind::Interrupt => "interrupt",
            TransferKind::Isochronous => "isochronous",
        }
    }
}

/// Direction encoded in bit 7 of an endpoint address (`spec.md` glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host-to-device.
    Out,
    /// Device-to-host.
    In,
}

/// The direction of `endpoint`, from bit 7 of its address. Grounded in the
/// teacher's `iokit_usb.rs` `EndpointInfo`, which derives the same bit from a
/// pipe's direction and number.
pub fn endpoint_direction(endpoint: u8) -> Direction {
    if endpoint & 0x80 != 0 {
        Direction::In
    } else {
        Direction::Out
    }
}

/// A validated (by the time it reaches an [`InterfaceHandle`]) transfer
/// request.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Which transfer type this is; must match the `execute_*` method used.
    pub kind: TransferKind,
    /// 8-bit endpoint address; direction is bit 7.
    pub endpoint: u8,
    /// Timeout, in milliseconds; validated to `(0, 60_000]` before this is
    /// constructed.
    pub timeout_ms: u32,
    /// The 8-byte setup packet; `Some` only for [`TransferKind::Control`].
    pub setup_packet: Option<[u8; 8]>,
    /// Data to write, for an OUT transfer.
    pub out_data: Option<Vec<u8>>,
    /// Requested read length, for an IN transfer.
    pub read_length: usize,
    /// Packet count; only meaningful for [`TransferKind::Isochronous`].
    pub number_of_packets: usize,
}

/// Per-packet outcome of an isochronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketResult {
    /// Bytes actually transferred in this packet.
    pub length: usize,
    /// Whether this packet completed cleanly or short.
    pub status: TransferStatus,
}

/// Completion status of a (successful, non-error) transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transferred the full requested/available length.
    Completed,
    /// Transferred fewer bytes than requested; not itself an error.
    ShortPacket,
}

/// The result of a completed transfer (`spec.md` §4.5). Failure paths
/// (timeout, cancellation, registry errors) are raised as
/// [`Error`](crate::error::Error) rather than represented here.
#[derive(Debug, Clone)]
pub struct TransferResult {
    /// Whether the transfer completed fully or short.
    pub status: TransferStatus,
    /// Total bytes transferred.
    pub bytes_transferred: usize,
    /// Data read, for an IN transfer.
    pub data: Option<Vec<u8>>,
    /// Per-packet results, for an isochronous transfer.
    pub iso_packet_results: Option<Vec<IsoPacketResult>>,
}

/// An opened USB interface, abstracted so [`crate::communicator::Communicator`]
/// can be exercised without real hardware.
pub trait InterfaceHandle: Send + Sync {
    /// Execute one transfer. Blocks until it completes, is cancelled, or the
    /// caller's timeout watchdog gives up on it.
    fn transfer(&self, request: &TransferRequest) -> Result<TransferResult, Error>;

    /// Abort every in-flight transfer on this interface.
    fn cancel_all(&self);

    /// Abort every in-flight transfer on one endpoint of this interface.
    fn cancel_endpoint(&self, endpoint: u8);
}

/// Capability that opens [`InterfaceHandle`]s for a given device identity
/// and interface number.
pub trait InterfaceFactory: Send + Sync {
    /// Open interface `interface_number` on `device`.
    fn open(
        &self,
        device: &DeviceIdentity,
        interface_number: u8,
    ) -> Result<Arc<dyn InterfaceHandle>, Error>;
}
