/// xdcc-transfer: the DCC wire codec, the partial-file store, and the
/// Transfer negotiation/data-pump state machine.
///
/// The IRC session itself is not part of this crate — a Transfer only
/// ever sees the two capabilities it needs from one (`IrcOutbox` and an
/// exclusive `mpsc::UnboundedReceiver<CtcpEvent>` fed by the caller's own
/// routing), so this crate has no IRC dependency at all and can be
/// exercised against a bare TCP listener in tests.
pub mod error;
pub mod logging;
pub mod protocol;
pub mod store;
pub mod transfer;

pub use error::{Result, TransferError};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use protocol::{
    ack_value, decode_ack, encode_ack, encode_resume, ip_from_u32, ip_to_u32, parse_dcc,
    DccMessage, ParseError, ACK_FRAME_LEN,
};
pub use store::PartialFile;
pub use transfer::{run, CtcpEvent, Event, IrcOutbox, PackInfo, TransferConfig};
