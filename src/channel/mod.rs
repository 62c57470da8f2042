//! Duplex channel subsystem.
//!
//! # Data Flow
//! ```text
//! network ── stub ══[Lower end | pipe | Upper end]══ consumer
//!                    byte stream  ⇄  byte stream
//!                    inbox(Lower) ⇠  writes from Upper
//!                    inbox(Upper) ⇠  writes from Lower
//! ```
//!
//! # Design Decisions
//! - Attachment is exclusive per end and released on drop
//! - Disconnect is shared by both ends and idempotent
//! - Middle layers link a lower pipe to an upper pipe so metadata and
//!   exceptions flow upward

pub mod datagram;
pub mod layer_info;
pub mod pipe;

pub use datagram::{Datagram, DatagramQueue};
pub use layer_info::{LayerId, LayerInfo, LayerInfoPart, TcpInfo, TlsInfo, UdpInfo};
pub use pipe::{duplex_pipe, PipeAttach, PipeEnd, Side, WeakPipeEnd};
