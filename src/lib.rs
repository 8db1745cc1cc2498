//! # OFDR Control Core Library
//!
//! Central measurement-task scheduler and device protocol layer for a single
//! OFDR ("FLA") reflectometer shared by many client sessions. Clients submit
//! tasks bound to a channel; the scheduler routes that channel through an
//! optical switch, runs the measurement with exclusive use of the hardware and
//! keeps the decoded result retrievable by task id.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Pure codecs for the instrument's wire formats: `OP_..._PO`
//!   response frames, outbound command strings and raw scan traces.
//! - **`hardware`**: `OpticalSwitch` and `FlaCommunicator` capability traits with
//!   the serial switch, TCP instrument and mock implementations.
//! - **`scheduler`**: Admission, the FIFO queue, the single worker, the result
//!   store and its retention sweeper.
//! - **`network`**: Client records, request dispatch and the line-delimited
//!   JSON TCP gateway.
//! - **`config`**: Layered configuration (TOML file + `OFDR_` environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: `ControlError` and the client-facing error taxonomy.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod network;
pub mod protocol;
pub mod scheduler;

pub use error::{ControlError, ControlResult};
