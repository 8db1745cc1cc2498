//! Hardware layer: the optical switch and the FLA instrument.
//!
//! [`capabilities`] holds the traits the scheduler programs against;
//! [`switch`] and [`fla`] are the real drivers and [`mock`] the simulated ones.

pub mod capabilities;
pub mod fla;
pub mod mock;
pub mod switch;

pub use capabilities::{FlaCommunicator, OpticalSwitch, SwitchState, SwitchStatus};

use crate::error::{ControlError, ControlResult};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Byte stream a driver can run over: serial port, TCP socket or test duplex.
pub trait DeviceIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceIo for T {}

/// Boxed driver link.
pub type DynIo = Box<dyn DeviceIo>;

/// Run `fut` under a deadline and a cancellation token.
///
/// Cancellation wins over completion when both are ready. The future is
/// dropped on either, which releases any lock guard it holds.
pub async fn bounded<T, F>(
    what: &str,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> ControlResult<T>
where
    F: Future<Output = ControlResult<T>>,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            Err(ControlError::Cancelled(format!("{what} cancelled")))
        }

        outcome = tokio::time::timeout(limit, fut) => {
            outcome.map_err(|_| {
                ControlError::Timeout(format!("{what} exceeded {limit:?}"))
            })?
        }
    }
}
