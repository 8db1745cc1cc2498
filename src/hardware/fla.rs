//! FLA Reflectometer Driver (TCP)
//!
//! Protocol Overview:
//! - Transport: TCP, default port 4300, ASCII, commands terminated by `\n`
//! - Handshake: the instrument sends `OCI` once the connection is accepted
//! - Configuration commands (`SR_`, `G_`, `WR_`, `X_`) answer a line containing `OK`
//! - Auto-peak answers one `OP_..._PO` frame
//! - `SCAN` answers a resolution line, fixed-width samples and `!`
//! - A reply starting with `ERR` is a rejected command
//! - `QUIT` ends the session
//!
//! The link is held behind a `tokio::sync::Mutex` for one exchange at a time.
//! A link that failed mid-exchange (I/O error, deadline, cancellation) is
//! dropped and reopened on the next exchange, so a half-read reply can never
//! be mistaken for the answer to the next command.

use crate::config::InstrumentConfig;
use crate::error::{ControlError, ControlResult};
use crate::hardware::capabilities::FlaCommunicator;
use crate::hardware::{bounded, DynIo};
use crate::protocol::command::{
    self, center_command, gain_command, resolution_command, window_command, HANDSHAKE, QUIT,
    SCAN, TERMINATOR,
};
use crate::protocol::frame::{decode_frame, FrameOptions, FRAME_END, FRAME_START};
use crate::protocol::trace::{
    decode_samples, expected_points, parse_resolution, DEFAULT_RESOLUTION_M, MAX_TRACE_BYTES,
    SAMPLE_WIDTH, TRACE_TERMINATOR,
};
use crate::protocol::{AutoPeakParams, MeasurementResult, ScanTrace};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Upper bound on one buffered reply.
pub const MAX_REPLY_BYTES: usize = 64 * 1024;

type Link = BufReader<DynIo>;

/// FLA instrument on a TCP link.
pub struct FlaInstrument {
    /// `None` once the link failed; reopened on demand when `address` is set
    link: Mutex<Option<Link>>,
    address: Option<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
    scan_timeout: Duration,
    frame_options: FrameOptions,
}

impl FlaInstrument {
    /// Connect to the configured instrument and wait for the handshake.
    #[instrument(skip(config), fields(address = %config.address()), err)]
    pub async fn connect(config: &InstrumentConfig) -> ControlResult<Self> {
        let address = config.address();
        let link = open_link(&address, config.connect_timeout, &CancellationToken::new()).await?;
        tracing::info!("FLA connected");
        Ok(Self::build(Some(link), Some(address), config))
    }

    /// Driver that opens its link on the first exchange.
    pub fn deferred(config: &InstrumentConfig) -> Self {
        Self::build(None, Some(config.address()), config)
    }

    /// Driver over an already-open stream; performs the handshake.
    ///
    /// Such a driver cannot reconnect after a link failure.
    pub async fn from_stream(stream: DynIo, config: &InstrumentConfig) -> ControlResult<Self> {
        let mut link = BufReader::new(stream);
        bounded(
            "FLA handshake",
            config.connect_timeout,
            &CancellationToken::new(),
            handshake(&mut link),
        )
        .await?;
        Ok(Self::build(Some(link), None, config))
    }

    fn build(link: Option<Link>, address: Option<String>, config: &InstrumentConfig) -> Self {
        Self {
            link: Mutex::new(link),
            address,
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
            scan_timeout: config.scan_timeout,
            frame_options: config.frame_options(),
        }
    }

    /// Send `QUIT` and close the link.
    pub async fn disconnect(&self) {
        let mut guard = self.link.lock().await;
        if let Some(mut link) = guard.take() {
            let line = format!("{QUIT}{TERMINATOR}");
            if let Err(e) = link.get_mut().write_all(line.as_bytes()).await {
                tracing::debug!(error = %e, "FLA: QUIT not delivered");
            }
            if let Err(e) = link.get_mut().shutdown().await {
                tracing::debug!(error = %e, "FLA: shutdown failed");
            }
            tracing::info!("FLA disconnected");
        }
    }

    /// Whether a link is currently open.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    async fn ensure_link<'a>(
        &self,
        guard: &'a mut Option<Link>,
        cancel: &CancellationToken,
    ) -> ControlResult<&'a mut Link> {
        if guard.is_none() {
            let address = self.address.as_deref().ok_or_else(|| {
                ControlError::LinkFault("instrument link is closed".into())
            })?;
            tracing::warn!(address, "FLA: reopening link");
            *guard = Some(open_link(address, self.connect_timeout, cancel).await?);
        }
        guard
            .as_mut()
            .ok_or_else(|| ControlError::LinkFault("instrument link is closed".into()))
    }

    async fn send_and_expect_ok(&self, cmd: &str, cancel: &CancellationToken) -> ControlResult<()> {
        let mut guard = self.link.lock().await;
        let link = self.ensure_link(&mut guard, cancel).await?;
        let outcome = bounded(cmd, self.command_timeout, cancel, async move {
            send_line(link, cmd).await?;
            read_reply(link, |text| command::is_ack(text).then_some(())).await
        })
        .await;
        settle(&mut guard, &outcome);
        outcome
    }
}

/// Drop the link when the exchange left it in an unknown state.
fn settle<T>(guard: &mut Option<Link>, outcome: &ControlResult<T>) {
    if let Err(
        ControlError::LinkFault(_) | ControlError::Timeout(_) | ControlError::Cancelled(_),
    ) = outcome
    {
        *guard = None;
    }
}

async fn open_link(address: &str, limit: Duration, cancel: &CancellationToken) -> ControlResult<Link> {
    bounded("FLA connect", limit, cancel, async {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ControlError::LinkFault(format!("connect {address}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "FLA: TCP_NODELAY not set");
        }
        let io: DynIo = Box::new(stream);
        let mut link = BufReader::new(io);
        handshake(&mut link).await?;
        Ok(link)
    })
    .await
}

async fn handshake(link: &mut Link) -> ControlResult<()> {
    read_reply(link, |text| text.contains(HANDSHAKE).then_some(()))
        .await
        .map_err(|e| match e {
            ControlError::LinkFault(msg) => {
                ControlError::LinkFault(format!("handshake failed, {HANDSHAKE} not received: {msg}"))
            }
            other => other,
        })?;
    tracing::debug!("FLA: {HANDSHAKE} received");
    Ok(())
}

async fn send_line(link: &mut Link, cmd: &str) -> ControlResult<()> {
    let stale = link.buffer().len();
    if stale > 0 {
        tracing::debug!(bytes = stale, "FLA: discarding stale bytes");
        link.consume(stale);
    }

    tracing::debug!(cmd = %cmd, "FLA send");
    let line = format!("{cmd}{TERMINATOR}");
    link.get_mut()
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ControlError::LinkFault(format!("FLA write failed: {e}")))?;
    link.get_mut()
        .flush()
        .await
        .map_err(|e| ControlError::LinkFault(format!("FLA flush failed: {e}")))
}

/// Accumulate reply bytes until `complete` recognises a full reply.
///
/// A complete line starting with `ERR` ends the exchange as a device fault.
async fn read_reply<T>(link: &mut Link, complete: impl Fn(&str) -> Option<T>) -> ControlResult<T> {
    let mut acc: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 2048];

    loop {
        let n = link
            .read(&mut chunk)
            .await
            .map_err(|e| ControlError::LinkFault(format!("FLA read failed: {e}")))?;
        if n == 0 {
            return Err(ControlError::LinkFault(
                "instrument closed the link before replying".into(),
            ));
        }
        if acc.len() + n > MAX_REPLY_BYTES {
            return Err(ControlError::ProtocolFault(format!(
                "reply exceeds {MAX_REPLY_BYTES} bytes"
            )));
        }
        acc.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&acc);
        let error_line = text
            .split_inclusive('\n')
            .filter(|line| line.ends_with('\n'))
            .map(str::trim)
            .find(|line| command::is_error_reply(line));
        if let Some(line) = error_line {
            return Err(ControlError::DeviceFault(format!("instrument error: {line}")));
        }
        if let Some(found) = complete(&text) {
            return Ok(found);
        }
    }
}

/// Extract the first complete `OP_..._PO` frame from `text`.
fn find_frame(text: &str) -> Option<String> {
    let start = text.find(FRAME_START)?;
    let body_start = start + FRAME_START.len();
    let end = text[body_start..].find(FRAME_END)? + body_start + FRAME_END.len();
    Some(text[start..end].to_string())
}

async fn read_trace(link: &mut Link, window_m: f64) -> ControlResult<ScanTrace> {
    let mut line = String::new();
    let n = link
        .read_line(&mut line)
        .await
        .map_err(|e| ControlError::LinkFault(format!("FLA read failed: {e}")))?;
    if n == 0 {
        return Err(ControlError::LinkFault(
            "instrument closed the link before the resolution line".into(),
        ));
    }
    if command::is_error_reply(&line) {
        return Err(ControlError::DeviceFault(format!(
            "instrument error: {}",
            line.trim()
        )));
    }

    let resolution_m = parse_resolution(&line, DEFAULT_RESOLUTION_M);
    let expected = expected_points(window_m, resolution_m);
    tracing::debug!(resolution_m, expected, "FLA: scan header");

    let expected_bytes = expected.saturating_mul(SAMPLE_WIDTH);
    let mut data = Vec::with_capacity(expected_bytes.min(MAX_REPLY_BYTES) + 16);
    let n = (&mut *link)
        .take(MAX_TRACE_BYTES as u64)
        .read_until(TRACE_TERMINATOR, &mut data)
        .await
        .map_err(|e| ControlError::LinkFault(format!("FLA read failed: {e}")))?;

    let terminated = data.last() == Some(&TRACE_TERMINATOR);
    if terminated {
        data.pop();
    } else if n >= MAX_TRACE_BYTES {
        return Err(ControlError::ProtocolFault(format!(
            "scan exceeds {MAX_TRACE_BYTES} bytes without a terminator"
        )));
    } else if n < expected_bytes {
        return Err(ControlError::LinkFault(format!(
            "scan ended after {n} of {expected_bytes} bytes"
        )));
    }
    while matches!(data.last(), Some(b'\r' | b'\n')) {
        data.pop();
    }

    let samples = decode_samples(&data)?;
    if samples.len() != expected {
        tracing::warn!(
            expected,
            actual = samples.len(),
            "FLA: scan point count differs from window/resolution"
        );
    }

    Ok(ScanTrace {
        resolution_m,
        window_length_m: window_m,
        point_count: samples.len(),
        samples,
        raw_bytes: data.len(),
        terminated,
    })
}

#[async_trait]
impl FlaCommunicator for FlaInstrument {
    #[instrument(skip(self, cancel), err)]
    async fn execute_command(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> ControlResult<String> {
        let mut guard = self.link.lock().await;
        let link = self.ensure_link(&mut guard, cancel).await?;
        let outcome = bounded(command, self.command_timeout, cancel, async move {
            send_line(link, command).await?;
            read_reply(link, find_frame).await
        })
        .await;
        settle(&mut guard, &outcome);
        if let Ok(frame) = &outcome {
            tracing::debug!(frame = %frame, "FLA recv");
        }
        outcome
    }

    #[instrument(skip(self, cancel), err)]
    async fn set_resolution(&self, mode: &str, cancel: &CancellationToken) -> ControlResult<()> {
        self.send_and_expect_ok(&resolution_command(mode), cancel)
            .await
    }

    #[instrument(skip(self, cancel), err)]
    async fn set_gain(&self, ui: u32, cancel: &CancellationToken) -> ControlResult<()> {
        self.send_and_expect_ok(&gain_command(ui)?, cancel).await
    }

    #[instrument(skip(self, cancel), err)]
    async fn set_window(&self, raw: &str, cancel: &CancellationToken) -> ControlResult<()> {
        self.send_and_expect_ok(&window_command(raw), cancel).await
    }

    #[instrument(skip(self, cancel), err)]
    async fn set_center(&self, raw: &str, cancel: &CancellationToken) -> ControlResult<()> {
        self.send_and_expect_ok(&center_command(raw), cancel).await
    }

    #[instrument(skip(self, cancel), err)]
    async fn scan(&self, window_m: f64, cancel: &CancellationToken) -> ControlResult<ScanTrace> {
        if !(window_m.is_finite() && window_m > 0.0) {
            return Err(ControlError::Validation(format!(
                "scan window must be positive (got {window_m})"
            )));
        }

        let mut guard = self.link.lock().await;
        let link = self.ensure_link(&mut guard, cancel).await?;
        let outcome = bounded(SCAN, self.scan_timeout, cancel, async move {
            send_line(link, SCAN).await?;
            read_trace(link, window_m).await
        })
        .await;
        settle(&mut guard, &outcome);
        if let Ok(trace) = &outcome {
            tracing::info!(
                points = trace.point_count,
                resolution_m = trace.resolution_m,
                "FLA scan complete"
            );
        }
        outcome
    }

    #[instrument(skip(self, params, cancel), err)]
    async fn auto_peak(
        &self,
        params: &AutoPeakParams,
        cancel: &CancellationToken,
    ) -> ControlResult<MeasurementResult> {
        let cmd = params.to_command()?;
        let raw = self.execute_command(&cmd, cancel).await?;
        let result = decode_frame(&raw, &self.frame_options)?;
        tracing::info!(
            peaks = result.peaks.len(),
            declared = result.peak_count,
            "FLA auto-peak complete"
        );
        Ok(result)
    }
}
