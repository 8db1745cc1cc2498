//! RS-232 Optical Switch Driver
//!
//! Protocol Overview:
//! - Format: ASCII commands, terminator CRLF (`\r\n`)
//! - Every reply ends with the `>` prompt
//! - A reply starting with `Err:` reports a rejected command
//! - Route: `SW <index> SPOS <input> <output>`
//! - Cascaded route: `MSW a,b,c;d,e,f;` (configured per channel)
//! - Readback: `SW <index> POS` answers `<input>-><output>` or a bare output
//! - Status: `SW <index> SPOS?` (commanded route), `SW <index> CNT?` (switch count)
//! - Reset: `RST`
//!
//! The driver is generic over any async byte stream so it runs the same way
//! against a `tokio-serial` port and a `tokio::io::duplex` test link.

use crate::config::SwitchConfig;
use crate::error::{ControlError, ControlResult};
use crate::hardware::{bounded, DynIo};
use crate::hardware::capabilities::{OpticalSwitch, SwitchState, SwitchStatus};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// End-of-reply prompt.
pub const PROMPT: u8 = b'>';
/// Command terminator.
pub const LINE_TERMINATOR: &str = "\r\n";

static ROUTE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*->\s*(\d+)").expect("Invalid route regex"));

static TRAILING_INT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(-?\d+)\s*$").expect("Invalid integer regex"));

/// Optical switch on a serial link.
pub struct SerialOpticalSwitch {
    /// Link protected by Mutex for exclusive access
    port: Mutex<BufReader<DynIo>>,
    switch_index: u32,
    input_channel: u32,
    outputs: BTreeSet<u32>,
    /// Per-channel command overriding `SW .. SPOS ..`
    routes: HashMap<u32, String>,
    timeout: Duration,
    current: AtomicI32,
}

impl SerialOpticalSwitch {
    /// Open the configured serial port (8N1, no flow control).
    #[cfg(feature = "instrument_serial")]
    pub async fn open(config: &SwitchConfig) -> ControlResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let path = config.port.clone();
        let baud = config.baud_rate;

        let port = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path, baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| ControlError::LinkFault(format!("open switch port {path}: {e}")))
        })
        .await
        .map_err(|e| ControlError::LinkFault(format!("switch port open task failed: {e}")))??;

        tracing::info!(port = %config.port, baud = config.baud_rate, "Optical switch opened");
        Self::with_port(Box::new(port), config)
    }

    /// Serial support is compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub async fn open(_config: &SwitchConfig) -> ControlResult<Self> {
        Err(ControlError::SerialFeatureDisabled)
    }

    /// Driver over an already-open link.
    pub fn with_port(port: DynIo, config: &SwitchConfig) -> ControlResult<Self> {
        Ok(Self {
            port: Mutex::new(BufReader::new(port)),
            switch_index: config.switch_index,
            input_channel: config.input_channel,
            outputs: config.outputs.iter().copied().collect(),
            routes: config.route_table()?,
            timeout: config.timeout,
            current: AtomicI32::new(-1),
        })
    }

    /// Command that routes the input to `output`.
    pub fn route_command(&self, output: u32) -> String {
        self.routes.get(&output).cloned().unwrap_or_else(|| {
            format!(
                "SW {} SPOS {} {}",
                self.switch_index, self.input_channel, output
            )
        })
    }

    /// One command/reply exchange under the driver timeout.
    async fn exchange(&self, command: &str, cancel: &CancellationToken) -> ControlResult<String> {
        bounded(command, self.timeout, cancel, self.transact(command)).await
    }

    async fn transact(&self, command: &str) -> ControlResult<String> {
        let mut port = self.port.lock().await;

        // Drop anything left over from an aborted exchange.
        let stale = port.buffer().len();
        if stale > 0 {
            tracing::debug!(bytes = stale, "Optical switch: discarding stale bytes");
            port.consume(stale);
        }

        tracing::debug!(cmd = %command, "SWITCH send");
        let line = format!("{command}{LINE_TERMINATOR}");
        port.get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ControlError::LinkFault(format!("switch write failed: {e}")))?;
        port.get_mut()
            .flush()
            .await
            .map_err(|e| ControlError::LinkFault(format!("switch flush failed: {e}")))?;

        let mut raw = Vec::new();
        let n = port
            .read_until(PROMPT, &mut raw)
            .await
            .map_err(|e| ControlError::LinkFault(format!("switch read failed: {e}")))?;
        if n == 0 || raw.last() != Some(&PROMPT) {
            return Err(ControlError::LinkFault(
                "switch link closed before prompt".into(),
            ));
        }
        raw.pop();

        let text = String::from_utf8_lossy(&raw);
        let reply = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != command)
            .collect::<Vec<_>>()
            .join("\n");
        tracing::debug!(reply = %reply, "SWITCH recv");

        if reply
            .lines()
            .any(|l| l.to_ascii_lowercase().starts_with("err:"))
        {
            return Err(ControlError::DeviceFault(format!(
                "switch rejected '{command}': {reply}"
            )));
        }
        Ok(reply)
    }

    fn parse_state(&self, reply: &str) -> Option<SwitchState> {
        if let Some(caps) = ROUTE_REGEX.captures(reply) {
            let input = caps[1].parse().ok()?;
            let output = caps[2].parse().ok()?;
            return Some(SwitchState { input, output });
        }
        let output = TRAILING_INT_REGEX.captures(reply)?[1].parse().ok()?;
        Some(SwitchState {
            input: self.input_channel,
            output,
        })
    }
}

#[async_trait]
impl OpticalSwitch for SerialOpticalSwitch {
    fn input_channel(&self) -> u32 {
        self.input_channel
    }

    fn supported_output_channels(&self) -> &BTreeSet<u32> {
        &self.outputs
    }

    fn current_output_channel(&self) -> i32 {
        self.current.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, cancel), err)]
    async fn set_channel(&self, output: u32, cancel: &CancellationToken) -> ControlResult<()> {
        if !self.supports(output) {
            return Err(ControlError::DeviceFault(format!(
                "output channel {output} is not wired on switch {}",
                self.switch_index
            )));
        }

        let command = self.route_command(output);
        match self.exchange(&command, cancel).await {
            Ok(_) => {
                self.current.store(output as i32, Ordering::SeqCst);
                tracing::info!(output, "Switch routed");
                Ok(())
            }
            Err(e) => {
                self.current.store(-1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    #[instrument(skip(self, cancel), err)]
    async fn query_channel(&self, cancel: &CancellationToken) -> ControlResult<u32> {
        let reply = self
            .exchange(&format!("SW {} POS", self.switch_index), cancel)
            .await?;
        let state = self.parse_state(&reply).ok_or_else(|| {
            ControlError::ProtocolFault(format!("unreadable switch position: '{reply}'"))
        })?;
        self.current.store(state.output as i32, Ordering::SeqCst);
        Ok(state.output)
    }

    #[instrument(skip(self, cancel), err)]
    async fn reset(&self, cancel: &CancellationToken) -> ControlResult<()> {
        self.current.store(-1, Ordering::SeqCst);
        self.exchange("RST", cancel).await.map(|_| ())
    }

    #[instrument(skip(self, cancel), err)]
    async fn status(&self, cancel: &CancellationToken) -> ControlResult<SwitchStatus> {
        let index = self.switch_index;
        let actual = self.exchange(&format!("SW {index} POS"), cancel).await?;
        let setting = self.exchange(&format!("SW {index} SPOS?"), cancel).await?;
        let count = self.exchange(&format!("SW {index} CNT?"), cancel).await?;

        Ok(SwitchStatus {
            switch_index: index,
            actual: self.parse_state(&actual),
            setting: self.parse_state(&setting),
            count: TRAILING_INT_REGEX
                .captures(&count)
                .and_then(|c| c[1].parse().ok()),
        })
    }
}
