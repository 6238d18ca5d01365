//! Microscope control server client
//!
//! The microscope server speaks a small binary protocol over TCP. Every
//! request starts with an 8-byte ASCII command word, optionally followed by
//! big-endian `f32` arguments. Queries answer with big-endian `f32` values;
//! moves answer with nothing.
//!
//! | command    | payload     | reply       |
//! |------------|-------------|-------------|
//! | `getxy___` | -           | `x, y`      |
//! | `getz____` | -           | `z`         |
//! | `getr____` | -           | `ticks`     |
//! | `move____` | `x, y`      | -           |
//! | `movez___` | `z`         | -           |
//! | `mover___` | `ticks`     | -           |
//! | `shutdown` | -           | -           |
//! | `quitclnt` | -           | -           |

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::stage::{StageError, StageInterface, StageResult};

/// Command words understood by the microscope server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCommand {
    GetXy,
    GetZ,
    GetR,
    Move,
    MoveZ,
    MoveR,
    Shutdown,
    Disconnect,
}

impl SocketCommand {
    /// Wire representation, always 8 bytes
    pub fn word(&self) -> &'static [u8; 8] {
        match self {
            SocketCommand::GetXy => b"getxy___",
            SocketCommand::GetZ => b"getz____",
            SocketCommand::GetR => b"getr____",
            SocketCommand::Move => b"move____",
            SocketCommand::MoveZ => b"movez___",
            SocketCommand::MoveR => b"mover___",
            SocketCommand::Shutdown => b"shutdown",
            SocketCommand::Disconnect => b"quitclnt",
        }
    }
}

/// Connection settings for [`MicroscopeSocketClient`]
///
/// Use with `#[command(flatten)]` in a CLI args struct.
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    #[arg(
        long = "server-host",
        default_value = "127.0.0.1",
        help = "Microscope server host"
    )]
    pub host: String,

    #[arg(
        long = "server-port",
        default_value = "5000",
        help = "Microscope server TCP port"
    )]
    pub port: u16,

    #[arg(
        long,
        default_value = "3000",
        help = "Connect timeout in milliseconds"
    )]
    pub connect_timeout_ms: u64,

    #[arg(
        long,
        default_value = "5000",
        help = "Read timeout in milliseconds",
        long_help = "Maximum time to wait for a reply from the microscope server. Stage \
            moves block until the server acknowledges, so long moves need a larger value."
    )]
    pub read_timeout_ms: u64,

    #[arg(
        long,
        default_value = "3",
        help = "Reconnection attempts after a lost connection"
    )]
    pub max_reconnect_attempts: u32,

    #[arg(
        long,
        default_value = "5000",
        help = "Delay between reconnection attempts in milliseconds"
    )]
    pub reconnect_delay_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            connect_timeout_ms: 3000,
            read_timeout_ms: 5000,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 5000,
        }
    }
}

impl SocketConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Blocking client for the microscope control server
///
/// A failed exchange drops the connection. The next request reconnects,
/// retrying up to `max_reconnect_attempts` times. The server is told
/// `quitclnt` when the client is dropped.
pub struct MicroscopeSocketClient {
    config: SocketConfig,
    stream: Option<TcpStream>,
    connection_lost: bool,
}

impl MicroscopeSocketClient {
    /// Create a client without connecting; the first request connects
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            stream: None,
            connection_lost: false,
        }
    }

    /// Create a client and connect immediately
    pub fn connect(config: SocketConfig) -> StageResult<Self> {
        let mut client = Self::new(config);
        client.ensure_connected()?;
        Ok(client)
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn open(&self) -> StageResult<TcpStream> {
        let address = self.config.address();
        let addr = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| StageError::NotConnected(format!("cannot resolve {address}")))?;

        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout())?;
        stream.set_read_timeout(Some(self.config.read_timeout()))?;
        stream.set_write_timeout(Some(self.config.read_timeout()))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn ensure_connected(&mut self) -> StageResult<&mut TcpStream> {
        if self.stream.is_none() {
            let attempts = if self.connection_lost {
                self.config.max_reconnect_attempts.max(1)
            } else {
                1
            };

            let mut last_error = String::new();
            for attempt in 1..=attempts {
                if self.connection_lost {
                    info!("Reconnection attempt {attempt} of {attempts}");
                } else {
                    info!("Connecting to microscope server at {}", self.config.address());
                }

                match self.open() {
                    Ok(stream) => {
                        info!("Connected to microscope server");
                        self.stream = Some(stream);
                        self.connection_lost = false;
                        break;
                    }
                    Err(e) => {
                        warn!("Connection attempt {attempt} failed: {e}");
                        last_error = e.to_string();
                        if attempt < attempts {
                            thread::sleep(self.config.reconnect_delay());
                        }
                    }
                }
            }

            if self.stream.is_none() {
                return Err(StageError::NotConnected(format!(
                    "{} after {attempts} attempt(s): {last_error}",
                    self.config.address()
                )));
            }
        }

        self.stream
            .as_mut()
            .ok_or_else(|| StageError::NotConnected(self.config.address()))
    }

    fn transact(
        stream: &mut TcpStream,
        command: SocketCommand,
        payload: &[u8],
        reply_len: usize,
    ) -> io::Result<Vec<u8>> {
        let mut request = Vec::with_capacity(8 + payload.len());
        request.extend_from_slice(command.word());
        request.extend_from_slice(payload);
        stream.write_all(&request)?;
        stream.flush()?;

        let mut reply = vec![0u8; reply_len];
        stream.read_exact(&mut reply)?;
        Ok(reply)
    }

    /// Send one command and read `reply_len` bytes back
    fn execute(
        &mut self,
        command: SocketCommand,
        payload: &[u8],
        reply_len: usize,
    ) -> StageResult<Vec<u8>> {
        let result = {
            let stream = self.ensure_connected()?;
            Self::transact(stream, command, payload, reply_len)
        };

        result.map_err(|e| {
            error!("Communication error with microscope server ({command:?}): {e}");
            self.stream = None;
            self.connection_lost = true;
            StageError::Io(e)
        })
    }

    fn query_floats<const N: usize>(&mut self, command: SocketCommand) -> StageResult<[f64; N]> {
        let reply = self.execute(command, &[], 4 * N)?;
        decode_floats(&reply)
    }

    /// Current stage XY in µm
    pub fn stage_xy(&mut self) -> StageResult<(f64, f64)> {
        let [x, y] = self.query_floats::<2>(SocketCommand::GetXy)?;
        debug!("Stage XY position: ({x}, {y})");
        Ok((x, y))
    }

    /// Current stage Z in µm
    pub fn stage_z(&mut self) -> StageResult<f64> {
        let [z] = self.query_floats::<1>(SocketCommand::GetZ)?;
        debug!("Stage Z position: {z}");
        Ok(z)
    }

    /// Current rotation stage position in ticks
    pub fn stage_r(&mut self) -> StageResult<f64> {
        let [ticks] = self.query_floats::<1>(SocketCommand::GetR)?;
        debug!("Stage rotation ticks: {ticks}");
        Ok(ticks)
    }

    pub fn move_stage_xy(&mut self, x: f64, y: f64) -> StageResult<()> {
        info!("Moving stage to X={x}, Y={y}");
        self.execute(SocketCommand::Move, &encode_floats(&[x, y]), 0)?;
        Ok(())
    }

    pub fn move_stage_z(&mut self, z: f64) -> StageResult<()> {
        info!("Moving stage Z to {z}");
        self.execute(SocketCommand::MoveZ, &encode_floats(&[z]), 0)?;
        Ok(())
    }

    pub fn move_stage_r(&mut self, ticks: f64) -> StageResult<()> {
        info!("Moving rotation stage to {ticks} ticks");
        self.execute(SocketCommand::MoveR, &encode_floats(&[ticks]), 0)?;
        Ok(())
    }

    /// Ask the server process to exit
    pub fn shutdown_server(&mut self) -> StageResult<()> {
        warn!("Sending shutdown command to microscope server");
        self.execute(SocketCommand::Shutdown, &[], 0)?;
        self.stream = None;
        Ok(())
    }

    /// Say goodbye and close the connection
    pub fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = Self::transact(&mut stream, SocketCommand::Disconnect, &[], 0) {
                debug!("Error sending disconnect command: {e}");
            }
            info!("Disconnected from microscope server");
        }
    }
}

impl Drop for MicroscopeSocketClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl StageInterface for MicroscopeSocketClient {
    fn move_xy(&mut self, x: f64, y: f64) -> StageResult<()> {
        self.move_stage_xy(x, y)
    }

    fn position_xy(&mut self) -> StageResult<(f64, f64)> {
        self.stage_xy()
    }

    fn name(&self) -> &str {
        "MicroscopeSocketClient"
    }
}

/// Big-endian `f32` encoding; the server works in single precision
fn encode_floats(values: &[f64]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| (v as f32).to_be_bytes())
        .collect()
}

fn decode_floats<const N: usize>(bytes: &[u8]) -> StageResult<[f64; N]> {
    if bytes.len() != 4 * N {
        return Err(StageError::Protocol(format!(
            "expected {} reply bytes, got {}",
            4 * N,
            bytes.len()
        )));
    }

    let mut out = [0.0; N];
    for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        let raw = [chunk[0], chunk[1], chunk[2], chunk[3]];
        *value = f32::from_be_bytes(raw) as f64;
    }
    Ok(out)
}
