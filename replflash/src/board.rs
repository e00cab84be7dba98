//! Board facade.
//!
//! [`Board`] is what a host application (editor, CLI) talks to: it owns one
//! [`Connection`] and exposes the handful of operations a MicroPython IDE
//! needs, each of which takes care of entering and leaving the raw REPL.
//!
//! ## Example
//!
//! ```rust,no_run
//! use replflash::board::{Board, BoardKind};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut board = Board::connect("/dev/ttyUSB0", BoardKind::Esp32)?;
//!     board.run(b"print('hello')")?;
//!     board.push_file("main.py", b"import machine\n")?;
//!     let boot = board.pull_file("boot.py")?;
//!     println!("boot.py is {} bytes", boot.len());
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};

use crate::connection::{CloseHandle, Connection, InterruptHandle};
use crate::error::{Error, ExecError, IoError, TransferError};
use crate::exec::{DEFAULT_EXEC_TIMEOUT, ExecOutput};
use crate::reader::ByteSink;
use crate::repl::control::ETX;
use crate::terminal::Terminal;
use crate::transfer::{FileTransfer, TransferConfig};

#[cfg(feature = "native")]
use crate::connection::ConnectOptions;
#[cfg(feature = "native")]
use crate::error::ConnectError;

/// Supported board families.
///
/// All of them speak the same raw REPL; the tag travels with a connection
/// request so the host can show it and pick board-specific snippets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BoardKind {
    /// ESP8266 running MicroPython.
    #[default]
    Esp8266,
    /// ESP32 running MicroPython.
    Esp32,
    /// BBC micro:bit.
    MicroBit,
}

impl BoardKind {
    /// All known kinds.
    pub const ALL: [Self; 3] = [Self::Esp8266, Self::Esp32, Self::MicroBit];

    /// Parse a board name, ignoring case and separators.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "esp8266" => Some(Self::Esp8266),
            "esp32" => Some(Self::Esp32),
            "microbit" => Some(Self::MicroBit),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Esp8266 => "esp8266",
            Self::Esp32 => "esp32",
            Self::MicroBit => "microbit",
        }
    }
}

impl fmt::Display for BoardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BoardKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| {
            Error::Config(format!(
                "Unknown board '{s}' (expected one of: esp8266, esp32, microbit)"
            ))
        })
    }
}

/// An open board.
pub struct Board {
    conn: Connection,
    kind: BoardKind,
    terminal: Option<Arc<Mutex<Terminal>>>,
    exec_timeout: Duration,
    transfer: TransferConfig,
}

impl Board {
    /// Open `path` with default options.
    #[cfg(feature = "native")]
    pub fn connect(path: &str, kind: BoardKind) -> Result<Self, ConnectError> {
        Self::open(&ConnectOptions::new(path), kind)
    }

    /// Open a board with explicit connection options.
    #[cfg(feature = "native")]
    pub fn open(options: &ConnectOptions, kind: BoardKind) -> Result<Self, ConnectError> {
        let conn = Connection::open(options)?;
        Self::from_connection(conn, kind).map_err(|e| ConnectError::PortUnavailable {
            path: options
                .serial
                .port_name
                .clone(),
            reason: e.to_string(),
        })
    }

    /// Wrap an open connection, interrupting whatever the board is running.
    pub fn from_connection(conn: Connection, kind: BoardKind) -> Result<Self, IoError> {
        conn.write(&[ETX])?;
        info!("Connected to {kind} on {}", conn.path());
        Ok(Self {
            conn,
            kind,
            terminal: None,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            transfer: TransferConfig::default(),
        })
    }

    /// Set the timeout used by [`run`](Self::run).
    #[must_use]
    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    /// Set the file transfer settings.
    #[must_use]
    pub fn with_transfer_config(mut self, config: TransferConfig) -> Self {
        self.transfer = config;
        self
    }

    /// Board family tag given at connect time.
    pub fn kind(&self) -> BoardKind {
        self.kind
    }

    /// Device path.
    pub fn path(&self) -> &str {
        self.conn
            .path()
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Whether the transport is still usable.
    pub fn is_connected(&self) -> bool {
        self.conn
            .is_open()
    }

    /// Whether a protocol exchange owns the byte stream.
    ///
    /// Hosts should block editing of the terminal while this is true.
    pub fn is_raw(&self) -> bool {
        self.conn
            .state()
            .is_raw()
    }

    /// Run `code` on the board.
    ///
    /// Output (including a traceback) is handed to the terminal subscriber
    /// once the board is back in the friendly REPL.
    pub fn run(&mut self, code: &[u8]) -> Result<(), ExecError> {
        self.run_with_output(code, self.exec_timeout, |_| {})
            .map(|_| ())
    }

    /// Run `code` and return what it printed, without touching the terminal.
    pub fn run_capture(&mut self, code: &[u8]) -> Result<ExecOutput, ExecError> {
        self.conn
            .enter_raw_repl()?;
        let result = self
            .conn
            .follow(code, self.exec_timeout, |_| {});
        self.leave_raw(result)
    }

    /// Run `code`, streaming stdout to `on_output`.
    ///
    /// The terminal subscriber only sees the output after raw mode is left.
    pub fn run_with_output<F>(
        &mut self,
        code: &[u8],
        timeout: Duration,
        on_output: F,
    ) -> Result<ExecOutput, ExecError>
    where
        F: FnMut(&[u8]),
    {
        self.conn
            .enter_raw_repl()?;
        let result = self
            .conn
            .follow(code, timeout, on_output);
        let output = self.leave_raw(result)?;

        let terminal = self
            .conn
            .terminal_subscriber();
        for stream in [&output.stdout, &output.stderr] {
            if !stream.is_empty() {
                terminal.deliver(stream);
            }
        }
        Ok(output)
    }

    fn leave_raw<T>(&mut self, result: Result<T, ExecError>) -> Result<T, ExecError> {
        let exit = self
            .conn
            .exit_raw_repl();
        match result {
            Ok(value) => {
                exit?;
                Ok(value)
            },
            Err(e) => {
                if let Err(exit_err) = exit {
                    debug!("Leaving raw REPL after failed run: {exit_err}");
                }
                Err(e)
            },
        }
    }

    /// Upload `data` to `filename` and read it back to verify it.
    pub fn push_file(&mut self, filename: &str, data: &[u8]) -> Result<(), TransferError> {
        self.push_file_with(filename, data, true, |_, _| {})
    }

    /// Upload with progress reporting; `verify` controls the read-back check.
    pub fn push_file_with<F>(
        &mut self,
        filename: &str,
        data: &[u8],
        verify: bool,
        progress: F,
    ) -> Result<(), TransferError>
    where
        F: FnMut(usize, usize),
    {
        let mut transfer = FileTransfer::with_config(&mut self.conn, self.transfer.clone());
        transfer.push_with_progress(filename, data, progress)?;
        if !verify {
            return Ok(());
        }

        let actual = transfer.pull(filename)?;
        if actual != data {
            return Err(TransferError::VerifyMismatch {
                filename: filename.to_string(),
                expected: data.len(),
                actual: actual.len(),
            });
        }
        info!("Verified {filename} ({} bytes)", data.len());
        Ok(())
    }

    /// Download `filename` from the board.
    pub fn pull_file(&mut self, filename: &str) -> Result<Vec<u8>, TransferError> {
        FileTransfer::with_config(&mut self.conn, self.transfer.clone()).pull(filename)
    }

    /// Interrupt the running program (Ctrl-C twice).
    pub fn interrupt(&self) -> Result<(), ExecError> {
        self.conn
            .interrupt()
    }

    /// Leave raw mode, interrupt and soft-reset the board.
    pub fn reset(&mut self) -> Result<(), ExecError> {
        self.conn
            .soft_reset()
    }

    /// Send keyboard input to the friendly REPL.
    pub fn send(&self, bytes: &[u8]) -> Result<(), IoError> {
        self.conn
            .write(bytes)
    }

    /// Register a callback for live friendly-mode output.
    ///
    /// Replaces any terminal attached with [`attach_terminal`](Self::attach_terminal).
    pub fn subscribe_terminal(&mut self, sink: ByteSink) {
        self.terminal = None;
        self.conn
            .subscribe_terminal(sink);
    }

    /// Feed friendly-mode output into `terminal`, clearing it first.
    ///
    /// Bytes that arrive after the clear land in the fresh buffer, including
    /// a late prompt answering the connect interrupt.
    pub fn attach_terminal(&mut self, terminal: Arc<Mutex<Terminal>>) {
        terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let sink = terminal.clone();
        self.conn
            .subscribe_terminal(Box::new(move |chunk| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .feed(chunk);
            }));
        self.terminal = Some(terminal);
    }

    /// The terminal attached with [`attach_terminal`](Self::attach_terminal).
    pub fn terminal(&self) -> Option<&Arc<Mutex<Terminal>>> {
        self.terminal
            .as_ref()
    }

    /// Register the health callback (`false` once the device goes away).
    pub fn on_health<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.conn
            .on_health_change(Arc::new(callback));
    }

    /// Handle that closes the connection from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        self.conn
            .close_handle()
    }

    /// Handle that interrupts the board from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn
            .interrupt_handle()
    }

    /// Close the connection.
    pub fn disconnect(mut self) {
        self.conn
            .unsubscribe_terminal();
        self.conn
            .close();
        info!("Disconnected from {}", self.kind);
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("kind", &self.kind)
            .field("connection", &self.conn)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::sim::{BoardState, SimBoard, SimPort, fast_options};
    use crate::repl::RawReplState;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sim_board() -> (Board, SimPort, Arc<Mutex<BoardState>>) {
        let (device, state) = SimBoard::new();
        let port = SimPort::new(device);
        let wire = port.clone();
        let conn = Connection::from_port(Box::new(port), &fast_options()).unwrap();
        let board = Board::from_connection(conn, BoardKind::Esp32)
            .unwrap()
            .with_exec_timeout(Duration::from_secs(2));
        (board, wire, state)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_board_kind_names() {
        assert_eq!(BoardKind::from_name("ESP8266"), Some(BoardKind::Esp8266));
        assert_eq!(BoardKind::from_name("esp-32"), Some(BoardKind::Esp32));
        assert_eq!(BoardKind::from_name("micro:bit"), Some(BoardKind::MicroBit));
        assert_eq!(BoardKind::from_name("pico"), None);
        assert!("pico".parse::<BoardKind>().is_err());
        for kind in BoardKind::ALL {
            assert_eq!(kind.name().parse::<BoardKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_connect_sends_single_interrupt() {
        let (_board, wire, _) = sim_board();
        assert_eq!(wire.writes(), vec![vec![0x03]]);
    }

    #[test]
    fn test_run_returns_to_friendly_and_shows_output() {
        let (mut board, _, state) = sim_board();
        let terminal = Arc::new(Mutex::new(Terminal::new()));
        board.attach_terminal(terminal.clone());

        board
            .run(b"print('hello')")
            .unwrap();
        assert!(!board.is_raw());
        assert_eq!(board.connection().state(), RawReplState::Friendly);
        assert!(!state.lock().unwrap().raw);
        assert!(
            state
                .lock()
                .unwrap()
                .executed
                .contains(&"print('hello')".to_string())
        );
        assert!(wait_for(|| terminal.lock().unwrap().text().contains("hello")));
    }

    #[test]
    fn test_run_output_reaches_terminal_only_after_leaving_raw() {
        let (mut board, _, state) = sim_board();
        let raw_at_delivery = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (flags, sink, board_state) = (raw_at_delivery.clone(), seen.clone(), state.clone());
        board.subscribe_terminal(Box::new(move |chunk| {
            flags
                .lock()
                .unwrap()
                .push(board_state.lock().unwrap().raw);
            sink.lock()
                .unwrap()
                .extend_from_slice(chunk);
        }));
        assert!(wait_for(|| seen.lock().unwrap().ends_with(b">>> ")));

        board
            .run(b"print('hello')")
            .unwrap();
        assert!(wait_for(|| {
            String::from_utf8_lossy(&seen.lock().unwrap()).contains("hello")
        }));
        let flags = raw_at_delivery
            .lock()
            .unwrap()
            .clone();
        assert!(!flags.is_empty());
        assert!(flags.iter().all(|raw| !raw), "terminal fed while raw: {flags:?}");
    }

    #[test]
    fn test_run_shows_traceback_in_terminal() {
        let (mut board, _, _) = sim_board();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        board.subscribe_terminal(Box::new(move |chunk| {
            sink.lock()
                .unwrap()
                .extend_from_slice(chunk);
        }));

        board
            .run(b"raise Exception")
            .unwrap();
        assert!(wait_for(|| {
            String::from_utf8_lossy(&seen.lock().unwrap()).contains("Traceback")
        }));
    }

    #[test]
    fn test_run_capture_returns_stdout() {
        let (mut board, _, _) = sim_board();
        let output = board
            .run_capture(b"print(42)")
            .unwrap();
        assert_eq!(output.stdout_text(), "42\r\n");
        assert!(!board.is_raw());
    }

    #[test]
    fn test_push_and_pull_file() {
        let (mut board, _, state) = sim_board();
        let data = b"import machine\nprint('boot')\n";

        board
            .push_file("boot.py", data)
            .unwrap();
        assert_eq!(state.lock().unwrap().files["boot.py"], data);
        assert_eq!(board.pull_file("boot.py").unwrap(), data);
    }

    #[test]
    fn test_push_reports_verify_mismatch() {
        // A board whose filesystem silently drops the last byte of each write.
        let (device, state) = SimBoard::new();
        let lossy = {
            let mut device = device;
            let state = state.clone();
            move |bytes: &[u8]| {
                let reply = crate::port::sim::SimDevice::on_write(&mut device, bytes);
                if bytes.contains(&0x04) {
                    for data in state
                        .lock()
                        .unwrap()
                        .files
                        .values_mut()
                    {
                        if data.len() > 3 {
                            data.truncate(3);
                        }
                    }
                }
                reply
            }
        };
        let conn = Connection::from_port(Box::new(SimPort::new(lossy)), &fast_options()).unwrap();
        let mut board = Board::from_connection(conn, BoardKind::Esp8266).unwrap();

        match board.push_file("x.txt", b"abcdef") {
            Err(TransferError::VerifyMismatch {
                filename,
                expected,
                actual,
            }) => {
                assert_eq!(filename, "x.txt");
                assert_eq!(expected, 6);
                assert_eq!(actual, 3);
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_interrupt_and_reset_bytes() {
        let (mut board, wire, _) = sim_board();
        wire.clear_writes();

        board
            .interrupt()
            .unwrap();
        assert_eq!(wire.written(), b"\r\x03\x03");

        wire.clear_writes();
        board
            .reset()
            .unwrap();
        assert_eq!(wire.written(), b"\r\x02\r\x03\x03\x04");
    }

    #[test]
    fn test_reset_leaves_raw_mode_the_host_did_not_know_about() {
        let (mut board, _, state) = sim_board();
        state
            .lock()
            .unwrap()
            .raw = true;
        assert!(!board.is_raw());

        board
            .reset()
            .unwrap();
        assert!(!state.lock().unwrap().raw);
    }

    #[test]
    fn test_attach_terminal_clears_and_feeds() {
        let (mut board, wire, _) = sim_board();
        // Let the prompt answering the connect interrupt pass through first.
        let early = Arc::new(Mutex::new(Vec::new()));
        let sink = early.clone();
        board.subscribe_terminal(Box::new(move |chunk| {
            sink.lock()
                .unwrap()
                .extend_from_slice(chunk);
        }));
        assert!(wait_for(|| early.lock().unwrap().ends_with(b">>> ")));

        let terminal = Arc::new(Mutex::new(Terminal::new()));
        terminal
            .lock()
            .unwrap()
            .feed(b"old text");
        board.attach_terminal(terminal.clone());
        assert_eq!(terminal.lock().unwrap().text(), "");

        wire.emit(b"hello");
        assert!(wait_for(|| terminal.lock().unwrap().text() == "hello"));
        assert!(board.terminal().is_some());
    }

    #[test]
    fn test_health_callback_on_unplug() {
        let (board, wire, _) = sim_board();
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        board.on_health(move |connected| {
            if !connected {
                flag.store(true, Ordering::SeqCst);
            }
        });

        wire.unplug();
        assert!(wait_for(|| lost.load(Ordering::SeqCst)));
        assert!(!board.is_connected());
    }

    #[test]
    fn test_disconnect_closes() {
        let (board, _, _) = sim_board();
        let handle = board.close_handle();
        board.disconnect();
        assert!(!handle.is_open());
    }
}
