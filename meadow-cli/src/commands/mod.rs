//! Command implementations.
//!
//! Each subcommand group is implemented in its own module. Human-readable
//! status goes to stderr; `--json` output and device output go to stdout.

pub(crate) mod device;
pub(crate) mod listen;
pub(crate) mod ports;
pub(crate) mod upload;

use {
    crate::config::Config,
    anyhow::{Context, Result},
    log::{debug, info},
    meadow_hcom::{
        DeviceMessage, SerialConfig, Session, SessionConfig, TransferConfig, auto_detect_port,
        port::DEFAULT_BAUD_RATE,
    },
    serde::Serialize,
    std::time::Duration,
    tokio_util::sync::CancellationToken,
};

/// Options shared by every command.
pub(crate) struct Ctx {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub timeout: Option<Duration>,
    pub quiet: bool,
    pub config: Config,
    pub cancel: CancellationToken,
}

impl Ctx {
    /// Resolve the port: `--port`, else auto-detection with the configured
    /// port as a hint.
    fn serial_config(&self) -> Result<SerialConfig> {
        let name = match &self.port {
            Some(port) => port.clone(),
            None => {
                auto_detect_port(
                    self.config
                        .connection
                        .port
                        .as_deref(),
                )
                .context("No serial port found; connect a device or pass --port")?
                .name
            },
        };
        Ok(SerialConfig::new(name, self.baud_rate()))
    }

    /// `--baud`, else the configured baud rate, else the default.
    pub fn baud_rate(&self) -> u32 {
        self.baud
            .or(self.config.connection.baud)
            .unwrap_or(DEFAULT_BAUD_RATE)
    }

    /// Open a session whose unsolicited traffic goes to `observer`.
    pub fn open_session<F>(&self, observer: F) -> Result<Session>
    where
        F: Fn(DeviceMessage) + Send + Sync + 'static,
    {
        let serial = self.serial_config()?;
        let mut config = SessionConfig::default();
        if let Some(timeout) = self.timeout {
            config = config.with_request_timeout(timeout);
        }
        let session = Session::open(&serial, config, observer)
            .with_context(|| format!("Failed to open {}", serial.port_name))?;
        self.status(format!("Connected to {}", session.name()));
        Ok(session)
    }

    /// Open a session that logs unsolicited traffic.
    pub fn connect(&self) -> Result<Session> {
        self.open_session(log_device_message)
    }

    /// Upload settings, with `--timeout-ms` applied per step.
    pub fn transfer_config(&self) -> TransferConfig {
        let config = self
            .config
            .transfer_config();
        match self.timeout {
            Some(timeout) => config.with_step_timeout(timeout),
            None => config,
        }
    }

    /// Print a status line to stderr unless `--quiet`.
    pub fn status(&self, message: impl std::fmt::Display) {
        if !self.quiet {
            eprintln!("{message}");
        }
    }
}

fn log_device_message(message: DeviceMessage) {
    match message {
        DeviceMessage::Unsolicited(response) => match response.text() {
            Some(text) if !text.is_empty() => info!("device: {text}"),
            _ => debug!("Unclaimed {:?} frame", response.response_type()),
        },
        DeviceMessage::Malformed(err) => debug!("Discarded frame: {err}"),
    }
}

/// Write `value` to stdout as pretty JSON.
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
