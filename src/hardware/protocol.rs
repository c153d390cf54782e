//! ASCII command protocol for scan configuration and calibration.
//!
//! The supported devices accept short text messages over the USB control pipe.
//! Setting a value echoes it back; queries (`?` prefix) answer with
//! `<query-without-?>=<value>`:
//!
//! ```text
//! -> AISCAN:RATE=22050          <- AISCAN:RATE=22050
//! -> ?AI{0}:SLOPE               <- AI{0}:SLOPE=1.000132
//! ```

use std::fmt;

use tracing::{debug, trace};

use crate::error::{CalibrationError, DeviceError};
use crate::hardware::{CalibrationProvider, ChannelCalibration, ScanParameters};

/// Something that can exchange protocol messages with a device.
pub trait MessageTransport {
    /// Send one message and return the device's response.
    fn send_message(&mut self, message: &str) -> Result<String, DeviceError>;
}

impl<T: MessageTransport + ?Sized> MessageTransport for &mut T {
    fn send_message(&mut self, message: &str) -> Result<String, DeviceError> {
        (**self).send_message(message)
    }
}

/// Analog input scan commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    /// `AISCAN:XFRMODE=<mode>`
    TransferMode(crate::hardware::TransferMode),
    /// `AISCAN:RANGE=<range>`
    Range(crate::hardware::VoltageRange),
    /// `AISCAN:LOWCHAN=<n>`
    LowChannel(u8),
    /// `AISCAN:HIGHCHAN=<n>`
    HighChannel(u8),
    /// `AISCAN:RATE=<hz>`
    Rate(u32),
    /// `AISCAN:SAMPLES=<n>`; zero selects continuous mode
    Samples(u32),
    /// `AISCAN:START`
    Start,
    /// `AISCAN:STOP`
    Stop,
}

impl fmt::Display for ScanCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransferMode(mode) => write!(f, "AISCAN:XFRMODE={}", mode.as_str()),
            Self::Range(range) => write!(f, "AISCAN:RANGE={}", range.as_str()),
            Self::LowChannel(ch) => write!(f, "AISCAN:LOWCHAN={ch}"),
            Self::HighChannel(ch) => write!(f, "AISCAN:HIGHCHAN={ch}"),
            Self::Rate(rate) => write!(f, "AISCAN:RATE={rate}"),
            Self::Samples(n) => write!(f, "AISCAN:SAMPLES={n}"),
            Self::Start => f.write_str("AISCAN:START"),
            Self::Stop => f.write_str("AISCAN:STOP"),
        }
    }
}

impl ScanCommand {
    /// Whether the device acknowledges this command by echoing it.
    fn expects_echo(&self) -> bool {
        !matches!(self, Self::Start | Self::Stop)
    }
}

/// Configuration sequence for a continuous scan, in the order the device expects.
pub fn scan_setup_commands(params: &ScanParameters) -> Vec<ScanCommand> {
    vec![
        ScanCommand::TransferMode(params.transfer_mode),
        ScanCommand::Range(params.voltage_range),
        ScanCommand::LowChannel(params.low_channel),
        ScanCommand::HighChannel(params.high_channel),
        ScanCommand::Rate(params.rate),
        ScanCommand::Samples(0),
    ]
}

/// Send one command and check the acknowledgement.
pub fn send_command<T: MessageTransport + ?Sized>(
    transport: &mut T,
    command: ScanCommand,
) -> Result<(), DeviceError> {
    let message = command.to_string();
    let response = transport.send_message(&message)?;
    trace!(%message, %response, "Protocol exchange");

    if command.expects_echo() && response.trim() != message {
        return Err(DeviceError::Rejected {
            command: message,
            response,
        });
    }
    Ok(())
}

/// Send the full configuration sequence for `params`.
pub fn configure_scan<T: MessageTransport + ?Sized>(
    transport: &mut T,
    params: &ScanParameters,
) -> Result<(), DeviceError> {
    for command in scan_setup_commands(params) {
        send_command(transport, command)?;
    }
    debug!(
        low = params.low_channel,
        high = params.high_channel,
        rate = params.rate,
        range = %params.voltage_range,
        "Scan configured"
    );
    Ok(())
}

/// Calibration constant selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationQuery {
    /// `?AI{n}:SLOPE`
    Slope(u8),
    /// `?AI{n}:OFFSET`
    Offset(u8),
}

impl CalibrationQuery {
    fn channel(self) -> u8 {
        match self {
            Self::Slope(ch) | Self::Offset(ch) => ch,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Slope(_) => "SLOPE",
            Self::Offset(_) => "OFFSET",
        }
    }

    /// Prefix the device echoes before the value.
    pub fn response_prefix(self) -> String {
        format!("AI{{{}}}:{}=", self.channel(), self.name())
    }

    /// Parse the device's answer to this query.
    pub fn parse_response(self, response: &str) -> Result<f32, CalibrationError> {
        let malformed = || CalibrationError::MalformedResponse {
            channel: self.channel(),
            response: response.to_string(),
        };

        let value = response
            .trim()
            .strip_prefix(&self.response_prefix())
            .ok_or_else(malformed)?
            .parse::<f32>()
            .map_err(|_| malformed())?;

        if !value.is_finite() {
            return Err(CalibrationError::NotFinite {
                channel: self.channel(),
                name: self.name(),
                value,
            });
        }
        Ok(value)
    }
}

impl fmt::Display for CalibrationQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?AI{{{}}}:{}", self.channel(), self.name())
    }
}

/// [`CalibrationProvider`] that queries constants over a [`MessageTransport`].
#[derive(Debug)]
pub struct MessageCalibration<T> {
    transport: T,
}

impl<T: MessageTransport> MessageCalibration<T> {
    /// Wrap a transport.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Recover the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn query(&mut self, query: CalibrationQuery) -> Result<f32, CalibrationError> {
        let response = self
            .transport
            .send_message(&query.to_string())
            .map_err(|source| CalibrationError::Query {
                channel: query.channel(),
                source,
            })?;
        query.parse_response(&response)
    }
}

impl<T: MessageTransport> CalibrationProvider for MessageCalibration<T> {
    fn channel_calibration(&mut self, channel: u8) -> Result<ChannelCalibration, CalibrationError> {
        let slope = self.query(CalibrationQuery::Slope(channel))?;
        let offset = self.query(CalibrationQuery::Offset(channel))?;
        debug!(channel, slope, offset, "Read channel calibration");
        Ok(ChannelCalibration { slope, offset })
    }
}
