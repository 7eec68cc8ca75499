//! Hardware identity announced by the device on boot.
//!
//! The firmware prints a line such as
//! `[IDENTITY] model=esp32,name=<36-char hardware id><suffix>`.

use std::time::Duration;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::port::{Connection, restart};
use crate::transport::{LineReader, ReadResult};

/// Prefix of the identity line.
pub const IDENTITY_PREFIX: &str = "[IDENTITY]";

/// Length of the hardware id at the start of the `name` field.
pub const HARDWARE_ID_LEN: usize = 36;

/// Default time to wait for the identity line.
pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Identity fields parsed from an `[IDENTITY]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HardwareIdentity {
    /// Chip model, e.g. `esp32`.
    pub model: String,
    /// Full device name as announced.
    pub name: String,
    /// First [`HARDWARE_ID_LEN`] characters of `name`.
    pub hardware_id: String,
}

impl HardwareIdentity {
    /// Parse the comma-separated `key=value` body of an identity line.
    ///
    /// Parts that do not split into exactly one key and one value are
    /// ignored. Requires a non-empty `model` and a `name` longer than
    /// [`HARDWARE_ID_LEN`] characters.
    pub fn parse(body: &str) -> Result<Self> {
        let mut model = None;
        let mut name = None;

        for part in body
            .trim()
            .split(',')
        {
            let mut fields = part.split('=');
            let (Some(key), Some(value), None) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            match key {
                "model" => model = Some(value),
                "name" => name = Some(value),
                _ => {},
            }
        }

        let model = model
            .filter(|m| !m.is_empty())
            .ok_or(Error::HardwareIdentityNotFound)?;
        let name = name
            .filter(|n| {
                n.chars()
                    .count()
                    > HARDWARE_ID_LEN
            })
            .ok_or(Error::HardwareIdentityNotFound)?;

        Ok(Self {
            model: model.to_string(),
            name: name.to_string(),
            hardware_id: name
                .chars()
                .take(HARDWARE_ID_LEN)
                .collect(),
        })
    }
}

/// Parse a full line, including the `[IDENTITY]` prefix.
pub fn parse_identity_line(line: &str) -> Option<HardwareIdentity> {
    line.strip_prefix(IDENTITY_PREFIX)
        .and_then(|body| HardwareIdentity::parse(body).ok())
}

impl std::fmt::Display for HardwareIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.hardware_id, self.model)
    }
}

/// Options for [`detect_hardware_identity`].
#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
    /// How long to wait for the identity line.
    pub timeout: Duration,
    /// Restart the device before listening.
    pub restart: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DETECT_TIMEOUT,
            restart: true,
        }
    }
}

/// Restart the device and wait for its `[IDENTITY]` line.
///
/// The first line carrying the prefix decides the outcome, valid or not.
/// The reader is always stopped before returning.
pub async fn detect_hardware_identity<C: Connection>(
    connection: &C,
    options: DetectOptions,
) -> Result<HardwareIdentity> {
    let mut reader = LineReader::new(connection.clone())?;
    let found = identity_line(&mut reader, options).await;
    reader
        .stop()
        .await;

    let body = found?.ok_or(Error::HardwareIdentityNotFound)?;
    let identity = HardwareIdentity::parse(&body)?;
    info!("Detected {} device {}", identity.model, identity.hardware_id);
    Ok(identity)
}

async fn identity_line<C: Connection>(
    reader: &mut LineReader<C>,
    options: DetectOptions,
) -> Result<Option<String>> {
    if options.restart {
        restart(reader.connection()).await?;
    }
    reader.set_timeout(options.timeout);
    loop {
        match reader
            .read()
            .await?
        {
            ReadResult::Closed => return Ok(None),
            ReadResult::Line(line) => {
                if let Some(body) = line.strip_prefix(IDENTITY_PREFIX) {
                    return Ok(Some(
                        body.trim()
                            .to_string(),
                    ));
                }
                debug!("Skipping boot line: {line}");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Signals;
    use crate::port::mock::{MockPort, Step};

    const NAME: &str = "0123456789abcdef0123456789abcdef0123-suffix";

    #[test]
    fn test_parse_identity_body() {
        let identity = HardwareIdentity::parse(&format!(" model=esp32,name={NAME} ")).unwrap();
        assert_eq!(identity.model, "esp32");
        assert_eq!(identity.name, NAME);
        assert_eq!(identity.hardware_id, "0123456789abcdef0123456789abcdef0123");
    }

    #[test]
    fn test_parse_rejects_short_name() {
        // Exactly 36 characters is not enough.
        let body = "model=esp32,name=0123456789abcdef0123456789abcdef0123";
        assert!(matches!(
            HardwareIdentity::parse(body),
            Err(Error::HardwareIdentityNotFound)
        ));
    }

    #[test]
    fn test_parse_rejects_missing_model() {
        assert!(HardwareIdentity::parse(&format!("name={NAME}")).is_err());
        assert!(HardwareIdentity::parse(&format!("model=,name={NAME}")).is_err());
    }

    #[test]
    fn test_parse_ignores_malformed_pairs() {
        let body = format!("junk,a=b=c,model=esp32,name={NAME}");
        assert!(HardwareIdentity::parse(&body).is_ok());

        let body = format!("model=esp32=x,name={NAME}");
        assert!(HardwareIdentity::parse(&body).is_err());
    }

    #[test]
    fn test_parse_identity_line() {
        let line = format!("[IDENTITY] model=esp32,name={NAME}");
        assert!(parse_identity_line(&line).is_some());
        assert!(parse_identity_line(&format!("model=esp32,name={NAME}")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_finds_identity_after_boot_noise() {
        let port = MockPort::new();
        port.push_text(&[
            "rst:0x1 (POWERON_RESET)\r\n",
            "[IDENTITY] model=esp32,",
            format!("name={NAME}\r\n").as_str(),
        ]);

        let identity = detect_hardware_identity(&port, DetectOptions::default())
            .await
            .unwrap();
        assert_eq!(identity.model, "esp32");
        assert_eq!(
            port.signals()
                .first(),
            Some(&Signals::data_terminal_ready(false))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_times_out() {
        let port = MockPort::new();
        port.push_stream(vec![Step::Data(b"booting\r\n".to_vec()), Step::Hang]);

        let start = tokio::time::Instant::now();
        let err = detect_hardware_identity(
            &port,
            DetectOptions {
                timeout: Duration::from_millis(300),
                restart: false,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::HardwareIdentityNotFound));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(
            port.signals()
                .is_empty()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_first_identity_line_decides() {
        let port = MockPort::new();
        port.push_text(&[
            "[IDENTITY] model=esp32,name=short\r\n",
            format!("[IDENTITY] model=esp32,name={NAME}\r\n").as_str(),
        ]);

        let err = detect_hardware_identity(&port, DetectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HardwareIdentityNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_propagates_fatal_errors() {
        let port = MockPort::new();
        port.push_stream(vec![Step::Fatal]);

        let err = detect_hardware_identity(&port, DetectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
