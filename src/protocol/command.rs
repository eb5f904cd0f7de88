//! Command grammar: an ASCII verb followed by quote-delimited arguments.
//!
//! Binary payloads are Base64-encoded on the wire. The verb determines the
//! arity, so a wrong argument count is rejected before any engine runs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::HelperError;

/// Requested init system for CUSTOMIZE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFormat {
    Auto,
    CloudInit,
    Systemd,
}

impl InitFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            InitFormat::Auto => "auto",
            InitFormat::CloudInit => "cloudinit",
            InitFormat::Systemd => "systemd",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HelperError> {
        match s {
            "auto" => Ok(InitFormat::Auto),
            "cloudinit" => Ok(InitFormat::CloudInit),
            "systemd" => Ok(InitFormat::Systemd),
            other => Err(HelperError::MalformedCommand(format!(
                "unknown init format: {other}"
            ))),
        }
    }
}

/// A parsed command frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Format {
        drive: String,
    },
    Write {
        drive: String,
        source: String,
    },
    Customize {
        drive: String,
        config: Vec<u8>,
        cmdline: Vec<u8>,
        firstrun: Vec<u8>,
        cloudinit: Vec<u8>,
        network: Vec<u8>,
        init_format: InitFormat,
    },
    Verify {
        drive: String,
        source: String,
        expected_hash: Vec<u8>,
    },
    Shutdown,
}

impl Command {
    /// Parse a command line as received off the wire.
    pub fn parse(line: &str) -> Result<Self, HelperError> {
        let tokens = tokenize(line)?;
        let (verb, args) = tokens
            .split_first()
            .ok_or_else(|| HelperError::MalformedCommand("empty command".to_string()))?;

        let expect = |n: usize| -> Result<(), HelperError> {
            if args.len() == n {
                Ok(())
            } else {
                Err(HelperError::MalformedCommand(format!(
                    "{verb} takes {n} argument(s), got {}",
                    args.len()
                )))
            }
        };

        match verb.as_str() {
            "FORMAT" => {
                expect(1)?;
                Ok(Command::Format {
                    drive: args[0].clone(),
                })
            }
            "WRITE" => {
                expect(2)?;
                Ok(Command::Write {
                    drive: args[0].clone(),
                    source: args[1].clone(),
                })
            }
            "CUSTOMIZE" => {
                expect(7)?;
                Ok(Command::Customize {
                    drive: args[0].clone(),
                    config: decode_blob(&args[1])?,
                    cmdline: decode_blob(&args[2])?,
                    firstrun: decode_blob(&args[3])?,
                    cloudinit: decode_blob(&args[4])?,
                    network: decode_blob(&args[5])?,
                    init_format: InitFormat::parse(&args[6])?,
                })
            }
            "VERIFY" => {
                expect(3)?;
                Ok(Command::Verify {
                    drive: args[0].clone(),
                    source: args[1].clone(),
                    expected_hash: decode_blob(&args[2])?,
                })
            }
            "SHUTDOWN" => {
                expect(0)?;
                Ok(Command::Shutdown)
            }
            other => Err(HelperError::MalformedCommand(format!(
                "unknown verb: {other}"
            ))),
        }
    }

    /// Render the on-the-wire form of this command.
    pub fn render(&self) -> String {
        match self {
            Command::Format { drive } => format!("FORMAT {}", quote(drive)),
            Command::Write { drive, source } => {
                format!("WRITE {} {}", quote(drive), quote(source))
            }
            Command::Customize {
                drive,
                config,
                cmdline,
                firstrun,
                cloudinit,
                network,
                init_format,
            } => format!(
                "CUSTOMIZE {} {} {} {} {} {} {}",
                quote(drive),
                quote(&STANDARD.encode(config)),
                quote(&STANDARD.encode(cmdline)),
                quote(&STANDARD.encode(firstrun)),
                quote(&STANDARD.encode(cloudinit)),
                quote(&STANDARD.encode(network)),
                quote(init_format.as_str()),
            ),
            Command::Verify {
                drive,
                source,
                expected_hash,
            } => format!(
                "VERIFY {} {} {}",
                quote(drive),
                quote(source),
                quote(&STANDARD.encode(expected_hash)),
            ),
            Command::Shutdown => "SHUTDOWN".to_string(),
        }
    }
}

fn decode_blob(arg: &str) -> Result<Vec<u8>, HelperError> {
    STANDARD
        .decode(arg)
        .map_err(|e| HelperError::MalformedCommand(format!("bad base64 payload: {e}")))
}

fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Split a command line into tokens. Tokens are separated by whitespace; a
/// token may be wrapped in double quotes, inside which `\"` and `\\` escape
/// the quote and the backslash.
pub fn tokenize(line: &str) -> Result<Vec<String>, HelperError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped @ ('"' | '\\')) => token.push(escaped),
                        Some(other) => {
                            token.push('\\');
                            token.push(other);
                        }
                        None => {
                            return Err(HelperError::MalformedCommand(
                                "dangling escape at end of input".to_string(),
                            ))
                        }
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => token.push(other),
                }
            }
            if !closed {
                return Err(HelperError::MalformedCommand(
                    "unterminated quoted argument".to_string(),
                ));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_plain_and_quoted() {
        let tokens = tokenize(r#"WRITE "E:" "C:\images\os.img""#).unwrap();
        assert_eq!(tokens, vec!["WRITE", "E:", r"C:\images\os.img"]);
    }

    #[test]
    fn tokenize_escaped_quote_and_backslash() {
        let tokens = tokenize(r#"WRITE "a\"b" "c\\d""#).unwrap();
        assert_eq!(tokens, vec!["WRITE", r#"a"b"#, r"c\d"]);
    }

    #[test]
    fn tokenize_rejects_unterminated_quote() {
        assert!(tokenize(r#"WRITE "E:"#).is_err());
    }

    #[test]
    fn parse_write() {
        // Backslashes in the drive path are escaped on the wire
        let cmd = Command::parse(r#"WRITE "\\\\.\\PHYSICALDRIVE2" "os.img""#).unwrap();
        assert_eq!(
            cmd,
            Command::Write {
                drive: r"\\.\PHYSICALDRIVE2".to_string(),
                source: "os.img".to_string(),
            }
        );
    }

    #[test]
    fn write_round_trip_preserves_backslashes() {
        let cmd = Command::Write {
            drive: r"\\.\PHYSICALDRIVE2".to_string(),
            source: r"C:\images\os.img".to_string(),
        };
        assert_eq!(Command::parse(&cmd.render()).unwrap(), cmd);
    }

    #[test]
    fn parse_write_without_arguments_fails() {
        assert!(matches!(
            Command::parse("WRITE"),
            Err(HelperError::MalformedCommand(_))
        ));
    }

    #[test]
    fn parse_shutdown_takes_no_arguments() {
        assert_eq!(Command::parse("SHUTDOWN").unwrap(), Command::Shutdown);
        assert!(Command::parse(r#"SHUTDOWN "now""#).is_err());
    }

    #[test]
    fn parse_unknown_verb_fails() {
        assert!(matches!(
            Command::parse(r#"REBOOT "E:""#),
            Err(HelperError::MalformedCommand(_))
        ));
    }

    #[test]
    fn customize_round_trip() {
        let cmd = Command::Customize {
            drive: "E:".to_string(),
            config: b"dtparam=audio=on".to_vec(),
            cmdline: b"quiet".to_vec(),
            firstrun: b"#!/bin/sh\ntrue\n".to_vec(),
            cloudinit: b"users: []".to_vec(),
            network: b"version: 2".to_vec(),
            init_format: InitFormat::Auto,
        };
        assert_eq!(Command::parse(&cmd.render()).unwrap(), cmd);
    }

    #[test]
    fn verify_round_trip() {
        let cmd = Command::Verify {
            drive: "E:".to_string(),
            source: "os.img".to_string(),
            expected_hash: vec![0xde, 0xad, 0xbe, 0xef],
        };
        assert_eq!(Command::parse(&cmd.render()).unwrap(), cmd);
    }

    #[test]
    fn render_quotes_special_characters() {
        let cmd = Command::Write {
            drive: "E:".to_string(),
            source: r#"weird "name".img"#.to_string(),
        };
        assert_eq!(Command::parse(&cmd.render()).unwrap(), cmd);
    }

    #[test]
    fn bad_base64_is_rejected() {
        assert!(Command::parse(r#"VERIFY "E:" "os.img" "not@@base64""#).is_err());
    }
}
