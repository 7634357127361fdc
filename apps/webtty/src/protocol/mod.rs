//! Data-channel control protocol.
//!
//! Binary frames carry raw terminal bytes in both directions. Text frames are
//! control messages: the literal `quit`, or a JSON array
//! `["stdin", "<text>"]` / `["set_size", rows, cols]` /
//! `["set_size", rows, cols, x_pixels, y_pixels]`.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

pub const QUIT: &str = "quit";
pub const CMD_STDIN: &str = "stdin";
pub const CMD_SET_SIZE: &str = "set_size";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProtocolError(pub String);

impl ProtocolError {
    fn unmatched(text: &str) -> Self {
        ProtocolError(format!("unmatched string message: {text:?}"))
    }
}

/// A message as delivered by the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Frame::Binary(bytes.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

/// What the host does with an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// Raw bytes for the pty.
    Input(Bytes),
    Resize(WindowSize),
    Quit,
}

/// What the client does with an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Output(Bytes),
    Quit,
}

pub fn parse_host_frame(frame: Frame) -> Result<HostCommand, ProtocolError> {
    let text = match frame {
        Frame::Binary(bytes) => return Ok(HostCommand::Input(bytes)),
        Frame::Text(text) => text,
    };
    if text == QUIT {
        return Ok(HostCommand::Quit);
    }
    if !text.starts_with("[\"") {
        return Err(ProtocolError::unmatched(&text));
    }

    let parts: Vec<Value> =
        serde_json::from_str(&text).map_err(|_| ProtocolError::unmatched(&text))?;
    let Some(Value::String(command)) = parts.first() else {
        return Err(ProtocolError::unmatched(&text));
    };
    match command.as_str() {
        CMD_STDIN => match parts.as_slice() {
            [_, Value::String(input)] => Ok(HostCommand::Input(Bytes::from(input.clone()))),
            _ => Err(ProtocolError(format!(
                "stdin expects one string argument: {text}"
            ))),
        },
        CMD_SET_SIZE => parse_set_size(&parts[1..]).map(HostCommand::Resize),
        _ => Err(ProtocolError::unmatched(&text)),
    }
}

fn parse_set_size(args: &[Value]) -> Result<WindowSize, ProtocolError> {
    if !(2..=4).contains(&args.len()) {
        return Err(ProtocolError(format!(
            "set_size expects 2 to 4 numeric arguments, got {}",
            args.len()
        )));
    }
    let mut dims = [0u16; 4];
    for (slot, value) in dims.iter_mut().zip(args) {
        *slot = value
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| ProtocolError(format!("set_size argument out of range: {value}")))?;
    }
    // Pixel dimensions only count as a pair.
    let (pixel_width, pixel_height) = if args.len() == 4 {
        (dims[2], dims[3])
    } else {
        (0, 0)
    };
    Ok(WindowSize {
        rows: dims[0],
        cols: dims[1],
        pixel_width,
        pixel_height,
    })
}

pub fn parse_client_frame(frame: Frame) -> Result<ClientCommand, ProtocolError> {
    match frame {
        Frame::Binary(bytes) => Ok(ClientCommand::Output(bytes)),
        Frame::Text(text) if text == QUIT => Ok(ClientCommand::Quit),
        Frame::Text(text) => Err(ProtocolError::unmatched(&text)),
    }
}

pub fn set_size_message(size: WindowSize) -> String {
    serde_json::json!([
        CMD_SET_SIZE,
        size.rows,
        size.cols,
        size.pixel_width,
        size.pixel_height
    ])
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_are_input() {
        let command = parse_host_frame(Frame::binary(&b"\x1b[A"[..])).unwrap();
        assert_eq!(command, HostCommand::Input(Bytes::from_static(b"\x1b[A")));
    }

    #[test]
    fn quit_is_recognised_on_both_sides() {
        assert_eq!(parse_host_frame(Frame::text("quit")).unwrap(), HostCommand::Quit);
        assert_eq!(
            parse_client_frame(Frame::text("quit")).unwrap(),
            ClientCommand::Quit
        );
    }

    #[test]
    fn stdin_carries_exact_bytes() {
        let command = parse_host_frame(Frame::text(r#"["stdin","ls\n"]"#)).unwrap();
        assert_eq!(command, HostCommand::Input(Bytes::from_static(b"ls\n")));
        assert_eq!(
            parse_host_frame(Frame::text(r#"["stdin","echo \"hi\"\r"]"#)).unwrap(),
            HostCommand::Input(Bytes::from_static(b"echo \"hi\"\r"))
        );
    }

    #[test]
    fn set_size_short_and_long_forms() {
        assert_eq!(
            parse_host_frame(Frame::text(r#"["set_size",40,120]"#)).unwrap(),
            HostCommand::Resize(WindowSize::new(40, 120))
        );
        assert_eq!(
            parse_host_frame(Frame::text(r#"["set_size",40,120,800]"#)).unwrap(),
            HostCommand::Resize(WindowSize::new(40, 120))
        );
        assert_eq!(
            parse_host_frame(Frame::text(r#"["set_size",40,120,800,600]"#)).unwrap(),
            HostCommand::Resize(WindowSize {
                rows: 40,
                cols: 120,
                pixel_width: 800,
                pixel_height: 600,
            })
        );
    }

    #[test]
    fn zero_geometry_is_passed_through() {
        assert_eq!(
            parse_host_frame(Frame::text(r#"["set_size",0,0]"#)).unwrap(),
            HostCommand::Resize(WindowSize::new(0, 0))
        );
    }

    #[test]
    fn set_size_message_parses_back() {
        let size = WindowSize {
            rows: 33,
            cols: 101,
            pixel_width: 1,
            pixel_height: 2,
        };
        assert_eq!(set_size_message(size), r#"["set_size",33,101,1,2]"#);
        assert_eq!(
            parse_host_frame(Frame::text(set_size_message(size))).unwrap(),
            HostCommand::Resize(size)
        );
    }

    #[test]
    fn malformed_control_messages_are_violations() {
        for text in [
            "ping",
            "",
            "[]",
            r#"["resize",1,2]"#,
            r#"["set_size",40]"#,
            r#"["set_size",40,120,1,2,3]"#,
            r#"["set_size",-1,120]"#,
            r#"["set_size",70000,120]"#,
            r#"["set_size","40","120"]"#,
            r#"["stdin"]"#,
            r#"["stdin",5]"#,
            r#"["stdin","a","b"]"#,
            r#"["stdin""#,
        ] {
            assert!(
                parse_host_frame(Frame::text(text)).is_err(),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn client_rejects_control_text() {
        let err = parse_client_frame(Frame::text("ping")).unwrap_err();
        assert!(err.0.contains("ping"));
        assert!(parse_client_frame(Frame::text(r#"["stdin","x"]"#)).is_err());
    }
}
