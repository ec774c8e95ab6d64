//! Colon-delimited text protocol spoken between clients and the rendezvous
//! server.
//!
//! Each request and each reply is one UTF-8 line terminated by `\n`:
//!
//! | Request                       | Reply                                  |
//! |-------------------------------|----------------------------------------|
//! | `REGISTER:<nickname>:<port>`  | `REGISTER_OK`                          |
//! | `GET_USERS`                   | `USERS:<n1,n2,...>`                    |
//! | `GET_ADDR:<nickname>`         | `ADDR:<nickname>:<ip>:<port>`          |
//!
//! Failures are reported as `ERROR:<KIND>:<detail>` and never close the
//! connection.

use std::{fmt, io, net::IpAddr, str::FromStr};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, Result},
    registry::PeerRecord,
};

pub const DEFAULT_SERVER_PORT: u16 = 2024;
pub const MAX_NICKNAME_LEN: usize = 32;
/// Longest line accepted from the other side, terminator included.
pub const MAX_LINE_LEN: usize = 1024;

const LINE_ENDINGS: &[char] = &['\n', '\r'];
const USER_SEPARATOR: char = ',';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { nickname: String, port: u16 },
    GetUsers,
    GetAddr { nickname: String },
}

impl FromStr for Request {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(':').collect();
        match parts.as_slice() {
            ["REGISTER", nickname, port] => {
                let port = parse_port(port)?;
                validate_nickname(nickname)?;
                Ok(Request::Register {
                    nickname: nickname.to_string(),
                    port,
                })
            }
            ["GET_USERS"] => Ok(Request::GetUsers),
            ["GET_ADDR", ""] => Err(Error::MalformedCommand("GET_ADDR requires a nickname".into())),
            ["GET_ADDR", nickname] => Ok(Request::GetAddr {
                nickname: nickname.to_string(),
            }),
            ["REGISTER", ..] => Err(Error::MalformedCommand(
                "expected REGISTER:<nickname>:<port>".into(),
            )),
            ["GET_USERS", ..] => Err(Error::MalformedCommand("GET_USERS takes no arguments".into())),
            ["GET_ADDR", ..] => Err(Error::MalformedCommand("expected GET_ADDR:<nickname>".into())),
            [verb, ..] => Err(Error::MalformedCommand(format!("unknown command '{verb}'"))),
            [] => Err(Error::MalformedCommand("empty command".into())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Register { nickname, port } => write!(f, "REGISTER:{nickname}:{port}"),
            Request::GetUsers => f.write_str("GET_USERS"),
            Request::GetAddr { nickname } => write!(f, "GET_ADDR:{nickname}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    RegisterOk,
    Users(Vec<String>),
    Addr(PeerRecord),
    UserNotFound(String),
    Malformed(String),
    RegistrationRejected(String),
}

impl Reply {
    /// Maps a recoverable request failure to the reply sent back to the client.
    /// Returns `None` for errors that should end the session instead.
    pub fn from_error(error: &Error) -> Option<Self> {
        match error {
            Error::PeerNotFound(nickname) => Some(Reply::UserNotFound(nickname.clone())),
            Error::MalformedCommand(detail) => Some(Reply::Malformed(detail.clone())),
            Error::RegistrationRejected(detail) => Some(Reply::RegistrationRejected(detail.clone())),
            _ => None,
        }
    }

    /// Converts an error reply back into the matching [`Error`]; success replies
    /// pass through unchanged.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Reply::UserNotFound(nickname) => Err(Error::PeerNotFound(nickname)),
            Reply::Malformed(detail) => Err(Error::MalformedCommand(detail)),
            Reply::RegistrationRejected(detail) => Err(Error::RegistrationRejected(detail)),
            other => Ok(other),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::RegisterOk => f.write_str("REGISTER_OK"),
            Reply::Users(nicknames) => write!(f, "USERS:{}", nicknames.join(",")),
            Reply::Addr(record) => {
                write!(f, "ADDR:{}:{}:{}", record.nickname, record.ip, record.port)
            }
            Reply::UserNotFound(nickname) => write!(f, "ERROR:USER_NOT_FOUND:{nickname}"),
            Reply::Malformed(detail) => write!(f, "ERROR:MALFORMED:{detail}"),
            Reply::RegistrationRejected(detail) => {
                write!(f, "ERROR:REGISTRATION_REJECTED:{detail}")
            }
        }
    }
}

impl FromStr for Reply {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        if line == "REGISTER_OK" {
            return Ok(Reply::RegisterOk);
        }
        if let Some(list) = line.strip_prefix("USERS:") {
            let nicknames = list
                .split(USER_SEPARATOR)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            return Ok(Reply::Users(nicknames));
        }
        if let Some(rest) = line.strip_prefix("ADDR:") {
            return parse_addr(rest).ok_or_else(|| Error::Protocol(line.to_string()));
        }
        if let Some(rest) = line.strip_prefix("ERROR:") {
            let (kind, detail) = rest.split_once(':').unwrap_or((rest, ""));
            let detail = detail.to_string();
            return match kind {
                "USER_NOT_FOUND" => Ok(Reply::UserNotFound(detail)),
                "MALFORMED" => Ok(Reply::Malformed(detail)),
                "REGISTRATION_REJECTED" => Ok(Reply::RegistrationRejected(detail)),
                _ => Err(Error::Protocol(line.to_string())),
            };
        }
        Err(Error::Protocol(line.to_string()))
    }
}

// `<nickname>:<ip>:<port>`; the ip may itself contain colons (IPv6).
fn parse_addr(rest: &str) -> Option<Reply> {
    let (nickname, address) = rest.split_once(':')?;
    let (ip, port) = address.rsplit_once(':')?;
    let ip: IpAddr = ip.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(Reply::Addr(PeerRecord::new(nickname, ip, port)))
}

fn parse_port(raw: &str) -> Result<u16> {
    let port: u64 = raw
        .parse()
        .map_err(|_| Error::MalformedCommand(format!("port '{raw}' is not a number")))?;
    match u16::try_from(port) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(Error::RegistrationRejected(format!(
            "port {port} is outside 1-65535"
        ))),
    }
}

/// Checks that `nickname` can be carried by the protocol unambiguously.
pub fn validate_nickname(nickname: &str) -> Result<()> {
    if nickname.is_empty() {
        return Err(Error::RegistrationRejected("nickname cannot be empty".into()));
    }
    if nickname.chars().count() > MAX_NICKNAME_LEN {
        return Err(Error::RegistrationRejected(format!(
            "nickname longer than {MAX_NICKNAME_LEN} characters"
        )));
    }
    if nickname
        .chars()
        .any(|c| c == ':' || c == USER_SEPARATOR || c.is_whitespace())
    {
        return Err(Error::RegistrationRejected(
            "nickname cannot contain ':', ',' or whitespace".into(),
        ));
    }
    Ok(())
}

/// Reads the next non-blank line, without its terminator.
///
/// `Ok(None)` means the other side closed the stream. A line that is too long
/// or not UTF-8 comes back as `Some(Err(MalformedCommand))` after it has been
/// consumed up to its newline, so the stream stays usable.
pub async fn read_command<R>(reader: &mut R) -> io::Result<Option<Result<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(MAX_LINE_LEN);
    loop {
        buf.clear();
        let bytes = (&mut *reader)
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes == MAX_LINE_LEN && !buf.ends_with(b"\n") {
            discard_line(reader).await?;
            return Ok(Some(Err(Error::MalformedCommand(format!(
                "line exceeds {MAX_LINE_LEN} bytes"
            )))));
        }

        let Ok(line) = std::str::from_utf8(&buf) else {
            return Ok(Some(Err(Error::MalformedCommand("line is not valid UTF-8".into()))));
        };
        let line = line.trim_end_matches(LINE_ENDINGS);
        if line.is_empty() {
            continue;
        }
        return Ok(Some(Ok(line.to_string())));
    }
}

/// Like [`read_command`], but an unreadable line fails the read with
/// `InvalidData`.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    read_command(reader)
        .await?
        .transpose()
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}

// Drops the rest of the current line, bounded chunk by chunk.
async fn discard_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut scratch = Vec::with_capacity(MAX_LINE_LEN);
    loop {
        scratch.clear();
        let bytes = (&mut *reader)
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', &mut scratch)
            .await?;
        if bytes == 0 || scratch.ends_with(b"\n") {
            return Ok(());
        }
    }
}

pub async fn write_line<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: fmt::Display + ?Sized,
{
    let mut encoded = message.to_string().into_bytes();
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Reads and decodes one reply. A closed stream is reported as
/// `UnexpectedEof`.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader).await? {
        Some(line) => line.parse(),
        None => Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "rendezvous server closed the connection",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn parses_well_formed_requests() {
        assert_eq!(
            "REGISTER:alice:5000".parse::<Request>().expect("register"),
            Request::Register {
                nickname: "alice".into(),
                port: 5000
            }
        );
        assert_eq!("GET_USERS".parse::<Request>().expect("users"), Request::GetUsers);
        assert_eq!(
            "GET_ADDR:bob".parse::<Request>().expect("addr"),
            Request::GetAddr {
                nickname: "bob".into()
            }
        );
    }

    #[test]
    fn wrong_arity_and_unknown_verbs_are_malformed() {
        for line in [
            "REGISTER:alice",
            "REGISTER:alice:5000:extra",
            "GET_USERS:now",
            "GET_ADDR",
            "GET_ADDR:",
            "GET_ADDR:a:b",
            "HELLO",
            "register:alice:5000",
            "REGISTER:alice:port",
        ] {
            assert!(
                matches!(line.parse::<Request>(), Err(Error::MalformedCommand(_))),
                "{line} should be malformed"
            );
        }
    }

    #[test]
    fn invalid_registrations_are_rejected() {
        for line in [
            "REGISTER::5000",
            "REGISTER:al ice:5000",
            "REGISTER:a,b:5000",
            "REGISTER:alice:0",
            "REGISTER:alice:70000",
        ] {
            assert!(
                matches!(line.parse::<Request>(), Err(Error::RegistrationRejected(_))),
                "{line} should be rejected"
            );
        }

        let long = "x".repeat(MAX_NICKNAME_LEN + 1);
        assert!(validate_nickname(&long).is_err());
        assert!(validate_nickname(&long[1..]).is_ok());
    }

    #[test]
    fn reply_wire_forms() {
        let record = PeerRecord::new("alice", IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 5000);
        assert_eq!(Reply::RegisterOk.to_string(), "REGISTER_OK");
        assert_eq!(
            Reply::Users(vec!["alice".into(), "bob".into()]).to_string(),
            "USERS:alice,bob"
        );
        assert_eq!(Reply::Users(Vec::new()).to_string(), "USERS:");
        assert_eq!(Reply::Addr(record).to_string(), "ADDR:alice:192.168.1.20:5000");
        assert_eq!(
            Reply::UserNotFound("bob".into()).to_string(),
            "ERROR:USER_NOT_FOUND:bob"
        );
    }

    #[test]
    fn parses_replies_including_ipv6_addresses() {
        assert_eq!("USERS:".parse::<Reply>().expect("users"), Reply::Users(Vec::new()));
        assert_eq!(
            "ADDR:alice:::1:5000".parse::<Reply>().expect("addr"),
            Reply::Addr(PeerRecord::new("alice", IpAddr::V6(Ipv6Addr::LOCALHOST), 5000))
        );
        assert!(matches!(
            "ERROR:USER_NOT_FOUND:bob".parse::<Reply>().map(Reply::into_result),
            Ok(Err(Error::PeerNotFound(name))) if name == "bob"
        ));
        assert!(matches!("ADDR:alice:nowhere".parse::<Reply>(), Err(Error::Protocol(_))));
        assert!(matches!("WHAT".parse::<Reply>(), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn line_helpers_skip_blank_lines_and_strip_crlf() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"\r\n\nGET_USERS\r\n").await.expect("write raw");
        write_line(&mut writer, &Request::GetAddr { nickname: "bob".into() })
            .await
            .expect("write request");
        drop(writer);

        assert_eq!(read_line(&mut reader).await.expect("read"), Some("GET_USERS".into()));
        assert_eq!(read_line(&mut reader).await.expect("read"), Some("GET_ADDR:bob".into()));
        assert_eq!(read_line(&mut reader).await.expect("read"), None);
    }

    #[tokio::test]
    async fn unreadable_lines_are_skipped_without_losing_the_stream() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let mut reader = tokio::io::BufReader::new(reader);

        writer
            .write_all("A".repeat(MAX_LINE_LEN * 2).as_bytes())
            .await
            .expect("write raw");
        writer
            .write_all(b"\nGET_ADDR:\xff\xfe\nGET_USERS\n")
            .await
            .expect("write raw");
        drop(writer);

        assert!(matches!(
            read_command(&mut reader).await.expect("read"),
            Some(Err(Error::MalformedCommand(detail))) if detail.contains("exceeds")
        ));
        assert!(matches!(
            read_command(&mut reader).await.expect("read"),
            Some(Err(Error::MalformedCommand(detail))) if detail.contains("UTF-8")
        ));
        assert!(matches!(
            read_command(&mut reader).await.expect("read"),
            Some(Ok(line)) if line == "GET_USERS"
        ));
        assert!(read_command(&mut reader).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn read_line_reports_unreadable_lines_as_invalid_data() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"USERS:\xff\n").await.expect("write raw");

        let err = read_line(&mut reader).await.expect_err("not utf-8");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
