//! FTP reply handling
//!
//! Parses control-channel replies and translates server fault codes into
//! the crate's error taxonomy.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::PoolError;

/// Standard FTP reply codes used by the pool.
pub const OK: u16 = 200;
pub const READY: u16 = 220;
pub const LOGIN_SUCCESS: u16 = 230;
pub const PASSWORD_REQUIRED: u16 = 331;
pub const DATA_ALREADY_OPEN: u16 = 125;
pub const TRANSFER_STARTING: u16 = 150;
pub const TRANSFER_COMPLETE: u16 = 226;
pub const ACTION_COMPLETED: u16 = 250;
pub const PATHNAME_CREATED: u16 = 257;
pub const ENTERING_PASSIVE: u16 = 227;
pub const PENDING_FURTHER_INFO: u16 = 350;
pub const FILE_NOT_FOUND: u16 = 550;
pub const NAME_NOT_ALLOWED: u16 = 553;

/// A complete reply from the server: the final code and the accumulated
/// message text (multiline replies are joined with newlines).
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Positive preliminary reply (1xx): a transfer is about to start.
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Positive completion reply (2xx).
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Positive intermediate reply (3xx): more input expected (PASS, RNTO).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Error reply (4xx/5xx).
    pub fn is_fault(&self) -> bool {
        self.code >= 400
    }

    /// Translate a fault reply into a typed error, attaching the operation
    /// context the caller was performing.
    pub fn into_error(self, context: &str) -> PoolError {
        match self.code {
            FILE_NOT_FOUND => PoolError::NotFound(format!("{}: {}", context, self.message)),
            NAME_NOT_ALLOWED => {
                PoolError::NameNotAllowed(format!("{}: {}", context, self.message))
            }
            code => PoolError::ProtocolFault {
                code,
                message: format!("{}: {}", context, self.message),
            },
        }
    }
}

/// One parsed line of a reply: the code, whether more lines follow, and
/// the text after the separator.
pub struct ReplyLine<'a> {
    pub code: u16,
    pub last: bool,
    pub text: &'a str,
}

/// Parses a single control-channel line.
///
/// A line that does not start with a three-digit code followed by a space
/// or hyphen is a framing error, which callers treat as a broken transport.
pub fn parse_reply_line(line: &str) -> Result<ReplyLine<'_>, PoolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    // The boundary check keeps split_at from panicking when a multibyte
    // character straddles the code field.
    if line.len() < 4 || !line.is_char_boundary(3) {
        return Err(PoolError::Connectivity(format!(
            "Malformed reply line: {:?}",
            line
        )));
    }
    let (code_part, rest) = line.split_at(3);
    let code: u16 = code_part
        .parse()
        .map_err(|_| PoolError::Connectivity(format!("Malformed reply line: {:?}", line)))?;
    let sep = rest.as_bytes()[0];
    let last = match sep {
        b' ' => true,
        b'-' => false,
        _ => {
            return Err(PoolError::Connectivity(format!(
                "Malformed reply line: {:?}",
                line
            )));
        }
    };
    Ok(ReplyLine {
        code,
        last,
        text: &rest[1..],
    })
}

/// Parses the host/port tuple out of a 227 "Entering Passive Mode" reply:
/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
pub fn parse_passive_addr(message: &str) -> Result<SocketAddrV4, PoolError> {
    let start = message.find('(');
    let end = message.rfind(')');
    let inner = match (start, end) {
        (Some(s), Some(e)) if s < e => &message[s + 1..e],
        _ => {
            return Err(PoolError::Connectivity(format!(
                "Malformed passive mode reply: {}",
                message
            )));
        }
    };

    let fields: Vec<u8> = inner
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| {
            PoolError::Connectivity(format!("Malformed passive mode reply: {}", message))
        })?;
    if fields.len() != 6 {
        return Err(PoolError::Connectivity(format!(
            "Malformed passive mode reply: {}",
            message
        )));
    }

    let ip = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
    let port = u16::from(fields[4]) << 8 | u16::from(fields[5]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Encodes the argument of a PORT command for the given local data socket.
pub fn encode_port_addr(addr: SocketAddrV4) -> String {
    let ip = addr.ip().octets();
    let port = addr.port();
    format!(
        "{},{},{},{},{},{}",
        ip[0],
        ip[1],
        ip[2],
        ip[3],
        port >> 8,
        port & 0xff
    )
}

/// Extracts the quoted pathname from a 257 reply (PWD, MKD).
pub fn parse_created_pathname(message: &str) -> Option<String> {
    let start = message.find('"')?;
    let end = message[start + 1..].find('"')? + start + 1;
    Some(message[start + 1..end].to_string())
}
