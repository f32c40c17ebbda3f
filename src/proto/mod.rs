//! SOCKS5 control-frame codec
//!
//! Read/write for the frames exchanged on the control TCP connection:
//! the greeting, method selection, username/password sub-negotiation
//! (RFC 1929), and the command request/reply. The request and the reply
//! share one wire layout and differ only in how the second byte is
//! interpreted.
//!
//! Every read is driven by `read_exact` over the lengths the frame header
//! declares, so a decoder never consumes more or fewer bytes than the frame
//! owns. Writers assemble the whole frame in memory and issue a single
//! `write_all`.

pub mod udp;

use crate::consts::*;
use crate::error::Socks5Error;
use crate::types::{ReplyCode, SocksCommand, TargetAddr};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Client greeting: the list of authentication methods on offer
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Raw method bytes in the order the client offered them
    pub methods: Vec<u8>,
}

impl Greeting {
    /// Create a greeting offering the given methods
    pub fn new(methods: Vec<u8>) -> Self {
        Greeting { methods }
    }

    /// Whether a method byte is among the offered ones
    pub fn has_method(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }

    /// Read a greeting from the stream
    pub async fn read<R>(stream: &mut R) -> Result<Self, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(head[0]));
        }
        if head[1] == 0 {
            return Err(Socks5Error::NoMethods);
        }

        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        Ok(Greeting { methods })
    }

    /// Write the greeting to the stream
    pub async fn write<W>(&self, stream: &mut W) -> Result<(), Socks5Error>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(2 + self.methods.len());
        buf.push(SOCKS5_VERSION);
        buf.push(self.methods.len() as u8);
        buf.extend_from_slice(&self.methods);

        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Server method selection: `05 METHOD`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSelection {
    /// The method the server picked, or 0xFF for "no acceptable method"
    pub method: u8,
}

impl MethodSelection {
    /// Read a method selection from the stream
    pub async fn read<R>(stream: &mut R) -> Result<Self, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;

        if buf[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(buf[0]));
        }

        Ok(MethodSelection { method: buf[1] })
    }

    /// Write the method selection to the stream
    pub async fn write<W>(&self, stream: &mut W) -> Result<(), Socks5Error>
    where
        W: AsyncWrite + Unpin,
    {
        stream.write_all(&[SOCKS5_VERSION, self.method]).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Username/password sub-negotiation request (RFC 1929)
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordRequest {
    /// Username bytes, interpreted as UTF-8
    pub username: String,
    /// Password bytes, interpreted as UTF-8
    pub password: String,
}

impl PasswordRequest {
    /// Read a password request from the stream
    pub async fn read<R>(stream: &mut R) -> Result<Self, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;

        if head[0] != SOCKS5_AUTH_VERSION {
            return Err(Socks5Error::UnsupportedVersion(head[0]));
        }

        let mut username = vec![0u8; head[1] as usize];
        stream.read_exact(&mut username).await?;

        let plen = stream.read_u8().await?;
        let mut password = vec![0u8; plen as usize];
        stream.read_exact(&mut password).await?;

        let username =
            String::from_utf8(username).map_err(|_| Socks5Error::InvalidCredential)?;
        let password =
            String::from_utf8(password).map_err(|_| Socks5Error::InvalidCredential)?;

        Ok(PasswordRequest { username, password })
    }

    /// Write the password request to the stream
    pub async fn write<W>(&self, stream: &mut W) -> Result<(), Socks5Error>
    where
        W: AsyncWrite + Unpin,
    {
        if self.username.len() > MAX_CREDENTIAL_LEN || self.password.len() > MAX_CREDENTIAL_LEN {
            return Err(Socks5Error::CredentialTooLong);
        }

        let mut buf = Vec::with_capacity(3 + self.username.len() + self.password.len());
        buf.push(SOCKS5_AUTH_VERSION);
        buf.push(self.username.len() as u8);
        buf.extend_from_slice(self.username.as_bytes());
        buf.push(self.password.len() as u8);
        buf.extend_from_slice(self.password.as_bytes());

        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Username/password sub-negotiation reply: `01 STATUS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordResponse {
    /// 0 on success, any other value is a failure
    pub status: u8,
}

impl PasswordResponse {
    /// Whether the server accepted the credentials
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Read a password response from the stream
    pub async fn read<R>(stream: &mut R) -> Result<Self, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;

        if buf[0] != SOCKS5_AUTH_VERSION {
            return Err(Socks5Error::UnsupportedVersion(buf[0]));
        }

        Ok(PasswordResponse { status: buf[1] })
    }

    /// Write the password response to the stream
    pub async fn write<W>(&self, stream: &mut W) -> Result<(), Socks5Error>
    where
        W: AsyncWrite + Unpin,
    {
        stream.write_all(&[SOCKS5_AUTH_VERSION, self.status]).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Command request: `05 CMD 00 ATYP ADDR PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The requested command
    pub command: SocksCommand,
    /// The target (or client hint, for UDP ASSOCIATE) address
    pub target: TargetAddr,
}

impl Request {
    /// Create a request
    pub fn new(command: SocksCommand, target: TargetAddr) -> Self {
        Request { command, target }
    }

    /// Read a request from the stream.
    ///
    /// An unknown command byte yields [`Socks5Error::UnsupportedCommand`]
    /// after the header is consumed; the caller decides whether to answer
    /// with a reply before closing.
    pub async fn read<R>(stream: &mut R) -> Result<Self, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(head[0]));
        }

        let command =
            SocksCommand::from_byte(head[1]).ok_or(Socks5Error::UnsupportedCommand(head[1]))?;
        let target = read_address(stream, head[3]).await?;

        Ok(Request { command, target })
    }

    /// Write the request to the stream
    pub async fn write<W>(&self, stream: &mut W) -> Result<(), Socks5Error>
    where
        W: AsyncWrite + Unpin,
    {
        write_command_frame(stream, self.command.to_byte(), &self.target).await
    }
}

/// Command reply: `05 REP 00 ATYP ADDR PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The reply code
    pub code: ReplyCode,
    /// Bound address, 0.0.0.0:0 when meaningless
    pub bind_addr: TargetAddr,
}

impl Reply {
    /// Create a reply with the given code and bind address
    pub fn new(code: ReplyCode, bind_addr: TargetAddr) -> Self {
        Reply { code, bind_addr }
    }

    /// Create an error reply carrying the all-zero bind address
    pub fn error(code: ReplyCode) -> Self {
        Reply {
            code,
            bind_addr: TargetAddr::default(),
        }
    }

    /// Read a reply from the stream
    pub async fn read<R>(stream: &mut R) -> Result<Self, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(head[0]));
        }

        let code = ReplyCode::from_byte(head[1]);
        let bind_addr = read_address(stream, head[3]).await?;

        Ok(Reply { code, bind_addr })
    }

    /// Write the reply to the stream
    pub async fn write<W>(&self, stream: &mut W) -> Result<(), Socks5Error>
    where
        W: AsyncWrite + Unpin,
    {
        write_command_frame(stream, self.code.to_byte(), &self.bind_addr).await
    }
}

/// Read the (ATYP-selected) address and port tail of a command frame.
///
/// Reads exactly the bytes the ATYP dictates; anything else is a framing
/// error surfaced as a short read or an explicit rejection.
async fn read_address<R>(stream: &mut R, addr_type: u8) -> Result<TargetAddr, Socks5Error>
where
    R: AsyncRead + Unpin,
{
    match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Ok(TargetAddr::ipv4(Ipv4Addr::from(addr), port))
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 {
                return Err(Socks5Error::InvalidDomain("empty domain".to_string()));
            }

            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|e| Socks5Error::InvalidDomain(e.to_string()))?;

            let port = read_port(stream).await?;
            Ok(TargetAddr::domain(domain, port))
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Ok(TargetAddr::ipv6(Ipv6Addr::from(addr), port))
        }

        other => Err(Socks5Error::UnsupportedAddressType(other)),
    }
}

async fn read_port<R>(stream: &mut R) -> Result<u16, Socks5Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

/// Assemble and write a request/reply frame in one go.
async fn write_command_frame<W>(
    stream: &mut W,
    code: u8,
    addr: &TargetAddr,
) -> Result<(), Socks5Error>
where
    W: AsyncWrite + Unpin,
{
    if let TargetAddr::Domain(domain, _) = addr {
        if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
            return Err(Socks5Error::InvalidDomain(domain.clone()));
        }
    }

    let addr_bytes = addr.to_bytes();
    let mut buf = Vec::with_capacity(3 + addr_bytes.len());
    buf.push(SOCKS5_VERSION);
    buf.push(code);
    buf.push(SOCKS5_RESERVED);
    buf.extend_from_slice(&addr_bytes);

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
