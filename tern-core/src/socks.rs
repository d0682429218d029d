//! SOCKS5 proxy tunnel negotiation.
//!
//! When a proxy is configured, every peer connect runs this sub-protocol
//! to completion before the hello handshake begins. The exchange is five
//! ordered sub-phases; the username/password and CHAP paths use all five,
//! the no-auth path skips `Authorize`.
//!
//! Failure codes 1–8 from the CONNECT reply map onto the closed
//! [`ProxyError`] set and surface exactly like transport errors.

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::ProxyAuth;
use crate::error::{ProxyError, TernError};

const SOCKS_VERSION: u8 = 5;
const CMD_CONNECT: u8 = 1;
const ADDR_IPV4: u8 = 1;

const METHOD_NONE: u8 = 0x00;
const METHOD_PASSWORD: u8 = 0x02;
const METHOD_CHAP: u8 = 0x03;

// CHAP attribute types
const CHAP_ATTR_STATUS: u8 = 0x00;
const CHAP_ATTR_CHALLENGE: u8 = 0x03;
const CHAP_ATTR_RESPONSE: u8 = 0x04;
const CHAP_ATTR_USER: u8 = 0x02;
const CHAP_ATTR_ALGORITHMS: u8 = 0x80;
const CHAP_ALGO_HMAC_MD5: u8 = 0x85;

/// The five ordered negotiation sub-phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksPhase {
    /// Offer our authentication method.
    RequestAuth,
    /// Run the chosen sub-negotiation (password or CHAP).
    Authorize,
    /// Read the authentication verdict.
    AuthStatus,
    /// Issue the CONNECT for the real destination.
    CrossConnect,
    /// Read the CONNECT reply and map failure codes.
    ConnectStatus,
}

/// Drive the full negotiation on an established proxy connection.
///
/// Returns the phases that executed, in order — the caller transitions
/// its link state through them and tests assert the sequence.
pub async fn negotiate<S>(
    stream: &mut S,
    auth: &ProxyAuth,
    dest_ip: Ipv4Addr,
    dest_port: u16,
) -> Result<Vec<SocksPhase>, TernError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut phases = Vec::with_capacity(5);

    // ── RequestAuth ──────────────────────────────────────────────
    phases.push(SocksPhase::RequestAuth);
    let method = match auth {
        ProxyAuth::None => METHOD_NONE,
        ProxyAuth::Password { .. } => METHOD_PASSWORD,
        ProxyAuth::Chap { .. } => METHOD_CHAP,
    };
    stream.write_all(&[SOCKS_VERSION, 1, method]).await?;
    debug!(method, "proxy: offered authentication method");

    // ── Authorize ────────────────────────────────────────────────
    match auth {
        ProxyAuth::None => {}
        ProxyAuth::Password { username, password } => {
            phases.push(SocksPhase::Authorize);
            expect_method(stream, METHOD_PASSWORD).await?;
            let mut buf = Vec::with_capacity(3 + username.len() + password.len());
            buf.push(1); // subnegotiation version
            buf.push(username.len() as u8);
            buf.extend_from_slice(username.as_bytes());
            buf.push(password.len() as u8);
            buf.extend_from_slice(password.as_bytes());
            stream.write_all(&buf).await?;
        }
        ProxyAuth::Chap { username, password } => {
            phases.push(SocksPhase::Authorize);
            expect_method(stream, METHOD_CHAP).await?;
            // offer HMAC-MD5 and identify ourselves
            let mut buf = vec![1, 2];
            buf.extend_from_slice(&[CHAP_ATTR_ALGORITHMS, 1, CHAP_ALGO_HMAC_MD5]);
            buf.extend_from_slice(&[CHAP_ATTR_USER, username.len() as u8]);
            buf.extend_from_slice(username.as_bytes());
            stream.write_all(&buf).await?;

            let attrs = read_chap_attrs(stream).await?;
            let challenge = attrs
                .iter()
                .find(|(t, _)| *t == CHAP_ATTR_CHALLENGE)
                .map(|(_, v)| v.clone())
                .ok_or(ProxyError::AuthFailed)?;
            let digest = hmac_md5(password.as_bytes(), &challenge);
            let mut buf = vec![1, 1, CHAP_ATTR_RESPONSE, digest.len() as u8];
            buf.extend_from_slice(&digest);
            stream.write_all(&buf).await?;
        }
    }

    // ── AuthStatus ───────────────────────────────────────────────
    phases.push(SocksPhase::AuthStatus);
    match auth {
        ProxyAuth::None => expect_method(stream, METHOD_NONE).await?,
        ProxyAuth::Password { .. } => {
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await?;
            if buf[0] != 1 || buf[1] != 0 {
                debug!("proxy: password authorization failure");
                return Err(ProxyError::AuthFailed.into());
            }
        }
        ProxyAuth::Chap { .. } => {
            let attrs = read_chap_attrs(stream).await?;
            let ok = attrs
                .iter()
                .any(|(t, v)| *t == CHAP_ATTR_STATUS && v.first() == Some(&0));
            if !ok {
                debug!("proxy: CHAP authorization failure");
                return Err(ProxyError::AuthFailed.into());
            }
        }
    }

    // ── CrossConnect ─────────────────────────────────────────────
    phases.push(SocksPhase::CrossConnect);
    let mut buf = [0u8; 10];
    buf[0] = SOCKS_VERSION;
    buf[1] = CMD_CONNECT;
    buf[3] = ADDR_IPV4;
    buf[4..8].copy_from_slice(&dest_ip.octets());
    buf[8..10].copy_from_slice(&dest_port.to_be_bytes());
    stream.write_all(&buf).await?;
    debug!(%dest_ip, dest_port, "proxy: CONNECT issued");

    // ── ConnectStatus ────────────────────────────────────────────
    phases.push(SocksPhase::ConnectStatus);
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(ProxyError::MalformedReply.into());
    }
    if reply[1] != 0 {
        let err = ProxyError::from_reply_code(reply[1]);
        debug!(code = reply[1], %err, "proxy: CONNECT failed");
        return Err(err.into());
    }

    Ok(phases)
}

/// Read the two-byte method selection and require the expected method.
async fn expect_method<S>(stream: &mut S, expected: u8) -> Result<(), TernError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    if buf[0] != SOCKS_VERSION || buf[1] != expected {
        return Err(ProxyError::MethodRejected.into());
    }
    Ok(())
}

/// Read one CHAP sub-negotiation message: version, attribute count,
/// then (type, length, value) triples.
async fn read_chap_attrs<S>(stream: &mut S) -> Result<Vec<(u8, Vec<u8>)>, TernError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != 1 {
        return Err(ProxyError::MalformedReply.into());
    }
    let mut attrs = Vec::with_capacity(head[1] as usize);
    for _ in 0..head[1] {
        let mut th = [0u8; 2];
        stream.read_exact(&mut th).await?;
        let mut value = vec![0u8; th[1] as usize];
        stream.read_exact(&mut value).await?;
        attrs.push((th[0], value));
    }
    Ok(attrs)
}

/// HMAC-MD5 over the challenge, keyed by the proxy password.
fn hmac_md5(key: &[u8], message: &[u8]) -> [u8; 16] {
    const BLOCK: usize = 64;
    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        key_block[..16].copy_from_slice(&md5::compute(key).0);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Vec::with_capacity(BLOCK + message.len());
    inner.extend(key_block.iter().map(|b| b ^ 0x36));
    inner.extend_from_slice(message);
    let inner_digest = md5::compute(&inner);

    let mut outer = Vec::with_capacity(BLOCK + 16);
    outer.extend(key_block.iter().map(|b| b ^ 0x5C));
    outer.extend_from_slice(&inner_digest.0);
    md5::compute(&outer).0
}

// ── Tests ────────────────────────────────────────────────────────
