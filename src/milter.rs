use anyhow::{bail, Context, Result};
use bytes::{Buf, BytesMut};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

const MILTER_VERSION: u32 = 6;
const MAX_PACKET_LEN: usize = 1024 * 1024;

// SMFIF_* action flags
const ACTION_ADDHDRS: u32 = 0x01;
const ACTION_ADDRCPT: u32 = 0x04;
const ACTION_DELRCPT: u32 = 0x08;
const ACTION_CHGHDRS: u32 = 0x10;
const ACTION_CHGFROM: u32 = 0x40;

const ACTIONS: u32 =
    ACTION_ADDHDRS | ACTION_ADDRCPT | ACTION_DELRCPT | ACTION_CHGHDRS | ACTION_CHGFROM;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilterResult {
    Continue,
    Accept,
    Reject,
    TempFail,
}

impl MilterResult {
    fn code(self) -> u8 {
        match self {
            MilterResult::Continue => b'c',
            MilterResult::Accept => b'a',
            MilterResult::Reject => b'r',
            MilterResult::TempFail => b't',
        }
    }
}

/// Message edits sent back to the MTA at end of message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    AddHeader { name: String, value: String },
    /// An empty value deletes the `index`-th (1-based) header called `name`.
    ChangeHeader { index: u32, name: String, value: String },
    ChangeFrom(String),
    AddRecipient(String),
    DeleteRecipient(String),
}

impl Modification {
    fn encode(&self) -> Vec<u8> {
        match self {
            Modification::AddHeader { name, value } => {
                create_response(b'h', &cstrings(&[name, value]))
            }
            Modification::ChangeHeader { index, name, value } => {
                let mut data = index.to_be_bytes().to_vec();
                data.extend_from_slice(&cstrings(&[name, value]));
                create_response(b'm', &data)
            }
            Modification::ChangeFrom(from) => create_response(b'e', &cstrings(&[from])),
            Modification::AddRecipient(rcpt) => create_response(b'+', &cstrings(&[rcpt])),
            Modification::DeleteRecipient(rcpt) => create_response(b'-', &cstrings(&[rcpt])),
        }
    }
}

/// Event handlers for one filter. Each connection gets its own `Session`,
/// created fresh and dropped when the MTA disconnects.
#[async_trait::async_trait]
pub trait MilterCallbacks: Send + Sync + 'static {
    type Session: Default + Send;

    async fn connect(
        &self,
        session: &mut Self::Session,
        ctx_id: &str,
        hostname: &str,
        addr: &str,
    ) -> MilterResult {
        let _ = (session, ctx_id, hostname, addr);
        MilterResult::Continue
    }
    async fn mail_from(&self, session: &mut Self::Session, ctx_id: &str, args: &[String]) -> MilterResult;
    async fn rcpt_to(&self, session: &mut Self::Session, ctx_id: &str, args: &[String]) -> MilterResult;
    async fn header(&self, session: &mut Self::Session, ctx_id: &str, name: &str, value: &str) -> MilterResult;
    async fn end_of_headers(&self, session: &mut Self::Session, ctx_id: &str) -> MilterResult {
        let _ = (session, ctx_id);
        MilterResult::Continue
    }
    async fn body(&self, session: &mut Self::Session, ctx_id: &str, chunk: &[u8]) -> MilterResult;
    async fn end_of_message(
        &self,
        session: &mut Self::Session,
        ctx_id: &str,
    ) -> (Vec<Modification>, MilterResult);
    async fn abort(&self, session: &mut Self::Session, ctx_id: &str);
    async fn close(&self, session: &mut Self::Session, ctx_id: &str);
}

pub struct MilterServer<T: MilterCallbacks> {
    callbacks: Arc<T>,
}

impl<T: MilterCallbacks> MilterServer<T> {
    pub fn new(callbacks: T) -> Self {
        Self {
            callbacks: Arc::new(callbacks),
        }
    }

    pub async fn run(&self, socket_path: &Path) -> Result<()> {
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?;

        info!("Milter server listening on: {:?}", socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let callbacks = self.callbacks.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &*callbacks).await {
                            error!("Error handling connection: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Drive one MTA connection until it quits or hangs up.
pub async fn handle_connection<S, T>(mut stream: S, callbacks: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: MilterCallbacks,
{
    let ctx_id = uuid::Uuid::new_v4().to_string();
    debug!(ctx_id = %ctx_id, "New milter connection");

    let mut session = T::Session::default();
    let mut buffer = BytesMut::with_capacity(8192);

    loop {
        let n = match stream.read_buf(&mut buffer).await {
            Ok(n) => n,
            Err(e) => {
                callbacks.close(&mut session, &ctx_id).await;
                return Err(e).context("Failed to read from stream");
            }
        };

        if n == 0 {
            debug!(ctx_id = %ctx_id, "Connection closed");
            callbacks.close(&mut session, &ctx_id).await;
            return Ok(());
        }

        while let Some((command, data)) = parse_milter_message(&mut buffer)? {
            if command == b'Q' {
                debug!(ctx_id = %ctx_id, "Quit");
                callbacks.close(&mut session, &ctx_id).await;
                return Ok(());
            }

            let responses =
                process_milter_command(&ctx_id, command, &data, callbacks, &mut session).await?;
            for response in responses {
                stream
                    .write_all(&response)
                    .await
                    .with_context(|| format!("Failed to write response for ctx {}", ctx_id))?;
            }
        }
    }
}

fn parse_milter_message(buffer: &mut BytesMut) -> Result<Option<(u8, Vec<u8>)>> {
    if buffer.len() < 4 {
        return Ok(None);
    }

    // Read message length (4 bytes, big-endian), command byte included
    let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if length == 0 {
        bail!("Empty milter packet");
    }
    if length > MAX_PACKET_LEN {
        bail!("Milter packet too large: {} bytes", length);
    }

    if buffer.len() < 4 + length {
        return Ok(None);
    }

    buffer.advance(4);
    let packet = buffer.split_to(length);
    Ok(Some((packet[0], packet[1..].to_vec())))
}

async fn process_milter_command<T: MilterCallbacks>(
    ctx_id: &str,
    command: u8,
    data: &[u8],
    callbacks: &T,
    session: &mut T::Session,
) -> Result<Vec<Vec<u8>>> {
    let result = match command {
        b'O' => {
            // SMFIC_OPTNEG
            let (version, actions, _protocol) = parse_optneg_data(data)?;
            debug!(ctx_id = %ctx_id, version, actions, "Option negotiation");
            if actions & ACTIONS != ACTIONS {
                warn!(ctx_id = %ctx_id, offered = actions, "MTA does not allow all header and envelope modifications");
            }

            let mut reply = Vec::with_capacity(12);
            reply.extend_from_slice(&version.min(MILTER_VERSION).to_be_bytes());
            reply.extend_from_slice(&(actions & ACTIONS).to_be_bytes());
            reply.extend_from_slice(&0u32.to_be_bytes());
            return Ok(vec![create_response(b'O', &reply)]);
        }
        b'D' => {
            // SMFIC_MACRO, never answered
            return Ok(Vec::new());
        }
        b'C' => {
            // SMFIC_CONNECT
            let (hostname, addr) = parse_connect_data(data);
            debug!(ctx_id = %ctx_id, hostname = %hostname, addr = %addr, "Connect");
            callbacks.connect(session, ctx_id, &hostname, &addr).await
        }
        b'H' | b'T' | b'U' => MilterResult::Continue,
        b'M' => {
            // SMFIC_MAIL - MAIL FROM
            let args = parse_string_list(data);
            debug!(ctx_id = %ctx_id, args = ?args, "Mail from");
            callbacks.mail_from(session, ctx_id, &args).await
        }
        b'R' => {
            // SMFIC_RCPT - RCPT TO
            let args = parse_string_list(data);
            debug!(ctx_id = %ctx_id, args = ?args, "Rcpt to");
            callbacks.rcpt_to(session, ctx_id, &args).await
        }
        b'L' => {
            // SMFIC_HEADER
            let (name, value) = parse_header_data(data);
            debug!(ctx_id = %ctx_id, name = %name, "Header");
            callbacks.header(session, ctx_id, &name, &value).await
        }
        b'N' => {
            // SMFIC_EOH
            callbacks.end_of_headers(session, ctx_id).await
        }
        b'B' => {
            // SMFIC_BODY
            debug!(ctx_id = %ctx_id, size = data.len(), "Body chunk");
            callbacks.body(session, ctx_id, data).await
        }
        b'E' => {
            // SMFIC_BODYEOB
            debug!(ctx_id = %ctx_id, "End of message");
            let (modifications, result) = callbacks.end_of_message(session, ctx_id).await;
            let mut responses: Vec<Vec<u8>> = modifications.iter().map(Modification::encode).collect();
            responses.push(create_response(result.code(), &[]));
            return Ok(responses);
        }
        b'A' | b'K' => {
            // SMFIC_ABORT / SMFIC_QUIT_NC: drop the transaction, no reply
            debug!(ctx_id = %ctx_id, command = %(command as char), "Abort");
            callbacks.abort(session, ctx_id).await;
            return Ok(Vec::new());
        }
        _ => {
            warn!(ctx_id = %ctx_id, command = command, "Unknown milter command");
            MilterResult::Continue
        }
    };

    Ok(vec![create_response(result.code(), &[])])
}

fn create_response(command: u8, data: &[u8]) -> Vec<u8> {
    let length = (data.len() + 1) as u32;
    let mut response = Vec::with_capacity(4 + data.len() + 1);

    response.extend_from_slice(&length.to_be_bytes());
    response.push(command);
    response.extend_from_slice(data);

    response
}

fn cstrings(values: &[&String]) -> Vec<u8> {
    let mut data = Vec::new();
    for value in values {
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

fn parse_optneg_data(data: &[u8]) -> Result<(u32, u32, u32)> {
    if data.len() < 12 {
        bail!("Option negotiation packet too short: {} bytes", data.len());
    }
    let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    Ok((word(0), word(4), word(8)))
}

/// `hostname\0 family [port] address\0`
fn parse_connect_data(data: &[u8]) -> (String, String) {
    let mut parts = data.splitn(2, |b| *b == 0);
    let hostname = String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();
    let rest = parts.next().unwrap_or_default();

    let addr = match rest.split_first() {
        Some((b'4' | b'6', tail)) if tail.len() >= 2 => {
            String::from_utf8_lossy(&tail[2..]).trim_end_matches('\0').to_string()
        }
        Some((b'L', tail)) => String::from_utf8_lossy(tail).trim_end_matches('\0').to_string(),
        _ => "unknown".to_string(),
    };

    (hostname, addr)
}

fn parse_string_list(data: &[u8]) -> Vec<String> {
    data.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
        .collect()
}

fn parse_header_data(data: &[u8]) -> (String, String) {
    let mut parts = data.splitn(2, |b| *b == 0);
    let name = String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();
    let value = String::from_utf8_lossy(parts.next().unwrap_or_default())
        .trim_end_matches('\0')
        .to_string();
    (name, value)
}
