//! MySQL client/server protocol for the replication connection
//!
//! Implements the subset of the wire protocol a fake replica needs:
//! - Handshake v10 and authentication (mysql_native_password,
//!   caching_sha2_password fast path, auth switch)
//! - COM_QUERY with text result sets
//! - COM_REGISTER_SLAVE
//! - COM_BINLOG_DUMP / COM_BINLOG_DUMP_GTID
//! - Semi-sync acknowledgements
//!
//! The connection is generic over the byte stream so TLS or an in-memory
//! duplex can be layered underneath.

use crate::common::{CanalError, Result};
use crate::mysql::codec::ByteReader;
use crate::mysql::gtid::MysqlGtidSet;
use crate::mysql::packet::{PacketConn, MAX_PAYLOAD_LEN};
use crate::mysql::position::Position;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;
pub const COM_BINLOG_DUMP: u8 = 0x12;
pub const COM_REGISTER_SLAVE: u8 = 0x15;
pub const COM_BINLOG_DUMP_GTID: u8 = 0x1E;

pub const OK_HEADER: u8 = 0x00;
pub const AUTH_MORE_DATA_HEADER: u8 = 0x01;
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;

/// Marker byte in front of semi-sync event packets and acks
pub const SEMI_SYNC_INDICATOR: u8 = 0xEF;

/// `COM_BINLOG_DUMP` flag: return EOF instead of blocking at the end of the log
pub const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;
/// `COM_BINLOG_DUMP_GTID` flag: the GTID set decides the start point
pub const BINLOG_THROUGH_GTID: u16 = 0x04;

const AUTH_NATIVE_PASSWORD: &str = "mysql_native_password";
const AUTH_CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
const AUTH_SHA256_PASSWORD: &str = "sha256_password";

const CACHING_SHA2_FAST_AUTH_OK: u8 = 0x03;
const CACHING_SHA2_FULL_AUTH: u8 = 0x04;

/// MySQL capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_SSL: u32 = 0x0000_0800;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    pub fn has(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Collation id sent in the handshake response for a charset name.
pub fn collation_id(charset: &str) -> u8 {
    match charset.to_ascii_lowercase().as_str() {
        "utf8" | "utf8mb3" => 33,
        "latin1" => 8,
        "binary" => 63,
        "ascii" => 11,
        _ => 45,
    }
}

/// Initial greeting sent by the server (protocol v10).
#[derive(Debug, Clone)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: CapabilityFlags,
    pub character_set: u8,
    pub status_flags: u16,
    /// Scramble (both parts joined, trailing NUL removed)
    pub auth_data: Vec<u8>,
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);

        let protocol_version = r.u8()?;
        if protocol_version == ERR_HEADER {
            return Err(parse_err_packet(data));
        }
        if protocol_version != 10 {
            return Err(CanalError::protocol(format!(
                "unsupported handshake protocol version {}",
                protocol_version
            )));
        }

        let server_version = String::from_utf8_lossy(r.null_terminated()?).into_owned();
        let connection_id = r.u32_le()?;
        let mut auth_data = r.bytes(8)?.to_vec();
        r.skip(1)?;

        let cap_lower = r.u16_le()?;
        // pre-4.1 servers stop here
        if r.is_empty() {
            return Ok(Self {
                protocol_version,
                server_version,
                connection_id,
                capability_flags: CapabilityFlags::new(u32::from(cap_lower)),
                character_set: 0,
                status_flags: 0,
                auth_data,
                auth_plugin_name: AUTH_NATIVE_PASSWORD.to_string(),
            });
        }

        let character_set = r.u8()?;
        let status_flags = r.u16_le()?;
        let cap_upper = r.u16_le()?;
        let capability_flags =
            CapabilityFlags::new((u32::from(cap_upper) << 16) | u32::from(cap_lower));

        let auth_data_len = r.u8()? as usize;
        r.skip(10)?;

        if capability_flags.has(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let part2_len = auth_data_len.saturating_sub(8).max(13).min(r.remaining());
            let part2 = r.bytes(part2_len)?;
            let end = part2.iter().position(|&b| b == 0).unwrap_or(part2.len());
            auth_data.extend_from_slice(&part2[..end]);
        }

        let auth_plugin_name = if capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            let rest = r.rest();
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            String::from_utf8_lossy(&rest[..end]).into_owned()
        } else {
            AUTH_NATIVE_PASSWORD.to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            auth_data,
            auth_plugin_name,
        })
    }
}

/// Convert an ERR packet into a server error.
pub fn parse_err_packet(data: &[u8]) -> CanalError {
    match read_err_packet(data) {
        Ok((code, state, message)) => CanalError::Server {
            code,
            state,
            message,
        },
        Err(_) => CanalError::protocol("malformed ERR packet"),
    }
}

fn read_err_packet(data: &[u8]) -> Result<(u16, String, String)> {
    let mut r = ByteReader::new(data);
    r.skip(1)?;
    let code = r.u16_le()?;
    let mut state = String::new();
    if r.remaining() >= 6 && data.get(3) == Some(&b'#') {
        r.skip(1)?;
        state = String::from_utf8_lossy(r.bytes(5)?).into_owned();
    }
    let message = String::from_utf8_lossy(r.rest()).into_owned();
    Ok((code, state, message))
}

/// Text protocol result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Value of `column` in row `row`; `None` for NULL or unknown names.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Authenticated connection used to register as a replica and stream the binlog.
pub struct ReplicationConn<S> {
    conn: PacketConn<S>,
    server_version: String,
    connection_id: u32,
    capabilities: CapabilityFlags,
}

impl<S> std::fmt::Debug for ReplicationConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationConn")
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Open a TCP connection bounded by `connect_timeout`.
pub async fn connect_tcp(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            CanalError::timeout(format!(
                "connecting to {} timed out after {:?}",
                addr, connect_timeout
            ))
        })?
        .map_err(|e| CanalError::connection_broken(format!("connect to {}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl<S> ReplicationConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the handshake and authenticate over an established stream.
    pub async fn handshake(
        stream: S,
        user: &str,
        password: &str,
        database: Option<&str>,
        charset: &str,
    ) -> Result<Self> {
        let mut conn = PacketConn::new(stream);

        let greeting = conn.read_packet().await?;
        let handshake = HandshakePacket::parse(&greeting)?;
        debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            plugin = %handshake.auth_plugin_name,
            "received handshake"
        );

        let mut client_flags = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_LONG_FLAG
            | CapabilityFlags::CLIENT_TRANSACTIONS
            | CapabilityFlags::CLIENT_MULTI_RESULTS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_DEPRECATE_EOF;
        if database.is_some() {
            client_flags |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        let capabilities = CapabilityFlags::new(client_flags & handshake.capability_flags.value());

        let mut plugin = handshake.auth_plugin_name.clone();
        if plugin.is_empty() {
            plugin = AUTH_NATIVE_PASSWORD.to_string();
        }
        let auth_response = match plugin.as_str() {
            AUTH_NATIVE_PASSWORD => mysql_native_password(password, &handshake.auth_data),
            AUTH_CACHING_SHA2_PASSWORD => caching_sha2_password(password, &handshake.auth_data),
            other => {
                warn!(plugin = other, "unknown auth plugin, trying mysql_native_password");
                plugin = AUTH_NATIVE_PASSWORD.to_string();
                mysql_native_password(password, &handshake.auth_data)
            }
        };

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PAYLOAD_LEN as u32);
        response.put_u8(collation_id(charset));
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        if let Some(db) = database {
            response.put_slice(db.as_bytes());
            response.put_u8(0);
        }
        response.put_slice(plugin.as_bytes());
        response.put_u8(0);
        conn.write_packet(&response).await?;

        let mut this = Self {
            conn,
            server_version: handshake.server_version,
            connection_id: handshake.connection_id,
            capabilities,
        };
        this.finish_auth(plugin, password).await?;

        info!(
            server_version = %this.server_version,
            connection_id = this.connection_id,
            "authenticated replication connection"
        );
        Ok(this)
    }

    /// Follow auth switch and auth-more-data exchanges until OK or ERR.
    async fn finish_auth(&mut self, mut plugin: String, password: &str) -> Result<()> {
        loop {
            let resp = self.conn.read_packet().await?;
            match resp.first().copied() {
                Some(OK_HEADER) => return Ok(()),
                Some(ERR_HEADER) => return Err(parse_err_packet(&resp)),
                Some(EOF_HEADER) => {
                    let mut r = ByteReader::new(&resp[1..]);
                    plugin = String::from_utf8_lossy(r.null_terminated()?).into_owned();
                    let rest = r.rest();
                    let salt = rest.strip_suffix(&[0u8]).unwrap_or(rest);
                    debug!(plugin = %plugin, "auth switch requested");

                    let data = match plugin.as_str() {
                        AUTH_NATIVE_PASSWORD => mysql_native_password(password, salt),
                        AUTH_CACHING_SHA2_PASSWORD => caching_sha2_password(password, salt),
                        AUTH_SHA256_PASSWORD if password.is_empty() => vec![0],
                        other => {
                            return Err(CanalError::config(format!(
                                "unsupported auth plugin {}",
                                other
                            )))
                        }
                    };
                    self.conn.write_packet(&data).await?;
                }
                Some(AUTH_MORE_DATA_HEADER) if plugin == AUTH_CACHING_SHA2_PASSWORD => {
                    match resp.get(1).copied() {
                        Some(CACHING_SHA2_FAST_AUTH_OK) => {
                            debug!("caching_sha2_password fast auth succeeded");
                        }
                        Some(CACHING_SHA2_FULL_AUTH) => {
                            return Err(CanalError::config(
                                "caching_sha2_password full authentication requires a secure connection; \
                                 log in once over TLS or use mysql_native_password",
                            ))
                        }
                        _ => return Err(CanalError::protocol("malformed auth more data packet")),
                    }
                }
                Some(other) => {
                    return Err(CanalError::protocol(format!(
                        "unexpected auth response 0x{:02X}",
                        other
                    )))
                }
                None => return Err(CanalError::protocol("empty auth response")),
            }
        }
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    /// Read the next packet of the current command.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        self.conn.read_packet().await
    }

    /// Run a statement that returns no rows.
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.query(sql).await.map(|_| ())
    }

    /// Run a statement through COM_QUERY and collect its text result set.
    ///
    /// Statements answered by a bare OK return an empty result set.
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet> {
        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(COM_QUERY);
        packet.put_slice(sql.as_bytes());
        self.conn.write_command(&packet).await?;

        let first = self.conn.read_packet().await?;
        match first.first().copied() {
            Some(OK_HEADER) => return Ok(ResultSet::default()),
            Some(ERR_HEADER) => return Err(parse_err_packet(&first)),
            Some(LOCAL_INFILE_HEADER) => {
                return Err(CanalError::protocol("LOCAL INFILE requests are not supported"))
            }
            None => return Err(CanalError::protocol("empty query response")),
            _ => {}
        }

        let column_count = ByteReader::new(&first).packed_int()? as usize;
        // a table has at most 4096 columns
        let mut columns = Vec::with_capacity(column_count.min(4096));
        for _ in 0..column_count {
            let def = self.conn.read_packet().await?;
            columns.push(parse_column_name(&def)?);
        }
        if !self.capabilities.has(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
            let eof = self.conn.read_packet().await?;
            if !is_eof_packet(&eof) {
                return Err(CanalError::protocol("missing EOF after column definitions"));
            }
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.conn.read_packet().await?;
            if is_eof_packet(&packet) {
                break;
            }
            if packet.first() == Some(&ERR_HEADER) {
                return Err(parse_err_packet(&packet));
            }
            let mut r = ByteReader::new(&packet);
            let mut row = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                row.push(
                    r.lenenc_bytes()?
                        .map(|b| String::from_utf8_lossy(b).into_owned()),
                );
            }
            rows.push(row);
        }

        Ok(ResultSet { columns, rows })
    }

    /// Announce this connection as a replica (COM_REGISTER_SLAVE).
    pub async fn register_slave(
        &mut self,
        server_id: u32,
        host: &str,
        user: &str,
        password: &str,
        port: u16,
    ) -> Result<()> {
        let mut packet = BytesMut::with_capacity(32 + host.len() + user.len() + password.len());
        packet.put_u8(COM_REGISTER_SLAVE);
        packet.put_u32_le(server_id);
        put_short_string(&mut packet, host);
        put_short_string(&mut packet, user);
        put_short_string(&mut packet, password);
        packet.put_u16_le(port);
        // replication rank, master id
        packet.put_u32_le(0);
        packet.put_u32_le(0);
        self.conn.write_command(&packet).await?;

        let resp = self.conn.read_packet().await?;
        match resp.first().copied() {
            Some(OK_HEADER) => {
                info!(server_id, "registered as replica");
                Ok(())
            }
            Some(ERR_HEADER) => Err(parse_err_packet(&resp)),
            _ => Err(CanalError::protocol("unexpected COM_REGISTER_SLAVE response")),
        }
    }

    /// Start a file/position based dump (COM_BINLOG_DUMP).
    pub async fn binlog_dump(&mut self, server_id: u32, pos: &Position, flags: u16) -> Result<()> {
        let mut packet = BytesMut::with_capacity(11 + pos.name.len());
        packet.put_u8(COM_BINLOG_DUMP);
        packet.put_u32_le(pos.pos);
        packet.put_u16_le(flags);
        packet.put_u32_le(server_id);
        packet.put_slice(pos.name.as_bytes());
        self.conn.write_command(&packet).await?;
        info!(server_id, position = %pos, "started binlog dump");
        Ok(())
    }

    /// Start a GTID based dump (COM_BINLOG_DUMP_GTID).
    pub async fn binlog_dump_gtid(&mut self, server_id: u32, gtid_set: &MysqlGtidSet) -> Result<()> {
        let data = gtid_set.encode();
        let mut packet = BytesMut::with_capacity(27 + data.len());
        packet.put_u8(COM_BINLOG_DUMP_GTID);
        packet.put_u16_le(BINLOG_THROUGH_GTID);
        packet.put_u32_le(server_id);
        // empty file name, start offset
        packet.put_u32_le(0);
        packet.put_u64_le(4);
        packet.put_u32_le(data.len() as u32);
        packet.put_slice(&data);
        self.conn.write_command(&packet).await?;
        info!(server_id, gtid_set = %gtid_set, "started GTID binlog dump");
        Ok(())
    }

    /// Acknowledge a semi-sync event.
    pub async fn send_semi_sync_ack(&mut self, pos: &Position) -> Result<()> {
        let mut packet = BytesMut::with_capacity(9 + pos.name.len());
        packet.put_u8(SEMI_SYNC_INDICATOR);
        packet.put_u64_le(u64::from(pos.pos));
        packet.put_slice(pos.name.as_bytes());
        self.conn.write_command(&packet).await
    }

    /// Send COM_QUIT and shut the stream down; errors are ignored.
    pub async fn close(&mut self) {
        if let Err(e) = self.conn.write_command(&[COM_QUIT]).await {
            debug!(error = %e, "COM_QUIT failed");
        }
        let _ = self.conn.shutdown().await;
    }
}

fn put_short_string(buf: &mut BytesMut, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(255)];
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
}

/// EOF or OK-with-0xFE terminator (a row never starts with 0xFE below 16MB).
fn is_eof_packet(packet: &[u8]) -> bool {
    packet.first() == Some(&EOF_HEADER) && packet.len() < MAX_PAYLOAD_LEN
}

/// Column name out of a protocol 4.1 column definition.
fn parse_column_name(def: &[u8]) -> Result<String> {
    let mut r = ByteReader::new(def);
    // catalog, schema, table, org_table
    for _ in 0..4 {
        r.lenenc_bytes()?;
    }
    r.lenenc_string()
}

/// SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
pub fn mysql_native_password(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + salt))
pub fn caching_sha2_password(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hash1 = Sha256::digest(password.as_bytes());
    let hash2 = Sha256::digest(hash1);
    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(salt);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}
