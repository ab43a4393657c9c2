//! DCP wire frames.
//!
//! Length-prefixed binary framing with a 24-byte fixed header; all
//! multi-byte fields big-endian. Two request magics distinguish the plain
//! client encoding from the alt encoding that carries framing extras (the
//! stream-id). Responses reuse the partition field for a status code.
//!
//! ```text
//! +--------+--------+----------+----------+
//! | magic  | opcode | key len  (2 bytes)  |
//! +--------+--------+----------+----------+
//! | extras | dtype  | vbucket / status    |
//! +--------+--------+---------------------+
//! |           total body length           |
//! +---------------------------------------+
//! |                opaque                 |
//! +---------------------------------------+
//! |                 cas                   |
//! |                (8 bytes)              |
//! +---------------------------------------+
//! ```

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::errinval;
use crate::error::{Error, Result};
use crate::failover::FailoverEntry;
use crate::item::{Datatype, DocKey, DurabilityLevel, Vbid};
use crate::vbstate::VbState;

pub const HEADER_SIZE: usize = 24;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;
/// Alt request magic: body is prefixed by framing extras (stream-id).
pub const MAGIC_ALT_REQUEST: u8 = 0x08;

pub const STATUS_SUCCESS: u16 = 0x00;
pub const STATUS_ROLLBACK: u16 = 0x23;

pub mod opcode {
    pub const DCP_PREPARE: u8 = 0x53;
    pub const DCP_SEQNO_ACK: u8 = 0x54;
    pub const DCP_COMMIT: u8 = 0x55;
    /// Consumer->producer direction only.
    pub const DCP_STREAM_REQ: u8 = 0x56;
    /// Producer->consumer direction only (same code as STREAM_REQ).
    pub const DCP_ABORT: u8 = 0x56;
    pub const DCP_MUTATION: u8 = 0x57;
    pub const DCP_DELETION: u8 = 0x58;
    pub const DCP_EXPIRATION: u8 = 0x59;
    pub const DCP_SNAPSHOT_MARKER: u8 = 0x5a;
    pub const DCP_SET_VBUCKET_STATE: u8 = 0x5b;
    pub const DCP_NOOP: u8 = 0x5c;
    pub const DCP_BUFFER_ACK: u8 = 0x5d;
    pub const DCP_CONTROL: u8 = 0x5e;
    pub const DCP_SYSTEM_EVENT: u8 = 0x5f;
    pub const DCP_STREAM_END: u8 = 0x60;
}

/// Snapshot marker flags.
pub mod snapshot {
    pub const MEMORY: u32 = 0x01;
    pub const DISK: u32 = 0x02;
    pub const CHECKPOINT: u32 = 0x04;
    pub const ACK: u32 = 0x08;
}

/// Stream request flags.
pub mod stream_flags {
    pub const TAKEOVER: u32 = 0x01;
    pub const DISK_ONLY: u32 = 0x02;
    pub const LATEST: u32 = 0x04;
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    Ok,
    StateChanged,
    Rollback,
    Disconnected,
    ClosedByConsumer,
}

impl StreamEndReason {
    pub fn to_wire(self) -> u32 {
        match self {
            StreamEndReason::Ok => 0,
            StreamEndReason::StateChanged => 1,
            StreamEndReason::Rollback => 2,
            StreamEndReason::Disconnected => 3,
            StreamEndReason::ClosedByConsumer => 4,
        }
    }

    pub fn from_wire(v: u32) -> Result<Self> {
        match v {
            0 => Ok(StreamEndReason::Ok),
            1 => Ok(StreamEndReason::StateChanged),
            2 => Ok(StreamEndReason::Rollback),
            3 => Ok(StreamEndReason::Disconnected),
            4 => Ok(StreamEndReason::ClosedByConsumer),
            other => Err(errinval!("unknown stream end reason {other}")),
        }
    }
}

fn vbstate_to_wire(state: VbState) -> u8 {
    match state {
        VbState::Active => 0x01,
        VbState::Replica => 0x02,
        VbState::Pending => 0x03,
        VbState::Dead => 0x04,
    }
}

fn vbstate_from_wire(v: u8) -> Result<VbState> {
    match v {
        0x01 => Ok(VbState::Active),
        0x02 => Ok(VbState::Replica),
        0x03 => Ok(VbState::Pending),
        0x04 => Ok(VbState::Dead),
        other => Err(errinval!("unknown vbucket state {other:#04x}")),
    }
}

/// A parsed or to-be-encoded DCP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DcpMessage {
    StreamReq {
        vbid: Vbid,
        opaque: u32,
        flags: u32,
        start_seqno: u64,
        end_seqno: u64,
        uuid: u64,
        snap_start: u64,
        snap_end: u64,
    },
    /// Success response to a stream request; body is the failover log.
    StreamReqOk {
        opaque: u32,
        failover_log: Vec<FailoverEntry>,
    },
    /// Rollback response to a stream request.
    StreamReqRollback { opaque: u32, rollback_seqno: u64 },
    SnapshotMarker {
        vbid: Vbid,
        opaque: u32,
        start: u64,
        end: u64,
        flags: u32,
    },
    Mutation {
        vbid: Vbid,
        opaque: u32,
        key: DocKey,
        value: Vec<u8>,
        by_seqno: u64,
        rev_seqno: u64,
        cas: u64,
        flags: u32,
        expiration: u32,
        lock_time: u32,
        datatype: Datatype,
        nru: u8,
        stream_id: Option<u16>,
    },
    /// delete_time None encodes the v1 frame, Some the v2 frame.
    Deletion {
        vbid: Vbid,
        opaque: u32,
        key: DocKey,
        by_seqno: u64,
        rev_seqno: u64,
        cas: u64,
        delete_time: Option<u32>,
        stream_id: Option<u16>,
    },
    Expiration {
        vbid: Vbid,
        opaque: u32,
        key: DocKey,
        by_seqno: u64,
        rev_seqno: u64,
        cas: u64,
        delete_time: u32,
        stream_id: Option<u16>,
    },
    Prepare {
        vbid: Vbid,
        opaque: u32,
        key: DocKey,
        value: Vec<u8>,
        by_seqno: u64,
        rev_seqno: u64,
        cas: u64,
        flags: u32,
        expiration: u32,
        lock_time: u32,
        datatype: Datatype,
        nru: u8,
        durability: DurabilityLevel,
    },
    Commit {
        vbid: Vbid,
        opaque: u32,
        key: DocKey,
        prepared_seqno: u64,
        commit_seqno: u64,
    },
    Abort {
        vbid: Vbid,
        opaque: u32,
        key: DocKey,
        prepared_seqno: u64,
        abort_seqno: u64,
    },
    SeqnoAck {
        vbid: Vbid,
        opaque: u32,
        mem_seqno: u64,
        disk_seqno: u64,
    },
    SetVbState {
        vbid: Vbid,
        opaque: u32,
        state: VbState,
    },
    SystemEvent {
        vbid: Vbid,
        opaque: u32,
        key: DocKey,
        value: Vec<u8>,
        by_seqno: u64,
        id: u32,
        version: u8,
    },
    StreamEnd {
        vbid: Vbid,
        opaque: u32,
        reason: StreamEndReason,
    },
    Noop { opaque: u32 },
    BufferAck { opaque: u32, bytes: u32 },
    Control {
        opaque: u32,
        key: String,
        value: String,
    },
}

struct FrameWriter {
    magic: u8,
    opcode: u8,
    datatype: u8,
    vbucket_or_status: u16,
    opaque: u32,
    cas: u64,
    framing: Vec<u8>,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl FrameWriter {
    fn new(magic: u8, opcode: u8, vbucket_or_status: u16, opaque: u32) -> Self {
        Self {
            magic,
            opcode,
            datatype: 0,
            vbucket_or_status,
            opaque,
            cas: 0,
            framing: Vec::new(),
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    fn finish(self) -> Vec<u8> {
        let body_len = self.framing.len() + self.extras.len() + self.key.len() + self.value.len();
        let mut out = Vec::with_capacity(HEADER_SIZE + body_len);
        out.push(self.magic);
        out.push(self.opcode);
        if self.magic == MAGIC_ALT_REQUEST {
            out.push(self.framing.len() as u8);
            out.push(self.key.len() as u8);
        } else {
            out.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        }
        out.push(self.extras.len() as u8);
        out.push(self.datatype);
        out.extend_from_slice(&self.vbucket_or_status.to_be_bytes());
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.extend_from_slice(&self.opaque.to_be_bytes());
        out.extend_from_slice(&self.cas.to_be_bytes());
        out.extend_from_slice(&self.framing);
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        out
    }
}

impl DcpMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DcpMessage::StreamReq {
                vbid,
                opaque,
                flags,
                start_seqno,
                end_seqno,
                uuid,
                snap_start,
                snap_end,
            } => {
                let mut w =
                    FrameWriter::new(MAGIC_REQUEST, opcode::DCP_STREAM_REQ, vbid.0, *opaque);
                w.extras.extend_from_slice(&(*flags).to_be_bytes());
                w.extras.extend_from_slice(&(*start_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*end_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*uuid).to_be_bytes());
                w.extras.extend_from_slice(&(*snap_start).to_be_bytes());
                w.extras.extend_from_slice(&(*snap_end).to_be_bytes());
                w.finish()
            }
            DcpMessage::StreamReqOk {
                opaque,
                failover_log,
            } => {
                let mut w = FrameWriter::new(
                    MAGIC_RESPONSE,
                    opcode::DCP_STREAM_REQ,
                    STATUS_SUCCESS,
                    *opaque,
                );
                for entry in failover_log {
                    w.value.extend_from_slice(&(entry.uuid).to_be_bytes());
                    w.value.extend_from_slice(&(entry.seqno).to_be_bytes());
                }
                w.finish()
            }
            DcpMessage::StreamReqRollback {
                opaque,
                rollback_seqno,
            } => {
                let mut w = FrameWriter::new(
                    MAGIC_RESPONSE,
                    opcode::DCP_STREAM_REQ,
                    STATUS_ROLLBACK,
                    *opaque,
                );
                w.value.extend_from_slice(&(*rollback_seqno).to_be_bytes());
                w.finish()
            }
            DcpMessage::SnapshotMarker {
                vbid,
                opaque,
                start,
                end,
                flags,
            } => {
                let mut w =
                    FrameWriter::new(MAGIC_REQUEST, opcode::DCP_SNAPSHOT_MARKER, vbid.0, *opaque);
                w.extras.extend_from_slice(&(*start).to_be_bytes());
                w.extras.extend_from_slice(&(*end).to_be_bytes());
                w.extras.extend_from_slice(&(*flags).to_be_bytes());
                w.finish()
            }
            DcpMessage::Mutation {
                vbid,
                opaque,
                key,
                value,
                by_seqno,
                rev_seqno,
                cas,
                flags,
                expiration,
                lock_time,
                datatype,
                nru,
                stream_id,
            } => {
                let magic = if stream_id.is_some() {
                    MAGIC_ALT_REQUEST
                } else {
                    MAGIC_REQUEST
                };
                let mut w = FrameWriter::new(magic, opcode::DCP_MUTATION, vbid.0, *opaque);
                if let Some(sid) = stream_id {
                    w.framing.extend_from_slice(&sid.to_be_bytes());
                }
                w.datatype = datatype.0;
                w.cas = *cas;
                w.extras.extend_from_slice(&(*by_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*rev_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*flags).to_be_bytes());
                w.extras.extend_from_slice(&(*expiration).to_be_bytes());
                w.extras.extend_from_slice(&(*lock_time).to_be_bytes());
                w.extras.extend_from_slice(&0u16.to_be_bytes()); // nmeta
                w.extras.push(*nru);
                w.key = key.key.clone();
                w.value = value.clone();
                w.finish()
            }
            DcpMessage::Deletion {
                vbid,
                opaque,
                key,
                by_seqno,
                rev_seqno,
                cas,
                delete_time,
                stream_id,
            } => {
                let magic = if stream_id.is_some() {
                    MAGIC_ALT_REQUEST
                } else {
                    MAGIC_REQUEST
                };
                let mut w = FrameWriter::new(magic, opcode::DCP_DELETION, vbid.0, *opaque);
                if let Some(sid) = stream_id {
                    w.framing.extend_from_slice(&sid.to_be_bytes());
                }
                w.cas = *cas;
                w.extras.extend_from_slice(&(*by_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*rev_seqno).to_be_bytes());
                match delete_time {
                    // v2 frame
                    Some(t) => w.extras.extend_from_slice(&t.to_be_bytes()),
                    // v1 frame: a 2-byte nmeta instead of the delete time
                    None => w.extras.extend_from_slice(&0u16.to_be_bytes()),
                }
                w.key = key.key.clone();
                w.finish()
            }
            DcpMessage::Expiration {
                vbid,
                opaque,
                key,
                by_seqno,
                rev_seqno,
                cas,
                delete_time,
                stream_id,
            } => {
                let magic = if stream_id.is_some() {
                    MAGIC_ALT_REQUEST
                } else {
                    MAGIC_REQUEST
                };
                let mut w = FrameWriter::new(magic, opcode::DCP_EXPIRATION, vbid.0, *opaque);
                if let Some(sid) = stream_id {
                    w.framing.extend_from_slice(&sid.to_be_bytes());
                }
                w.cas = *cas;
                w.extras.extend_from_slice(&(*by_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*rev_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*delete_time).to_be_bytes());
                w.key = key.key.clone();
                w.finish()
            }
            DcpMessage::Prepare {
                vbid,
                opaque,
                key,
                value,
                by_seqno,
                rev_seqno,
                cas,
                flags,
                expiration,
                lock_time,
                datatype,
                nru,
                durability,
            } => {
                let mut w = FrameWriter::new(MAGIC_REQUEST, opcode::DCP_PREPARE, vbid.0, *opaque);
                w.datatype = datatype.0;
                w.cas = *cas;
                w.extras.extend_from_slice(&(*by_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*rev_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*flags).to_be_bytes());
                w.extras.extend_from_slice(&(*expiration).to_be_bytes());
                w.extras.extend_from_slice(&(*lock_time).to_be_bytes());
                w.extras.push(*nru);
                w.extras.push(durability.to_wire());
                w.key = key.key.clone();
                w.value = value.clone();
                w.finish()
            }
            DcpMessage::Commit {
                vbid,
                opaque,
                key,
                prepared_seqno,
                commit_seqno,
            } => {
                let mut w = FrameWriter::new(MAGIC_REQUEST, opcode::DCP_COMMIT, vbid.0, *opaque);
                w.extras.extend_from_slice(&(*prepared_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*commit_seqno).to_be_bytes());
                w.key = key.key.clone();
                w.finish()
            }
            DcpMessage::Abort {
                vbid,
                opaque,
                key,
                prepared_seqno,
                abort_seqno,
            } => {
                let mut w = FrameWriter::new(MAGIC_REQUEST, opcode::DCP_ABORT, vbid.0, *opaque);
                w.extras.extend_from_slice(&(*prepared_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*abort_seqno).to_be_bytes());
                w.key = key.key.clone();
                w.finish()
            }
            DcpMessage::SeqnoAck {
                vbid,
                opaque,
                mem_seqno,
                disk_seqno,
            } => {
                let mut w =
                    FrameWriter::new(MAGIC_REQUEST, opcode::DCP_SEQNO_ACK, vbid.0, *opaque);
                w.extras.extend_from_slice(&(*mem_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*disk_seqno).to_be_bytes());
                w.finish()
            }
            DcpMessage::SetVbState {
                vbid,
                opaque,
                state,
            } => {
                let mut w = FrameWriter::new(
                    MAGIC_REQUEST,
                    opcode::DCP_SET_VBUCKET_STATE,
                    vbid.0,
                    *opaque,
                );
                w.extras.push(vbstate_to_wire(*state));
                w.finish()
            }
            DcpMessage::SystemEvent {
                vbid,
                opaque,
                key,
                value,
                by_seqno,
                id,
                version,
            } => {
                let mut w =
                    FrameWriter::new(MAGIC_REQUEST, opcode::DCP_SYSTEM_EVENT, vbid.0, *opaque);
                w.extras.extend_from_slice(&(*by_seqno).to_be_bytes());
                w.extras.extend_from_slice(&(*id).to_be_bytes());
                w.extras.push(*version);
                w.key = key.key.clone();
                w.value = value.clone();
                w.finish()
            }
            DcpMessage::StreamEnd {
                vbid,
                opaque,
                reason,
            } => {
                let mut w =
                    FrameWriter::new(MAGIC_REQUEST, opcode::DCP_STREAM_END, vbid.0, *opaque);
                w.extras.extend_from_slice(&(reason.to_wire()).to_be_bytes());
                w.finish()
            }
            DcpMessage::Noop { opaque } => {
                FrameWriter::new(MAGIC_REQUEST, opcode::DCP_NOOP, 0, *opaque).finish()
            }
            DcpMessage::BufferAck { opaque, bytes } => {
                let mut w = FrameWriter::new(MAGIC_REQUEST, opcode::DCP_BUFFER_ACK, 0, *opaque);
                w.extras.extend_from_slice(&(*bytes).to_be_bytes());
                w.finish()
            }
            DcpMessage::Control { opaque, key, value } => {
                let mut w = FrameWriter::new(MAGIC_REQUEST, opcode::DCP_CONTROL, 0, *opaque);
                w.key = key.as_bytes().to_vec();
                w.value = value.as_bytes().to_vec();
                w.finish()
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.encode().len()
    }

    /// Parses one frame. `from_producer` disambiguates the opcodes shared
    /// between the two directions.
    pub fn decode(buf: &[u8], from_producer: bool) -> Result<DcpMessage> {
        if buf.len() < HEADER_SIZE {
            return Err(errinval!("frame shorter than header: {} bytes", buf.len()));
        }
        let magic = buf[0];
        let op = buf[1];
        let (framing_len, key_len) = match magic {
            MAGIC_REQUEST | MAGIC_RESPONSE => {
                (0usize, u16::from_be_bytes([buf[2], buf[3]]) as usize)
            }
            MAGIC_ALT_REQUEST => (buf[2] as usize, buf[3] as usize),
            other => return Err(errinval!("unknown magic {other:#04x}")),
        };
        let extras_len = buf[4] as usize;
        let datatype = buf[5];
        let vb_or_status = u16::from_be_bytes([buf[6], buf[7]]);
        let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let opaque = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let cas = u64::from_be_bytes(buf[16..24].try_into().expect("8 bytes"));

        if buf.len() < HEADER_SIZE + body_len {
            return Err(errinval!("truncated frame body"));
        }
        if framing_len + extras_len + key_len > body_len {
            return Err(errinval!("frame sections exceed body length"));
        }
        let body = &buf[HEADER_SIZE..HEADER_SIZE + body_len];
        let framing = &body[..framing_len];
        let mut extras = Cursor::new(&body[framing_len..framing_len + extras_len]);
        let key_bytes = &body[framing_len + extras_len..framing_len + extras_len + key_len];
        let value = body[framing_len + extras_len + key_len..].to_vec();

        let stream_id = if framing_len == 2 {
            Some(u16::from_be_bytes([framing[0], framing[1]]))
        } else {
            None
        };
        let vbid = Vbid(vb_or_status);
        let key = DocKey::plain(key_bytes.to_vec());

        match (magic, op, from_producer) {
            (MAGIC_REQUEST, opcode::DCP_STREAM_REQ, false) => Ok(DcpMessage::StreamReq {
                vbid,
                opaque,
                flags: extras.read_u32::<BigEndian>()?,
                start_seqno: extras.read_u64::<BigEndian>()?,
                end_seqno: extras.read_u64::<BigEndian>()?,
                uuid: extras.read_u64::<BigEndian>()?,
                snap_start: extras.read_u64::<BigEndian>()?,
                snap_end: extras.read_u64::<BigEndian>()?,
            }),
            (MAGIC_RESPONSE, opcode::DCP_STREAM_REQ, true) => match vb_or_status {
                STATUS_SUCCESS => {
                    let mut log = Cursor::new(value.as_slice());
                    let mut failover_log = Vec::new();
                    while (log.position() as usize) < value.len() {
                        failover_log.push(FailoverEntry {
                            uuid: log.read_u64::<BigEndian>()?,
                            seqno: log.read_u64::<BigEndian>()?,
                        });
                    }
                    Ok(DcpMessage::StreamReqOk {
                        opaque,
                        failover_log,
                    })
                }
                STATUS_ROLLBACK => Ok(DcpMessage::StreamReqRollback {
                    opaque,
                    rollback_seqno: Cursor::new(value.as_slice()).read_u64::<BigEndian>()?,
                }),
                other => Err(Error::Failed(format!("stream request failed: {other:#06x}"))),
            },
            (_, opcode::DCP_SEQNO_ACK, false) => Ok(DcpMessage::SeqnoAck {
                vbid,
                opaque,
                mem_seqno: extras.read_u64::<BigEndian>()?,
                disk_seqno: extras.read_u64::<BigEndian>()?,
            }),
            (_, opcode::DCP_BUFFER_ACK, _) => Ok(DcpMessage::BufferAck {
                opaque,
                bytes: extras.read_u32::<BigEndian>()?,
            }),
            (_, opcode::DCP_CONTROL, _) => Ok(DcpMessage::Control {
                opaque,
                key: String::from_utf8_lossy(key_bytes).into_owned(),
                value: String::from_utf8_lossy(&value).into_owned(),
            }),
            (_, opcode::DCP_MUTATION, true) => {
                let by_seqno = extras.read_u64::<BigEndian>()?;
                let rev_seqno = extras.read_u64::<BigEndian>()?;
                let flags = extras.read_u32::<BigEndian>()?;
                let expiration = extras.read_u32::<BigEndian>()?;
                let lock_time = extras.read_u32::<BigEndian>()?;
                let _nmeta = extras.read_u16::<BigEndian>()?;
                let nru = extras.read_u8()?;
                Ok(DcpMessage::Mutation {
                    vbid,
                    opaque,
                    key,
                    value,
                    by_seqno,
                    rev_seqno,
                    cas,
                    flags,
                    expiration,
                    lock_time,
                    datatype: Datatype(datatype),
                    nru,
                    stream_id,
                })
            }
            (_, opcode::DCP_DELETION, true) => {
                let by_seqno = extras.read_u64::<BigEndian>()?;
                let rev_seqno = extras.read_u64::<BigEndian>()?;
                // v1 carries a 2-byte nmeta, v2 a 4-byte delete time.
                let delete_time = match extras_len {
                    18 => {
                        let _nmeta = extras.read_u16::<BigEndian>()?;
                        None
                    }
                    20 => Some(extras.read_u32::<BigEndian>()?),
                    other => {
                        return Err(errinval!("deletion extras length {other} unrecognized"))
                    }
                };
                Ok(DcpMessage::Deletion {
                    vbid,
                    opaque,
                    key,
                    by_seqno,
                    rev_seqno,
                    cas,
                    delete_time,
                    stream_id,
                })
            }
            (_, opcode::DCP_EXPIRATION, true) => {
                let by_seqno = extras.read_u64::<BigEndian>()?;
                let rev_seqno = extras.read_u64::<BigEndian>()?;
                let delete_time = extras.read_u32::<BigEndian>()?;
                Ok(DcpMessage::Expiration {
                    vbid,
                    opaque,
                    key,
                    by_seqno,
                    rev_seqno,
                    cas,
                    delete_time,
                    stream_id,
                })
            }
            (_, opcode::DCP_SNAPSHOT_MARKER, true) => Ok(DcpMessage::SnapshotMarker {
                vbid,
                opaque,
                start: extras.read_u64::<BigEndian>()?,
                end: extras.read_u64::<BigEndian>()?,
                flags: extras.read_u32::<BigEndian>()?,
            }),
            (_, opcode::DCP_PREPARE, true) => Ok(DcpMessage::Prepare {
                vbid,
                opaque,
                key,
                value,
                by_seqno: extras.read_u64::<BigEndian>()?,
                rev_seqno: extras.read_u64::<BigEndian>()?,
                cas,
                flags: extras.read_u32::<BigEndian>()?,
                expiration: extras.read_u32::<BigEndian>()?,
                lock_time: extras.read_u32::<BigEndian>()?,
                datatype: Datatype(datatype),
                nru: extras.read_u8()?,
                durability: DurabilityLevel::from_wire(extras.read_u8()?)?,
            }),
            (_, opcode::DCP_COMMIT, true) => Ok(DcpMessage::Commit {
                vbid,
                opaque,
                key,
                prepared_seqno: extras.read_u64::<BigEndian>()?,
                commit_seqno: extras.read_u64::<BigEndian>()?,
            }),
            (_, opcode::DCP_ABORT, true) => Ok(DcpMessage::Abort {
                vbid,
                opaque,
                key,
                prepared_seqno: extras.read_u64::<BigEndian>()?,
                abort_seqno: extras.read_u64::<BigEndian>()?,
            }),
            (_, opcode::DCP_SET_VBUCKET_STATE, true) => Ok(DcpMessage::SetVbState {
                vbid,
                opaque,
                state: vbstate_from_wire(extras.read_u8()?)?,
            }),
            (_, opcode::DCP_SYSTEM_EVENT, true) => Ok(DcpMessage::SystemEvent {
                vbid,
                opaque,
                key,
                value,
                by_seqno: extras.read_u64::<BigEndian>()?,
                id: extras.read_u32::<BigEndian>()?,
                version: extras.read_u8()?,
            }),
            (_, opcode::DCP_STREAM_END, true) => Ok(DcpMessage::StreamEnd {
                vbid,
                opaque,
                reason: StreamEndReason::from_wire(extras.read_u32::<BigEndian>()?)?,
            }),
            (_, opcode::DCP_NOOP, _) => Ok(DcpMessage::Noop { opaque }),
            (magic, op, dir) => Err(errinval!(
                "unrecognized frame: magic {magic:#04x} opcode {op:#04x} from_producer {dir}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: DcpMessage, from_producer: bool) {
        let bytes = msg.encode();
        let parsed = DcpMessage::decode(&bytes, from_producer).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_header_layout() {
        let msg = DcpMessage::SnapshotMarker {
            vbid: Vbid(7),
            opaque: 0xdead_beef,
            start: 1,
            end: 2,
            flags: snapshot::MEMORY | snapshot::CHECKPOINT,
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 20);
        assert_eq!(bytes[0], MAGIC_REQUEST);
        assert_eq!(bytes[1], opcode::DCP_SNAPSHOT_MARKER);
        // key length
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 0);
        // extras length
        assert_eq!(bytes[4], 20);
        // vbucket
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 7);
        // total body length
        assert_eq!(u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 20);
        // opaque
        assert_eq!(
            u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            0xdead_beef
        );
    }

    #[test]
    fn test_mutation_extras_31_bytes() {
        let msg = DcpMessage::Mutation {
            vbid: Vbid(1),
            opaque: 9,
            key: DocKey::plain(b"key"),
            value: b"value".to_vec(),
            by_seqno: 5,
            rev_seqno: 2,
            cas: 1234,
            flags: 0xcafe,
            expiration: 60,
            lock_time: 0,
            datatype: Datatype::JSON,
            nru: 1,
            stream_id: None,
        };
        let bytes = msg.encode();
        assert_eq!(bytes[4], 31);
        assert_eq!(
            bytes.len(),
            HEADER_SIZE + 31 + 3 + 5 // extras + key + value
        );
        round_trip(msg, true);
    }

    #[test]
    fn test_mutation_with_stream_id_uses_alt_magic() {
        let msg = DcpMessage::Mutation {
            vbid: Vbid(1),
            opaque: 9,
            key: DocKey::plain(b"key"),
            value: b"v".to_vec(),
            by_seqno: 5,
            rev_seqno: 2,
            cas: 1234,
            flags: 0,
            expiration: 0,
            lock_time: 0,
            datatype: Datatype::RAW,
            nru: 0,
            stream_id: Some(3),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[0], MAGIC_ALT_REQUEST);
        // framing extras length, then 1-byte key length
        assert_eq!(bytes[2], 2);
        assert_eq!(bytes[3], 3);
        // body = frame-info + extras + key + value
        assert_eq!(
            u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            2 + 31 + 3 + 1
        );
        round_trip(msg, true);
    }

    #[test]
    fn test_deletion_v1_and_v2() {
        let v1 = DcpMessage::Deletion {
            vbid: Vbid(2),
            opaque: 1,
            key: DocKey::plain(b"gone"),
            by_seqno: 11,
            rev_seqno: 3,
            cas: 42,
            delete_time: None,
            stream_id: None,
        };
        assert_eq!(v1.encode()[4], 18);
        round_trip(v1, true);

        let v2 = DcpMessage::Deletion {
            vbid: Vbid(2),
            opaque: 1,
            key: DocKey::plain(b"gone"),
            by_seqno: 11,
            rev_seqno: 3,
            cas: 42,
            delete_time: Some(777),
            stream_id: None,
        };
        assert_eq!(v2.encode()[4], 20);
        round_trip(v2, true);
    }

    #[test]
    fn test_stream_req_round_trip() {
        round_trip(
            DcpMessage::StreamReq {
                vbid: Vbid(7),
                opaque: 0x42,
                flags: stream_flags::TAKEOVER,
                start_seqno: 10,
                end_seqno: u64::MAX,
                uuid: 0xfeed,
                snap_start: 10,
                snap_end: 10,
            },
            false,
        );
    }

    #[test]
    fn test_stream_req_responses() {
        round_trip(
            DcpMessage::StreamReqOk {
                opaque: 3,
                failover_log: vec![
                    FailoverEntry { uuid: 9, seqno: 4 },
                    FailoverEntry { uuid: 7, seqno: 0 },
                ],
            },
            true,
        );
        round_trip(
            DcpMessage::StreamReqRollback {
                opaque: 3,
                rollback_seqno: 4,
            },
            true,
        );
    }

    #[test]
    fn test_prepare_commit_abort_round_trip() {
        round_trip(
            DcpMessage::Prepare {
                vbid: Vbid(0),
                opaque: 8,
                key: DocKey::plain(b"k"),
                value: b"v".to_vec(),
                by_seqno: 5,
                rev_seqno: 1,
                cas: 99,
                flags: 0,
                expiration: 0,
                lock_time: 0,
                datatype: Datatype::RAW,
                nru: 2,
                durability: DurabilityLevel::PersistToMajority,
            },
            true,
        );
        round_trip(
            DcpMessage::Commit {
                vbid: Vbid(0),
                opaque: 8,
                key: DocKey::plain(b"k"),
                prepared_seqno: 5,
                commit_seqno: 6,
            },
            true,
        );
        round_trip(
            DcpMessage::Abort {
                vbid: Vbid(0),
                opaque: 8,
                key: DocKey::plain(b"k"),
                prepared_seqno: 5,
                abort_seqno: 6,
            },
            true,
        );
    }

    #[test]
    fn test_seqno_ack_round_trip() {
        round_trip(
            DcpMessage::SeqnoAck {
                vbid: Vbid(3),
                opaque: 12,
                mem_seqno: 100,
                disk_seqno: 90,
            },
            false,
        );
    }

    #[test]
    fn test_control_and_buffer_ack() {
        round_trip(
            DcpMessage::Control {
                opaque: 1,
                key: "connection_buffer_size".to_string(),
                value: "1048576".to_string(),
            },
            false,
        );
        round_trip(DcpMessage::BufferAck { opaque: 2, bytes: 4096 }, false);
        round_trip(DcpMessage::Noop { opaque: 5 }, true);
    }

    #[test]
    fn test_misc_server_frames_round_trip() {
        round_trip(
            DcpMessage::SetVbState {
                vbid: Vbid(1),
                opaque: 0,
                state: VbState::Active,
            },
            true,
        );
        round_trip(
            DcpMessage::SystemEvent {
                vbid: Vbid(1),
                opaque: 0,
                key: DocKey::plain(b"_manifest:1"),
                value: vec![0, 0, 0, 0, 0, 0, 0, 1],
                by_seqno: 3,
                id: 0,
                version: 0,
            },
            true,
        );
        round_trip(
            DcpMessage::StreamEnd {
                vbid: Vbid(1),
                opaque: 0,
                reason: StreamEndReason::StateChanged,
            },
            true,
        );
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let msg = DcpMessage::Noop { opaque: 1 };
        let bytes = msg.encode();
        assert!(DcpMessage::decode(&bytes[..HEADER_SIZE - 1], true).is_err());

        let msg = DcpMessage::SeqnoAck {
            vbid: Vbid(0),
            opaque: 0,
            mem_seqno: 1,
            disk_seqno: 0,
        };
        let bytes = msg.encode();
        assert!(DcpMessage::decode(&bytes[..bytes.len() - 1], false).is_err());
    }
}
