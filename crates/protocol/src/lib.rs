//! Wire protocol for member-to-member communication.
//!
//! Every message travels as a framed envelope:
//!
//! ```text
//! [u32 length][u8 frame type][u64 correlation id][bincode body]
//! ```
//!
//! The length prefix covers the frame type, correlation id, and body. Frame
//! type ids are fixed per message so heterogeneous implementations can
//! interoperate; the body is bincode over the message struct.

use common::{Error, Index, Member, MemberId, Term};
use serde::{Deserialize, Serialize};
use storage::Entry;

/// Query consistency levels, weakest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Served from local apply state on any node.
    Serializable,
    /// Served by the leader while its heartbeat lease is fresh.
    LinearizableLease,
    /// Served by the leader after a full quorum round-trip.
    LinearizableStrict,
}

/// A client operation carried by a submit request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// A state-mutating command, replicated through the log.
    Command { key: Vec<u8>, payload: Vec<u8> },
    /// A read-only query against the applied state.
    Query {
        payload: Vec<u8>,
        consistency: Consistency,
    },
}

/// Response status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
}

/// Protocol-level error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NoLeader,
    Read,
    Write,
    IllegalMemberState,
    UnknownSession,
    Application,
}

impl ErrorKind {
    /// Map an internal error onto its wire code.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::NoLeader { .. } => ErrorKind::NoLeader,
            Error::IllegalMemberState(_) => ErrorKind::IllegalMemberState,
            Error::Application(_) => ErrorKind::Application,
            Error::Corruption(_) | Error::Buffer(_) | Error::Protocol(_) => ErrorKind::Read,
            Error::Storage(_) | Error::Io(_) | Error::Config(_) => ErrorKind::Write,
            Error::Transport(_) => ErrorKind::Read,
        }
    }

    /// Reconstruct an error on the client side of the wire.
    pub fn into_error(self, leader: Option<MemberId>) -> Error {
        match self {
            ErrorKind::NoLeader => Error::NoLeader { leader },
            ErrorKind::IllegalMemberState => {
                Error::IllegalMemberState("rejected by remote member".into())
            }
            ErrorKind::Application => Error::Application("remote apply failed".into()),
            ErrorKind::Read => Error::Protocol("remote read failed".into()),
            ErrorKind::Write => Error::Protocol("remote write failed".into()),
            ErrorKind::UnknownSession => Error::Protocol("unknown session".into()),
        }
    }
}

/// Log replication and heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: MemberId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub commit_index: Index,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub term: Term,
    pub succeeded: bool,
    /// The responder's last log index, for leader backtracking.
    pub log_index: Index,
}

/// Leader election ballot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub term: Term,
    pub vote_granted: bool,
}

/// Pre-vote probe: the vote predicate without the vote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub term: Term,
    pub vote_granted: bool,
}

/// Gossip tier: membership exchange plus committed-entry catch-up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub term: Term,
    pub leader: Option<MemberId>,
    /// The recipient's commit index as last known by the sender.
    pub log_index: Index,
    pub members: Vec<Member>,
    pub entries: Vec<Entry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub members: Vec<Member>,
}

/// Client operation submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub operation: Operation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub result: Option<Vec<u8>>,
    /// Best-known leader, for client redirection.
    pub leader: Option<MemberId>,
}

impl SubmitResponse {
    pub fn ok(result: Vec<u8>, leader: Option<MemberId>) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            result: Some(result),
            leader,
        }
    }

    pub fn error(kind: ErrorKind, leader: Option<MemberId>) -> Self {
        Self {
            status: Status::Error,
            error: Some(kind),
            result: None,
            leader,
        }
    }
}

/// Leader discovery probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusRequest {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub term: Term,
    pub leader: Option<MemberId>,
}

/// All requests a member can receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Append(AppendRequest),
    Vote(VoteRequest),
    Poll(PollRequest),
    Sync(SyncRequest),
    Submit(SubmitRequest),
    Status(StatusRequest),
}

/// All responses a member can send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Append(AppendResponse),
    Vote(VoteResponse),
    Poll(PollResponse),
    Sync(SyncResponse),
    Submit(SubmitResponse),
    Status(StatusResponse),
}

impl Request {
    /// Wire frame type of this request.
    pub fn frame_type(&self) -> u8 {
        match self {
            Request::Append(_) => frame::APPEND_REQUEST,
            Request::Vote(_) => frame::VOTE_REQUEST,
            Request::Poll(_) => frame::POLL_REQUEST,
            Request::Sync(_) => frame::SYNC_REQUEST,
            Request::Submit(_) => frame::SUBMIT_REQUEST,
            Request::Status(_) => frame::STATUS_REQUEST,
        }
    }
}

impl Response {
    /// Wire frame type of this response.
    pub fn frame_type(&self) -> u8 {
        match self {
            Response::Append(_) => frame::APPEND_RESPONSE,
            Response::Vote(_) => frame::VOTE_RESPONSE,
            Response::Poll(_) => frame::POLL_RESPONSE,
            Response::Sync(_) => frame::SYNC_RESPONSE,
            Response::Submit(_) => frame::SUBMIT_RESPONSE,
            Response::Status(_) => frame::STATUS_RESPONSE,
        }
    }
}

/// Frame format: `[u32 length][u8 type][u64 correlation][bincode payload]`.
pub mod frame {
    use super::*;
    use bincode::config;
    use std::io::{self, Read, Write};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub const APPEND_REQUEST: u8 = 1;
    pub const APPEND_RESPONSE: u8 = 2;
    pub const VOTE_REQUEST: u8 = 3;
    pub const VOTE_RESPONSE: u8 = 4;
    pub const POLL_REQUEST: u8 = 5;
    pub const POLL_RESPONSE: u8 = 6;
    pub const SYNC_REQUEST: u8 = 7;
    pub const SYNC_RESPONSE: u8 = 8;
    pub const SUBMIT_REQUEST: u8 = 9;
    pub const SUBMIT_RESPONSE: u8 = 10;
    pub const STATUS_RESPONSE: u8 = 11;
    /// The status request carries no body; it takes the next free id.
    pub const STATUS_REQUEST: u8 = 12;

    const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024; // 64 MB
    const ENVELOPE_LEN: usize = 1 + 8;

    fn encode<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
        bincode::serde::encode_to_vec(value, config::standard())
            .map_err(|e| io::Error::other(format!("bincode encoding failed: {}", e)))
    }

    fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> io::Result<T> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, config::standard())
            .map_err(|e| io::Error::other(format!("bincode decoding failed: {}", e)))?;
        Ok(value)
    }

    fn request_body(request: &Request) -> io::Result<Vec<u8>> {
        match request {
            Request::Append(r) => encode(r),
            Request::Vote(r) => encode(r),
            Request::Poll(r) => encode(r),
            Request::Sync(r) => encode(r),
            Request::Submit(r) => encode(r),
            Request::Status(r) => encode(r),
        }
    }

    fn request_from_body(frame_type: u8, body: &[u8]) -> io::Result<Request> {
        Ok(match frame_type {
            APPEND_REQUEST => Request::Append(decode(body)?),
            VOTE_REQUEST => Request::Vote(decode(body)?),
            POLL_REQUEST => Request::Poll(decode(body)?),
            SYNC_REQUEST => Request::Sync(decode(body)?),
            SUBMIT_REQUEST => Request::Submit(decode(body)?),
            STATUS_REQUEST => Request::Status(decode(body)?),
            other => {
                return Err(io::Error::other(format!(
                    "unknown request frame type {}",
                    other
                )));
            }
        })
    }

    fn response_body(response: &Response) -> io::Result<Vec<u8>> {
        match response {
            Response::Append(r) => encode(r),
            Response::Vote(r) => encode(r),
            Response::Poll(r) => encode(r),
            Response::Sync(r) => encode(r),
            Response::Submit(r) => encode(r),
            Response::Status(r) => encode(r),
        }
    }

    fn response_from_body(frame_type: u8, body: &[u8]) -> io::Result<Response> {
        Ok(match frame_type {
            APPEND_RESPONSE => Response::Append(decode(body)?),
            VOTE_RESPONSE => Response::Vote(decode(body)?),
            POLL_RESPONSE => Response::Poll(decode(body)?),
            SYNC_RESPONSE => Response::Sync(decode(body)?),
            SUBMIT_RESPONSE => Response::Submit(decode(body)?),
            STATUS_RESPONSE => Response::Status(decode(body)?),
            other => {
                return Err(io::Error::other(format!(
                    "unknown response frame type {}",
                    other
                )));
            }
        })
    }

    fn build_frame(frame_type: u8, correlation_id: u64, body: &[u8]) -> io::Result<Vec<u8>> {
        let len = (ENVELOPE_LEN + body.len()) as u64;
        if len > MAX_FRAME_SIZE as u64 {
            return Err(io::Error::other(format!(
                "message too large: {} bytes (max {})",
                len, MAX_FRAME_SIZE
            )));
        }
        let mut out = Vec::with_capacity(4 + len as usize);
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.push(frame_type);
        out.extend_from_slice(&correlation_id.to_le_bytes());
        out.extend_from_slice(body);
        Ok(out)
    }

    fn split_frame(frame: &[u8]) -> io::Result<(u8, u64, &[u8])> {
        if frame.len() < ENVELOPE_LEN {
            return Err(io::Error::other(format!(
                "frame of {} bytes is below the {} byte envelope",
                frame.len(),
                ENVELOPE_LEN
            )));
        }
        let frame_type = frame[0];
        let correlation_id = u64::from_le_bytes(frame[1..9].try_into().unwrap());
        Ok((frame_type, correlation_id, &frame[9..]))
    }

    fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::other(format!(
                "message too large: {} bytes (max {})",
                len, MAX_FRAME_SIZE
            )));
        }
        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame)?;
        Ok(frame)
    }

    async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::other(format!(
                "message too large: {} bytes (max {})",
                len, MAX_FRAME_SIZE
            )));
        }
        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame).await?;
        Ok(frame)
    }

    /// Write a framed request.
    pub fn write_request<W: Write>(
        writer: &mut W,
        correlation_id: u64,
        request: &Request,
    ) -> io::Result<()> {
        let body = request_body(request)?;
        writer.write_all(&build_frame(request.frame_type(), correlation_id, &body)?)
    }

    /// Read a framed request.
    pub fn read_request<R: Read>(reader: &mut R) -> io::Result<(u64, Request)> {
        let frame = read_frame(reader)?;
        let (frame_type, correlation_id, body) = split_frame(&frame)?;
        Ok((correlation_id, request_from_body(frame_type, body)?))
    }

    /// Write a framed response.
    pub fn write_response<W: Write>(
        writer: &mut W,
        correlation_id: u64,
        response: &Response,
    ) -> io::Result<()> {
        let body = response_body(response)?;
        writer.write_all(&build_frame(response.frame_type(), correlation_id, &body)?)
    }

    /// Read a framed response.
    pub fn read_response<R: Read>(reader: &mut R) -> io::Result<(u64, Response)> {
        let frame = read_frame(reader)?;
        let (frame_type, correlation_id, body) = split_frame(&frame)?;
        Ok((correlation_id, response_from_body(frame_type, body)?))
    }

    /// Write a framed request to an async stream.
    pub async fn write_request_async<W: AsyncWrite + Unpin>(
        writer: &mut W,
        correlation_id: u64,
        request: &Request,
    ) -> io::Result<()> {
        let body = request_body(request)?;
        let frame = build_frame(request.frame_type(), correlation_id, &body)?;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    /// Read a framed request from an async stream.
    pub async fn read_request_async<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> io::Result<(u64, Request)> {
        let frame = read_frame_async(reader).await?;
        let (frame_type, correlation_id, body) = split_frame(&frame)?;
        Ok((correlation_id, request_from_body(frame_type, body)?))
    }

    /// Write a framed response to an async stream.
    pub async fn write_response_async<W: AsyncWrite + Unpin>(
        writer: &mut W,
        correlation_id: u64,
        response: &Response,
    ) -> io::Result<()> {
        let body = response_body(response)?;
        let frame = build_frame(response.frame_type(), correlation_id, &body)?;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    /// Read a framed response from an async stream.
    pub async fn read_response_async<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> io::Result<(u64, Response)> {
        let frame = read_frame_async(reader).await?;
        let (frame_type, correlation_id, body) = split_frame(&frame)?;
        Ok((correlation_id, response_from_body(frame_type, body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MemberType;
    use std::io::Cursor;
    use storage::EntryKind;

    fn sample_entry(index: Index) -> Entry {
        Entry::new(
            index,
            2,
            EntryKind::Command,
            b"foo".to_vec(),
            b"bar".to_vec(),
        )
    }

    #[test]
    fn append_request_roundtrip() {
        let request = Request::Append(AppendRequest {
            term: 2,
            leader: 1,
            prev_log_index: 9,
            prev_log_term: 1,
            entries: vec![sample_entry(10), sample_entry(11)],
            commit_index: 9,
        });

        let mut buf = Vec::new();
        frame::write_request(&mut buf, 42, &request).unwrap();
        assert_eq!(buf[4], frame::APPEND_REQUEST);

        let (correlation, decoded) = frame::read_request(&mut Cursor::new(buf)).unwrap();
        assert_eq!(correlation, 42);
        assert_eq!(decoded, request);
    }

    #[test]
    fn every_response_type_roundtrips() {
        let responses = vec![
            Response::Append(AppendResponse {
                status: Status::Ok,
                error: None,
                term: 3,
                succeeded: false,
                log_index: 17,
            }),
            Response::Vote(VoteResponse {
                status: Status::Ok,
                error: None,
                term: 3,
                vote_granted: true,
            }),
            Response::Poll(PollResponse {
                status: Status::Ok,
                error: None,
                term: 3,
                vote_granted: false,
            }),
            Response::Sync(SyncResponse {
                status: Status::Ok,
                error: None,
                members: vec![Member::new(2, "127.0.0.1:5002", MemberType::Passive)],
            }),
            Response::Submit(SubmitResponse::error(ErrorKind::NoLeader, Some(3))),
            Response::Status(StatusResponse {
                status: Status::Ok,
                error: None,
                term: 3,
                leader: Some(1),
            }),
        ];

        for response in responses {
            let mut buf = Vec::new();
            frame::write_response(&mut buf, 7, &response).unwrap();
            let (correlation, decoded) = frame::read_response(&mut Cursor::new(buf)).unwrap();
            assert_eq!(correlation, 7);
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn status_request_has_empty_body() {
        let mut buf = Vec::new();
        frame::write_request(&mut buf, 1, &Request::Status(StatusRequest {})).unwrap();
        assert_eq!(buf[4], frame::STATUS_REQUEST);
        // length word + type + correlation, nothing else
        assert_eq!(buf.len(), 4 + 1 + 8);
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let mut buf = Vec::new();
        frame::write_request(&mut buf, 1, &Request::Status(StatusRequest {})).unwrap();
        buf[4] = 200;
        assert!(frame::read_request(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn error_kind_maps_both_ways() {
        let err = Error::NoLeader { leader: Some(2) };
        let kind = ErrorKind::from_error(&err);
        assert_eq!(kind, ErrorKind::NoLeader);
        assert!(matches!(
            kind.into_error(Some(2)),
            Error::NoLeader { leader: Some(2) }
        ));

        assert_eq!(
            ErrorKind::from_error(&Error::IllegalMemberState("passive".into())),
            ErrorKind::IllegalMemberState
        );
        assert_eq!(
            ErrorKind::from_error(&Error::Application("boom".into())),
            ErrorKind::Application
        );
    }

    #[tokio::test]
    async fn async_framing_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let request = Request::Vote(VoteRequest {
            term: 5,
            candidate: 2,
            last_log_index: 30,
            last_log_term: 4,
        });
        frame::write_request_async(&mut client, 9, &request)
            .await
            .unwrap();
        let (correlation, decoded) = frame::read_request_async(&mut server).await.unwrap();
        assert_eq!(correlation, 9);
        assert_eq!(decoded, request);

        let response = Response::Vote(VoteResponse {
            status: Status::Ok,
            error: None,
            term: 5,
            vote_granted: true,
        });
        frame::write_response_async(&mut server, 9, &response)
            .await
            .unwrap();
        let (correlation, decoded) = frame::read_response_async(&mut client).await.unwrap();
        assert_eq!(correlation, 9);
        assert_eq!(decoded, response);
    }
}
