//! Wire protocol shared by [`crate::BlobServer`] and [`crate::BlobClient`].
//!
//! Every request starts with an opcode byte. Both PUT and GET follow with an
//! addressing byte and, for job-related content, a 16-byte job id.
//!
//! ```text
//! PUT:  0x00 | mode | [job id] | type | (len:i32 | bytes)* | -1:i32
//!   <-  OK | key(37)                 or  ERROR | len:i32 | error json
//! GET:  0x01 | mode | [job id] | key(37)
//!   <-  OK | len:i32 | bytes         or  ERROR | len:i32 | error json
//!   ->  ack (OK | ERROR)
//! ```
//!
//! Lengths are little-endian signed 32-bit integers.

use crate::error::{BlobError, ErrorPayload, Result};
use crate::key::JobId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Buffer size for network transfers; also the largest accepted PUT chunk.
pub const BUFFER_SIZE: usize = 65536;

pub const PUT_OPERATION: u8 = 0;
pub const GET_OPERATION: u8 = 1;

pub const RETURN_OKAY: u8 = 0;
pub const RETURN_ERROR: u8 = 1;

/// Addressing mode for job-unrelated (transient only) content.
pub const JOB_UNRELATED_CONTENT: u8 = 0;
/// Addressing mode for job-related content, followed by the job id.
pub const JOB_RELATED_CONTENT: u8 = 2;

/// Length value terminating a PUT chunk stream.
pub const END_OF_STREAM: i32 = -1;

pub async fn write_length<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    length: i32,
) -> Result<()> {
    writer.write_i32_le(length).await?;
    Ok(())
}

pub async fn read_length<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<i32> {
    reader
        .read_i32_le()
        .await
        .map_err(|error| premature_eof(error, "length field"))
}

/// Reads one byte, mapping EOF to a protocol error naming `what`.
pub async fn read_byte<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, what: &str) -> Result<u8> {
    reader
        .read_u8()
        .await
        .map_err(|error| premature_eof(error, what))
}

pub async fn read_fully<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    reader
        .read_exact(buf)
        .await
        .map_err(|error| premature_eof(error, what))?;
    Ok(())
}

pub async fn write_addressing<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    job_id: Option<&JobId>,
) -> Result<()> {
    match job_id {
        None => writer.write_u8(JOB_UNRELATED_CONTENT).await?,
        Some(job_id) => {
            writer.write_u8(JOB_RELATED_CONTENT).await?;
            writer.write_all(job_id.as_bytes()).await?;
        }
    }
    Ok(())
}

pub async fn read_addressing<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<Option<JobId>> {
    match read_byte(reader, "addressing mode").await? {
        JOB_UNRELATED_CONTENT => Ok(None),
        JOB_RELATED_CONTENT => {
            let mut bytes = [0u8; JobId::SIZE];
            read_fully(reader, &mut bytes, "job id").await?;
            Ok(Some(JobId::from_bytes(bytes)))
        }
        other => Err(BlobError::Protocol(format!(
            "unknown type of BLOB addressing: {}",
            other
        ))),
    }
}

/// Writes an ERROR frame carrying `error`.
pub async fn write_error<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    error: &BlobError,
) -> Result<()> {
    let payload = serde_json::to_vec(&ErrorPayload::from(error))?;
    writer.write_u8(RETURN_ERROR).await?;
    write_length(writer, payload.len() as i32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the body of an ERROR frame (after the status byte).
pub async fn read_error<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<BlobError> {
    let length = read_length(reader).await?;
    if length < 0 {
        return Err(BlobError::Protocol(format!(
            "negative error payload length: {}",
            length
        )));
    }
    let mut payload = vec![0u8; length as usize];
    read_fully(reader, &mut payload, "error payload").await?;
    let payload: ErrorPayload = serde_json::from_slice(&payload)?;
    Ok(BlobError::from(payload))
}

/// Reads a response status byte; an ERROR frame becomes `Err(BlobError::Remote)`.
pub async fn read_response_status<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<()> {
    match read_byte(reader, "response status").await? {
        RETURN_OKAY => Ok(()),
        RETURN_ERROR => Err(read_error(reader).await?),
        other => Err(BlobError::Protocol(format!(
            "unrecognized response status: {}",
            other
        ))),
    }
}

fn premature_eof(error: std::io::Error, what: &str) -> BlobError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        BlobError::Protocol(format!("premature end of stream while reading {}", what))
    } else {
        BlobError::Io(error)
    }
}
