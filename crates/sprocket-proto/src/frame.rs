use serde::{Deserialize, Serialize};
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtoError;
use crate::status::RpcStatus;

pub const MAGIC: [u8; 4] = *b"SPKT";
pub const MAX_HEADER_LEN: u32 = 64 * 1024;
pub const MAX_BODY_LEN: u64 = 64 * 1024 * 1024;

/// Frame header shared by requests and responses.
///
/// Requests carry the method name in `kind` and leave `status` unset.
/// Responses echo `kind`, set `status`, and put error detail in `message`
/// when the status is not `Ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    pub kind: String,
    #[serde(default)]
    pub status: Option<RpcStatus>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    pub token_id: String,
    pub token_secret: String,
}

impl FrameHeader {
    pub fn request(kind: &str) -> Self {
        Self { kind: kind.to_string(), status: None, message: None, auth: None }
    }

    pub fn request_with_auth(kind: &str, auth: Option<AuthInfo>) -> Self {
        Self { kind: kind.to_string(), status: None, message: None, auth }
    }

    pub fn response(kind: &str, status: RpcStatus) -> Self {
        Self {
            kind: kind.to_string(),
            status: Some(status),
            message: None,
            auth: None,
        }
    }

    pub fn error(kind: &str, status: RpcStatus, message: &str) -> Self {
        Self {
            kind: kind.to_string(),
            status: Some(status),
            message: Some(message.to_string()),
            auth: None,
        }
    }
}

pub fn encode_header_json(header: &FrameHeader) -> Result<Vec<u8>, ProtoError> {
    serde_json::to_vec(header)
        .map_err(|err| ProtoError::HeaderEncode(err.to_string()))
}

pub fn decode_header_json(bytes: &[u8]) -> Result<FrameHeader, ProtoError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ProtoError::HeaderDecode(err.to_string()))
}

#[cfg(feature = "tokio")]
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &FrameHeader,
    body: &[u8],
) -> Result<(), ProtoError> {
    let header_bytes = encode_header_json(header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| ProtoError::HeaderTooLarge(u32::MAX))?;
    let body_len = u64::try_from(body.len())
        .map_err(|_| ProtoError::BodyTooLarge(u64::MAX))?;

    writer.write_all(&MAGIC).await?;
    writer.write_all(&header_len.to_be_bytes()).await?;
    writer.write_all(&body_len.to_be_bytes()).await?;
    writer.write_all(&header_bytes).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(feature = "tokio")]
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_header_len: u32,
    max_body_len: u64,
) -> Result<(FrameHeader, Vec<u8>), ProtoError> {
    let mut magic = [0_u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(ProtoError::InvalidMagic);
    }

    let mut header_len_buf = [0_u8; 4];
    reader.read_exact(&mut header_len_buf).await?;
    let header_len = u32::from_be_bytes(header_len_buf);
    if header_len > max_header_len {
        return Err(ProtoError::HeaderTooLarge(header_len));
    }

    let mut body_len_buf = [0_u8; 8];
    reader.read_exact(&mut body_len_buf).await?;
    let body_len = u64::from_be_bytes(body_len_buf);
    if body_len > max_body_len {
        return Err(ProtoError::BodyTooLarge(body_len));
    }

    let mut header_bytes = vec![0_u8; header_len as usize];
    reader.read_exact(&mut header_bytes).await?;
    let header = decode_header_json(&header_bytes)?;

    let mut body = vec![0_u8; body_len as usize];
    reader.read_exact(&mut body).await?;

    Ok((header, body))
}

#[cfg(all(test, feature = "tokio"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_header_and_body() {
        let mut buf = std::io::Cursor::new(Vec::new());
        let header = FrameHeader::request("function.get_inputs");
        write_frame_async(&mut buf, &header, b"{\"x\":1}").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let (decoded, body) =
            read_frame_async(&mut cursor, MAX_HEADER_LEN, MAX_BODY_LEN)
                .await
                .unwrap();
        assert_eq!(decoded.kind, "function.get_inputs");
        assert!(decoded.status.is_none());
        assert_eq!(body, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut cursor = std::io::Cursor::new(b"NOPE\0\0\0\0".to_vec());
        let err =
            read_frame_async(&mut cursor, MAX_HEADER_LEN, MAX_BODY_LEN).await;
        assert!(matches!(err, Err(ProtoError::InvalidMagic)));
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let mut buf = std::io::Cursor::new(Vec::new());
        let header = FrameHeader::response("blob.get", RpcStatus::Ok);
        write_frame_async(&mut buf, &header, &[7_u8; 128]).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let err = read_frame_async(&mut cursor, MAX_HEADER_LEN, 64).await;
        assert!(matches!(err, Err(ProtoError::BodyTooLarge(128))));
    }
}
