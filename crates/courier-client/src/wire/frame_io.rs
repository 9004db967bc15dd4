// Handshake-time IO: whole server ops in, raw batches out.
use bytes::BytesMut;
use courier_wire::{ClientCodec, ServerOp};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};
use crate::wire::decode_log::log_decode_error;

/// Reads until `codec` yields one op. Bytes past that op stay in `buf`.
pub(crate) async fn read_server_op<R>(
    reader: &mut R,
    codec: &mut ClientCodec,
    buf: &mut BytesMut,
) -> Result<ServerOp>
where
    R: AsyncRead + Unpin,
{
    loop {
        match codec.decode(buf) {
            Ok(Some(op)) => return Ok(op),
            Ok(None) => {}
            Err(err) => {
                log_decode_error("handshake", &err, codec.last_line());
                return Err(err.into());
            }
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(Error::ConnectionLost(
                "server closed the connection during handshake".to_string(),
            ));
        }
    }
}

pub(crate) async fn write_flush<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
