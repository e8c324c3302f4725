use crate::cmd::{Command, Protocol};
use crate::frame::{Frame, FrameError};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use std::time::Duration;
use tokio::io::{self as tio, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::time;

/// A byte stream the transport can run over: plain TCP or TLS.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub(crate) type BoxStream = Box<dyn Stream>;

const BUF_SIZE: usize = 4 * 1024;

/// An established, authenticated byte stream to the store, split into a read
/// half and a write half.
///
/// Writes are buffered and only reach the socket on [`Transport::flush`], so
/// several commands can be pipelined before their replies are read.
pub(crate) struct Transport {
    reader: FrameReader,
    writer: FrameWriter,
}

/// Reads `Frame` values from the read half of the stream.
///
/// `read_buf` is filled up until there are enough bytes to create a full frame.
/// Once this happens, the frame is created and returned to the caller.
pub(crate) struct FrameReader {
    stream: ReadHalf<BoxStream>,
    // The buffer for reading frames.
    read_buf: BytesMut,
    read_timeout: Duration,
}

/// Writes `Frame` values to the write half of the stream.
pub(crate) struct FrameWriter {
    stream: BufWriter<WriteHalf<BoxStream>>,
}

impl Transport {
    pub(crate) fn new(stream: BoxStream, read_timeout: Duration) -> Transport {
        let (rd, wr) = tio::split(stream);
        Transport {
            reader: FrameReader {
                stream: rd,
                read_buf: BytesMut::with_capacity(BUF_SIZE),
                read_timeout,
            },
            writer: FrameWriter {
                stream: BufWriter::new(wr),
            },
        }
    }

    /// Buffer `cmd` without flushing.
    pub(crate) async fn send(&mut self, cmd: &Command) -> Result<()> {
        self.writer.write_frame(&cmd.into_frame()).await?;
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn read_reply(&mut self) -> Result<Frame> {
        self.reader.read_reply().await
    }

    /// Send `cmd`, flush it, and read exactly one reply. Only valid when no
    /// other replies are outstanding.
    pub(crate) async fn request(&mut self, cmd: &Command) -> Result<Frame> {
        self.send(cmd).await?;
        self.flush().await?;
        self.read_reply().await
    }

    pub(crate) fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

impl FrameReader {
    /// Read a single `Frame` value from the underlying stream.
    ///
    /// The function waits until it has retrieved enough data to parse a frame,
    /// for at most the configured read timeout. Any data remaining in the read
    /// buffer after the frame has been parsed is kept there for the next call.
    ///
    /// # Returns
    ///
    /// On success, the received frame is returned. If the stream is closed in
    /// a way that doesn't break a frame in half, it returns `None`. Otherwise,
    /// an error is returned.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            // Attempt to parse a frame from the buffered data. If enough data
            // has been buffered, the frame is returned.
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // There is not enough buffered data to read a frame. Attempt to
            // read more data from the socket. `read_buf` is cancel safe, so
            // the timeout never loses bytes already received.
            let read = time::timeout(self.read_timeout, self.stream.read_buf(&mut self.read_buf));
            let n = match read.await {
                Ok(res) => res?,
                Err(_) => return Err(Error::Timeout(self.read_timeout)),
            };

            // `0` indicates "end of stream".
            if n == 0 {
                // For this to be a clean shutdown, there should be no data in
                // the read buffer.
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::ConnectionReset);
            }
        }
    }

    /// Like `read_frame`, but end of stream is an error: a reply was expected.
    pub(crate) async fn read_reply(&mut self) -> Result<Frame> {
        match self.read_frame().await? {
            Some(frame) => Ok(frame),
            None => Err(Error::ConnectionReset),
        }
    }

    /// Tries to parse a frame from the buffer. If not enough data has been
    /// buffered yet, `Ok(None)` is returned. If the buffered data does not
    /// represent a valid frame, `Err` is returned and the connection must be
    /// discarded.
    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = Cursor::new(&self.read_buf[..]);

        // Checking first is much faster than a full parse and avoids
        // allocating until the whole frame has been received.
        match Frame::check(&mut buf) {
            Ok(()) => {
                // `check` advanced the cursor to the end of the frame.
                let len = usize::try_from(buf.position())
                    .map_err(|_| Error::Protocol("frame too large".to_string()))?;

                buf.set_position(0);
                let frame = Frame::parse(&mut buf)?;
                self.read_buf.advance(len);

                Ok(Some(frame))
            }
            Err(FrameError::Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl FrameWriter {
    /// Write a single `Frame` into the write buffer. Nothing reaches the
    /// socket until [`FrameWriter::flush`].
    pub(crate) async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        match frame {
            Frame::Array(val) => {
                self.stream.write_u8(b'*').await?;
                self.write_decimal(val.len() as i64).await?;

                for entry in val {
                    self.write_value(entry).await?;
                }
                Ok(())
            }
            _ => self.write_value(frame).await,
        }
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    pub(crate) async fn send(&mut self, cmd: &Command) -> Result<()> {
        self.write_frame(&cmd.into_frame()).await?;
        self.flush().await?;
        Ok(())
    }

    /// Write a frame literal to the stream.
    async fn write_value(&mut self, frame: &Frame) -> io::Result<()> {
        match frame {
            Frame::Simple(val) => {
                self.stream.write_u8(b'+').await?;
                self.stream.write_all(val.as_bytes()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Error(val) => {
                self.stream.write_u8(b'-').await?;
                self.stream.write_all(val.as_bytes()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Integer(val) => {
                self.stream.write_u8(b':').await?;
                self.write_decimal(*val).await?;
            }
            Frame::Null => {
                self.stream.write_all(b"$-1\r\n").await?;
            }
            Frame::Bulk(val) => {
                self.stream.write_u8(b'$').await?;
                self.write_decimal(val.len() as i64).await?;
                self.stream.write_all(val).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            // Commands are flat arrays of bulk strings.
            Frame::Array(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "nested arrays are not supported",
                ));
            }
        }

        Ok(())
    }

    async fn write_decimal(&mut self, val: i64) -> io::Result<()> {
        use std::io::Write;

        let mut buf = [0u8; 20];
        let mut buf = Cursor::new(&mut buf[..]);
        write!(&mut buf, "{}", val)?;

        let pos = buf.position() as usize;
        self.stream.write_all(&buf.get_ref()[..pos]).await?;
        self.stream.write_all(b"\r\n").await?;

        Ok(())
    }
}
