//! Buffer-sequence readers, writers, and the forwarding loop

use std::io;
use std::time::Duration;

use async_trait::async_trait;

use super::multi::MultiBuffer;

/// A source of buffer sequences. `Ok(None)` signals end of stream.
#[async_trait]
pub trait Reader: Send {
    /// Read the next chunk of payload.
    async fn read(&mut self) -> io::Result<Option<MultiBuffer>>;
}

/// A [`Reader`] that can bound how long a read may wait.
#[async_trait]
pub trait TimeoutReader: Reader {
    /// Read the next chunk, waiting at most `timeout`. A zero timeout
    /// only drains data that is already buffered. Returns
    /// `ErrorKind::TimedOut` when nothing arrives in time.
    async fn read_timeout(&mut self, timeout: Duration) -> io::Result<Option<MultiBuffer>>;
}

/// A sink of buffer sequences. Takes ownership of every buffer handed in.
#[async_trait]
pub trait Writer: Send {
    /// Write one chunk of payload.
    async fn write(&mut self, data: MultiBuffer) -> io::Result<()>;
}

/// Copy chunks from `reader` to `writer` until end of stream or error.
/// Returns the number of payload bytes moved.
pub async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: Reader + ?Sized,
    W: Writer + ?Sized,
{
    let mut total: u64 = 0;
    loop {
        match reader.read().await? {
            Some(chunk) => {
                total += chunk.len() as u64;
                writer.write(chunk).await?;
            }
            None => return Ok(total),
        }
    }
}

/// Drain `reader` completely into one sequence.
pub async fn copy_from_reader<R>(reader: &mut R) -> io::Result<MultiBuffer>
where
    R: Reader + ?Sized,
{
    let mut out = MultiBuffer::new();
    while let Some(mut chunk) = reader.read().await? {
        out.append(&mut chunk);
    }
    Ok(out)
}

/// Coalesces consecutive small reads so the downstream writer can fill
/// its frames.
///
/// After a read that did not fill its last buffer, a zero-timeout second
/// read is attempted; whatever is already pending gets folded into the
/// same chunk, topping up the tail buffer first.
pub struct MergingReader<R> {
    inner: R,
}

impl<R: TimeoutReader> MergingReader<R> {
    /// Wrap `inner`.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn merge(chunk: &mut MultiBuffer, extra: MultiBuffer) {
        let mut rest = MultiBuffer::new();
        let mut iter = extra.into_iter();
        if let Some(mut first) = iter.next() {
            let n = chunk.fill_last(first.bytes());
            first.slice_from(n);
            rest.push(first);
        }
        for b in iter {
            rest.push(b);
        }
        chunk.append(&mut rest);
    }
}

#[async_trait]
impl<R: TimeoutReader> Reader for MergingReader<R> {
    async fn read(&mut self) -> io::Result<Option<MultiBuffer>> {
        let Some(mut chunk) = self.inner.read().await? else {
            return Ok(None);
        };
        match self.inner.read_timeout(Duration::ZERO).await {
            Ok(Some(extra)) => Self::merge(&mut chunk, extra),
            Ok(None) | Err(_) => {}
        }
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecReader {
        chunks: Vec<MultiBuffer>,
    }

    #[async_trait]
    impl Reader for VecReader {
        async fn read(&mut self) -> io::Result<Option<MultiBuffer>> {
            if self.chunks.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.chunks.remove(0)))
            }
        }
    }

    #[async_trait]
    impl TimeoutReader for VecReader {
        async fn read_timeout(&mut self, _t: Duration) -> io::Result<Option<MultiBuffer>> {
            if self.chunks.is_empty() {
                Err(io::Error::from(io::ErrorKind::TimedOut))
            } else {
                self.read().await
            }
        }
    }

    struct VecWriter {
        data: Vec<u8>,
    }

    #[async_trait]
    impl Writer for VecWriter {
        async fn write(&mut self, data: MultiBuffer) -> io::Result<()> {
            self.data.extend_from_slice(&data.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pipe_moves_everything() {
        let mut reader = VecReader {
            chunks: vec![
                MultiBuffer::from_bytes(b"hello "),
                MultiBuffer::from_bytes(b"world"),
            ],
        };
        let mut writer = VecWriter { data: Vec::new() };
        let n = pipe(&mut reader, &mut writer).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(writer.data, b"hello world");
    }

    #[tokio::test]
    async fn test_merging_reader_folds_pending_chunk() {
        let mut reader = MergingReader::new(VecReader {
            chunks: vec![
                MultiBuffer::from_bytes(b"first"),
                MultiBuffer::from_bytes(b"+second"),
            ],
        });
        let chunk = reader.read().await.unwrap().unwrap();
        assert_eq!(chunk.to_vec(), b"first+second");
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_copy_from_reader_drains() {
        let mut reader = VecReader {
            chunks: vec![
                MultiBuffer::from_bytes(b"one"),
                MultiBuffer::from_bytes(b"two"),
                MultiBuffer::from_bytes(b"three"),
            ],
        };
        let all = copy_from_reader(&mut reader).await.unwrap();
        assert_eq!(all.to_vec(), b"onetwothree");
    }

    #[tokio::test]
    async fn test_merging_reader_single_chunk() {
        let mut reader = MergingReader::new(VecReader {
            chunks: vec![MultiBuffer::from_bytes(b"alone")],
        });
        let chunk = reader.read().await.unwrap().unwrap();
        assert_eq!(chunk.to_vec(), b"alone");
    }
}
