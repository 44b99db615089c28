use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Splits a child pipe into lines.
///
/// Unlike `AsyncBufReadExt::lines`, invalid UTF-8 does not end the stream:
/// game servers print whatever their locale produces, so bytes are decoded
/// lossily. Trailing `\n` and `\r\n` are stripped.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(256),
        }
    }

    /// `Ok(None)` once the pipe is closed.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_and_strips_line_endings() {
        let data: &[u8] = b"first\r\nsecond\nno newline";
        let mut r = LineReader::new(data);
        assert_eq!(r.next_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(r.next_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(r.next_line().await.unwrap().as_deref(), Some("no newline"));
        assert_eq!(r.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let data: &[u8] = b"caf\xe9\nok\n";
        let mut r = LineReader::new(data);
        let first = r.next_line().await.unwrap().unwrap();
        assert!(first.starts_with("caf"));
        assert!(first.contains('\u{fffd}'));
        assert_eq!(r.next_line().await.unwrap().as_deref(), Some("ok"));
    }
}
