//! Start-position resolution for an input.

use std::io::{self, SeekFrom};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeek, AsyncSeekExt};

/// Where following begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// Only lines appended after startup.
    End,
    /// Skip this many complete lines from the start of the file.
    Line(u64),
}

impl SeekPosition {
    /// Negative or absent line numbers mean "from the end".
    pub fn from_line_number(line: Option<i64>) -> Self {
        match line {
            Some(n) if n >= 0 => SeekPosition::Line(n as u64),
            _ => SeekPosition::End,
        }
    }
}

/// Computes the byte offset where following should begin.
///
/// Lines are split on `\n` exactly like the tailer does, so terminators
/// (including a preceding `\r`) count towards the offset. A file shorter than
/// the requested line yields its end-of-file offset.
pub async fn resolve_offset<R>(reader: &mut R, start: SeekPosition) -> io::Result<u64>
where
    R: AsyncBufRead + AsyncSeek + Unpin,
{
    match start {
        SeekPosition::End => reader.seek(SeekFrom::End(0)).await,
        SeekPosition::Line(lines) => {
            reader.seek(SeekFrom::Start(0)).await?;
            let mut offset = 0u64;
            let mut consumed = 0u64;
            let mut scratch = Vec::new();
            while consumed < lines {
                scratch.clear();
                let n = reader.read_until(b'\n', &mut scratch).await?;
                if n == 0 {
                    break;
                }
                offset += n as u64;
                consumed += 1;
            }
            Ok(offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    const CONTENT: &[u8] = b"first\nsecond line\r\nthird\n";

    #[tokio::test]
    async fn end_position_is_file_length() {
        let mut reader = Cursor::new(CONTENT.to_vec());
        let offset = resolve_offset(&mut reader, SeekPosition::End).await.unwrap();
        assert_eq!(offset, CONTENT.len() as u64);
    }

    #[tokio::test]
    async fn line_offset_sums_line_lengths_with_terminators() {
        let mut reader = Cursor::new(CONTENT.to_vec());
        assert_eq!(resolve_offset(&mut reader, SeekPosition::Line(0)).await.unwrap(), 0);
        assert_eq!(resolve_offset(&mut reader, SeekPosition::Line(1)).await.unwrap(), 6);
        assert_eq!(resolve_offset(&mut reader, SeekPosition::Line(2)).await.unwrap(), 19);
        // idempotent on an unchanged file
        assert_eq!(resolve_offset(&mut reader, SeekPosition::Line(2)).await.unwrap(), 19);
    }

    #[tokio::test]
    async fn short_file_resolves_to_end() {
        let mut reader = Cursor::new(CONTENT.to_vec());
        let offset = resolve_offset(&mut reader, SeekPosition::Line(10)).await.unwrap();
        assert_eq!(offset, CONTENT.len() as u64);

        let mut partial = Cursor::new(b"one\ntwo".to_vec());
        let offset = resolve_offset(&mut partial, SeekPosition::Line(5)).await.unwrap();
        assert_eq!(offset, 7);
    }

    #[tokio::test]
    async fn works_on_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, CONTENT).unwrap();

        let file = tokio::fs::File::open(&path).await.unwrap();
        let mut reader = BufReader::new(file);
        let offset = resolve_offset(&mut reader, SeekPosition::Line(1)).await.unwrap();
        assert_eq!(offset, 6);
    }

    #[test]
    fn negative_line_numbers_mean_end() {
        assert_eq!(SeekPosition::from_line_number(None), SeekPosition::End);
        assert_eq!(SeekPosition::from_line_number(Some(-1)), SeekPosition::End);
        assert_eq!(SeekPosition::from_line_number(Some(3)), SeekPosition::Line(3));
    }
}
