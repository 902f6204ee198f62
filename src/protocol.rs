//! ESL wire framing: header-block and body reads, header-value extraction.

use std::io;

use percent_encoding::percent_decode_str;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::constants::HEADER_CONTENT_LENGTH;
use crate::error::{EslError, EslResult};

/// Read one header block: `\n`-terminated lines up to (and excluding) the
/// first line whose trimmed length is zero. Returned lines keep their
/// trailing `\n`.
///
/// EOF before the blank line surfaces as an `UnexpectedEof` I/O error; the
/// caller tears the connection down on any failure here.
pub(crate) async fn read_headers<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed while reading headers",
            ));
        }
        if line
            .iter()
            .all(|b| b.is_ascii_whitespace())
        {
            break;
        }
        header.push_str(&String::from_utf8_lossy(&line));
    }

    Ok(header)
}

/// Read exactly `len` body bytes. A short read is fatal for the session and
/// surfaces as an `UnexpectedEof` I/O error.
pub(crate) async fn read_body<R>(reader: &mut R, len: usize) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read one frame: a header block plus, when the block carries
/// `Content-Length`, a body of exactly that many bytes.
pub(crate) async fn read_frame<R>(reader: &mut R) -> EslResult<(String, Option<String>)>
where
    R: AsyncBufRead + Unpin,
{
    let header = read_headers(reader).await?;
    if !header.contains(HEADER_CONTENT_LENGTH) {
        return Ok((header, None));
    }

    let raw_len = header_val(&header, HEADER_CONTENT_LENGTH);
    let len: usize = raw_len
        .parse()
        .map_err(|_| EslError::InvalidContentLength { value: raw_len })?;
    let body = read_body(reader, len).await?;
    Ok((header, Some(body)))
}

/// Extract the value of a named header from anywhere in a header block.
///
/// Finds the first occurrence of `name`, bounds the line at the next `\n`
/// (or end of block), splits at the first `": "` and trims the value.
/// Returns the empty string when the header is absent or malformed.
pub(crate) fn header_val(headers: &str, name: &str) -> String {
    let Some(start) = headers.find(name) else {
        return String::new();
    };
    let rest = &headers[start..];
    let line = match rest.find('\n') {
        Some(end) => &rest[..end],
        None => rest,
    };
    match line.split_once(": ") {
        Some((_, value)) => value
            .trim()
            .to_string(),
        None => String::new(),
    }
}

/// Percent-decode a header value. FreeSWITCH URL-encodes event header
/// values; on decode failure the original value is kept.
pub(crate) fn url_decode(value: &str) -> String {
    percent_decode_str(value)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| value.to_string())
}
