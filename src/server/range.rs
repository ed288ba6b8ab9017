//! `Range: bytes=<start>-<end>?` handling for the stream server.
//!
//! Only a single range with an explicit start is understood. Suffix ranges
//! (`bytes=-500`) and other units are treated as malformed and the whole file
//! is served instead.

/// What to send for a request, given the file length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable `Range` header: `200` with the whole file.
    Full,
    /// `206` with the inclusive span `start..=end`.
    Partial { start: u64, end: u64 },
    /// `416`.
    Unsatisfiable,
}

impl RangeRequest {
    /// Number of body bytes this request produces for a file of `len` bytes.
    pub fn body_len(&self, len: u64) -> u64 {
        match *self {
            RangeRequest::Full => len,
            RangeRequest::Partial { start, end } => end - start + 1,
            RangeRequest::Unsatisfiable => 0,
        }
    }

    pub fn content_range(&self, len: u64) -> Option<String> {
        match *self {
            RangeRequest::Full => None,
            RangeRequest::Partial { start, end } => Some(format!("bytes {}-{}/{}", start, end, len)),
            RangeRequest::Unsatisfiable => Some(format!("bytes */{}", len)),
        }
    }
}

pub fn parse_range(header: Option<&str>, len: u64) -> RangeRequest {
    let Some(header) = header else {
        return RangeRequest::Full;
    };

    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeRequest::Full;
    };

    // Multiple ranges are not supported; the first one wins.
    let first = spec.split(',').next().unwrap_or("").trim();
    let Some((start_s, end_s)) = first.split_once('-') else {
        return RangeRequest::Full;
    };

    if !is_digits(start_s) || !(end_s.is_empty() || is_digits(end_s)) {
        return RangeRequest::Full;
    }

    let Ok(start) = start_s.parse::<u64>() else {
        return RangeRequest::Unsatisfiable;
    };

    let end = if end_s.is_empty() {
        match len.checked_sub(1) {
            Some(last) => last,
            None => return RangeRequest::Unsatisfiable,
        }
    } else {
        match end_s.parse::<u64>() {
            Ok(end) => end,
            Err(_) => return RangeRequest::Unsatisfiable,
        }
    };

    if start >= len || end >= len || end < start {
        return RangeRequest::Unsatisfiable;
    }

    RangeRequest::Partial { start, end }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
